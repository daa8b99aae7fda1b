//! Fixtures shared by the unit tests.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    backend::{Autodiff, NdArray},
    nn::{Linear, LinearConfig},
    prelude::*,
};
use image::{Rgb, RgbImage};

use crate::{
    export::{scoped, NamedTensors, TensorSink},
    model::ImageClassifier,
};

pub type TestBackend = NdArray<f32>;
pub type TestAutodiffBackend = Autodiff<TestBackend>;

pub fn write_image(dir: &Path, name: &str, color: [u8; 3], size: u32) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    RgbImage::from_pixel(size, size, Rgb(color))
        .save(&path)
        .unwrap();
    path
}

pub fn write_corrupt(dir: &Path, name: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, b"definitely not a png").unwrap();
    path
}

pub fn labels<B: Backend>(values: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    let data = TensorData::new(values.to_vec(), [values.len()]).convert::<B::IntElem>();
    Tensor::from_data(data, device)
}

pub fn argmax<B: Backend>(logits: Tensor<B, 2>) -> Vec<i64> {
    logits.argmax(1).into_data().iter::<i64>().collect()
}

pub fn weights<B: Backend, M: NamedTensors<B>>(model: &M) -> Vec<f32> {
    let mut sink = TensorSink::default();
    model.collect_tensors("", &mut sink);
    sink.into_entries()
        .into_iter()
        .flat_map(|entry| entry.data)
        .collect()
}

/// Channel means followed by a 3 -> 2 linear layer.
#[derive(Module, Debug)]
pub struct TinyClassifier<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> TinyClassifier<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(3, 2).init(device),
        }
    }
}

impl<B: Backend> ImageClassifier<B> for TinyClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, _, _] = images.dims();
        let pooled = images.mean_dim(3).mean_dim(2).reshape([batch, channels]);

        self.linear.forward(pooled)
    }
}

impl<B: Backend> NamedTensors<B> for TinyClassifier<B> {
    fn collect_tensors(&self, prefix: &str, sink: &mut TensorSink) {
        let prefix = scoped(prefix, "linear");
        sink.param(&prefix, "weight", &self.linear.weight);
        if let Some(bias) = &self.linear.bias {
            sink.param(&prefix, "bias", bias);
        }
    }
}

/// Predicts class 0 for images brighter than the normalization mean and
/// class 1 otherwise.
#[derive(Module, Clone, Debug)]
pub struct BrightnessClassifier;

impl<B: Backend> ImageClassifier<B> for BrightnessClassifier {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = images.dims();
        let brightness = images
            .mean_dim(3)
            .mean_dim(2)
            .mean_dim(1)
            .reshape([batch, 1]);

        Tensor::cat(vec![brightness.clone(), brightness.neg()], 1)
    }
}
