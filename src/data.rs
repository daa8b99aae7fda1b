use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use image::{imageops::FilterType, DynamicImage, ImageReader, RgbImage};
use ndarray::Array3;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::{
    error::{PipelineError, Result},
    CLASS_COUNT,
};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|err| {
        PipelineError::Data(format!("cannot read directory '{}': {err}", dir.display()))
    })?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_image_file(path))
        .collect();
    paths.sort();

    Ok(paths)
}

/// Decodes by content, so a file whose extension lies about its format still
/// loads.
pub fn decode_image(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|err| PipelineError::decode(path, err))?
        .decode()
        .map_err(|err| PipelineError::decode(path, err))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// Labeled image files found under a dataset root.
///
/// Class subdirectories are sorted by name and labeled by position, so
/// the alphabetically first directory is class 0. Within a class, files keep
/// path order.
#[derive(Debug, Clone)]
pub struct SampleIndex {
    pub class_names: Vec<String>,
    pub samples: Vec<Sample>,
}

impl SampleIndex {
    pub fn scan(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root).map_err(|err| {
            PipelineError::Data(format!(
                "dataset root '{}' is unreadable: {err}",
                root.display()
            ))
        })?;

        let mut class_names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
            .collect();
        class_names.sort();

        if class_names.len() != CLASS_COUNT {
            return Err(PipelineError::Data(format!(
                "expected {CLASS_COUNT} class directories in '{}', found {:?}",
                root.display(),
                class_names
            )));
        }

        let mut samples = Vec::new();
        for (label, class_name) in class_names.iter().enumerate() {
            let class_dir = root.join(class_name);
            let images = list_images(&class_dir)?;
            if images.is_empty() {
                return Err(PipelineError::Data(format!(
                    "class directory '{}' contains no images",
                    class_dir.display()
                )));
            }

            debug!(class = %class_name, label, count = images.len(), "indexed class");
            samples.extend(images.into_iter().map(|path| Sample { path, label }));
        }

        info!(
            "Indexed {} images in {} classes {:?}",
            samples.len(),
            class_names.len(),
            class_names
        );

        Ok(Self {
            class_names,
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Disjoint train/validation index sets over a dataset, drawn once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
}

impl Partition {
    pub fn draw(len: usize, train_fraction: f64, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..len).collect();
        indices.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));

        let train_len = ((len as f64 * train_fraction).floor() as usize).min(len);
        let valid = indices.split_off(train_len);

        Self {
            train: indices,
            valid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageItem {
    pub image: RgbImage,
    pub label: usize,
}

/// Decoded training images, kept in memory for the whole run.
pub struct ImageStore {
    dataset: InMemDataset<ImageItem>,
}

impl Dataset<ImageItem> for ImageStore {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl ImageStore {
    /// Decodes every sample. Images larger than `max_side` are shrunk to fit,
    /// keeping their aspect ratio.
    pub fn load(index: &SampleIndex, max_side: u32) -> Result<Self> {
        let items = index
            .samples
            .iter()
            .map(|sample| {
                let image = decode_image(&sample.path)?;
                let image = if image.width().max(image.height()) > max_side {
                    image.resize(max_side, max_side, FilterType::Triangle)
                } else {
                    image
                };

                Ok(ImageItem {
                    image: image.to_rgb8(),
                    label: sample.label,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Decoded {} training images", items.len());

        Ok(Self {
            dataset: InMemDataset::new(items),
        })
    }
}

/// A transformed image and its label, ready for batching.
#[derive(Debug, Clone)]
pub struct TensorItem {
    pub pixels: Array3<f32>,
    pub label: usize,
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<TensorItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<TensorItem>) -> ImageBatch<B> {
        let (channels, height, width) = items
            .first()
            .map_or((3, 0, 0), |item| item.pixels.dim());

        let pixels: Vec<f32> = items
            .iter()
            .flat_map(|item| item.pixels.iter().copied())
            .collect();
        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();

        let images = TensorData::new(pixels, [items.len(), channels, height, width])
            .convert::<B::FloatElem>();
        let targets = TensorData::new(labels, [items.len()]).convert::<B::IntElem>();

        ImageBatch {
            images: Tensor::from_data(images, &self.device),
            targets: Tensor::from_data(targets, &self.device),
        }
    }
}
