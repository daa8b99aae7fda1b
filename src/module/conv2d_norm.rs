use burn::{
    nn::conv::Conv2d,
    prelude::*,
    tensor::activation::relu,
};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d};

use crate::export::{scoped, NamedTensors, TensorSink};

/// Convolution, batch norm and a ReLU6 activation.
#[derive(Module, Debug)]
pub struct Conv2dNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> Conv2dNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        relu(x).clamp_max(6)
    }
}

impl<B: Backend> NamedTensors<B> for Conv2dNorm<B> {
    fn collect_tensors(&self, prefix: &str, sink: &mut TensorSink) {
        collect_conv(&self.conv, &scoped(prefix, "conv"), sink);
        collect_norm(&self.norm, &scoped(prefix, "norm"), sink);
    }
}

pub(crate) fn collect_conv<B: Backend>(conv: &Conv2d<B>, prefix: &str, sink: &mut TensorSink) {
    sink.param(prefix, "weight", &conv.weight);
    if let Some(bias) = &conv.bias {
        sink.param(prefix, "bias", bias);
    }
}

pub(crate) fn collect_norm<B: Backend>(
    norm: &BatchNorm<B, 2>,
    prefix: &str,
    sink: &mut TensorSink,
) {
    sink.param(prefix, "gamma", &norm.gamma);
    sink.param(prefix, "beta", &norm.beta);
    sink.push(scoped(prefix, "running_mean"), norm.running_mean.value());
    sink.push(scoped(prefix, "running_var"), norm.running_var.value());
}

#[derive(Config, Debug)]
pub struct Conv2dNormConfig {
    channels: [usize; 2],

    kernel_size: [usize; 2],

    stride: [usize; 2],

    padding: PaddingConfig2d,

    #[config(default = "1")]
    groups: usize,
}

impl Conv2dNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv2dNorm<B> {
        Conv2dNorm {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_stride(self.stride)
                .with_padding(self.padding.clone())
                .with_groups(self.groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
        }
    }
}
