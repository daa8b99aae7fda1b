use burn::{nn::conv::Conv2d, prelude::*};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d};

use super::conv2d_norm::{collect_conv, collect_norm, Conv2dNorm, Conv2dNormConfig};
use crate::export::{scoped, NamedTensors, TensorSink};

/// 1x1 projection back to the block's output width. No activation.
#[derive(Module, Debug)]
pub struct PointwiseLinear<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> PointwiseLinear<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        self.norm.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<Conv2dNorm<B>>,
    depthwise: Conv2dNorm<B>,
    project: PointwiseLinear<B>,

    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.depthwise.forward(x);
        let x = self.project.forward(x);

        if self.use_residual {
            input + x
        } else {
            x
        }
    }
}

impl<B: Backend> NamedTensors<B> for InvertedResidual<B> {
    fn collect_tensors(&self, prefix: &str, sink: &mut TensorSink) {
        if let Some(expand) = &self.expand {
            expand.collect_tensors(&scoped(prefix, "expand"), sink);
        }
        self.depthwise
            .collect_tensors(&scoped(prefix, "depthwise"), sink);
        collect_conv(&self.project.conv, &scoped(prefix, "project.conv"), sink);
        collect_norm(&self.project.norm, &scoped(prefix, "project.norm"), sink);
    }
}

#[derive(Config, Debug)]
pub struct InvertedResidualConfig {
    pub channels: [usize; 2],
    pub stride: [usize; 2],
    pub expand_ratio: usize,
}

impl InvertedResidualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> InvertedResidual<B> {
        let [input, output] = self.channels;
        let hidden = input * self.expand_ratio;

        let expand = (self.expand_ratio > 1).then(|| {
            Conv2dNormConfig::new([input, hidden], [1, 1], [1, 1], PaddingConfig2d::Valid)
                .init(device)
        });

        InvertedResidual {
            expand,

            depthwise: Conv2dNormConfig::new(
                [hidden, hidden],
                [3, 3],
                self.stride,
                PaddingConfig2d::Explicit(1, 1),
            )
            .with_groups(hidden)
            .init(device),

            project: PointwiseLinear {
                conv: Conv2dConfig::new([hidden, output], [1, 1])
                    .with_bias(false)
                    .init(device),
                norm: BatchNormConfig::new(output).init(device),
            },

            use_residual: self.stride == [1, 1] && input == output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestBackend;

    #[test]
    fn strided_block_halves_spatial_size() {
        let device = Default::default();
        let block = InvertedResidualConfig::new([16, 24], [2, 2], 6).init::<TestBackend>(&device);

        let output = block.forward(Tensor::zeros([2, 16, 8, 8], &device));

        assert_eq!(output.dims(), [2, 24, 4, 4]);
        assert!(!block.use_residual);
    }

    #[test]
    fn unit_ratio_skips_expansion() {
        let device = Default::default();
        let block = InvertedResidualConfig::new([32, 32], [1, 1], 1).init::<TestBackend>(&device);

        assert!(block.expand.is_none());
        assert!(block.use_residual);

        let mut sink = TensorSink::default();
        block.collect_tensors("features.1", &mut sink);
        assert!(sink
            .entries()
            .iter()
            .all(|e| !e.name.starts_with("features.1.expand")));
        assert!(sink
            .entries()
            .iter()
            .any(|e| e.name == "features.1.project.conv.weight"));
    }
}
