use burn::prelude::*;
use nn::{
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
};
use tracing::{info, warn};

use crate::{
    checkpoint::load_snapshot,
    error,
    export::{scoped, NamedTensors, TensorSink},
    module::{
        conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
        inverted_residual::{InvertedResidual, InvertedResidualConfig},
    },
    CLASS_COUNT,
};

const INVERTED_RESIDUAL_SETTINGS: [[usize; 4]; 7] = [
    // t = expansion factor, c = channels, n = blocks, s = stride of the first block
    // t, c, n, s
    [1, 16, 1, 1],
    [6, 24, 2, 2],
    [6, 32, 3, 2],
    [6, 64, 4, 2],
    [6, 96, 3, 1],
    [6, 160, 3, 2],
    [6, 320, 1, 1],
];

const STEM_WIDTH: usize = 32;

/// Width of the pooled feature vector fed to the classification head.
pub const FEATURE_WIDTH: usize = 1280;

/// Anything that maps a `[batch, 3, height, width]` image tensor to
/// `[batch, classes]` logits.
pub trait ImageClassifier<B: Backend>: Module<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

#[derive(Module, Debug)]
struct Classifier<B: Backend> {
    dropout: Dropout,
    linear: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(x);
        self.linear.forward(x)
    }
}

#[derive(Module, Debug)]
enum FeatureBlock<B: Backend> {
    Conv(Conv2dNorm<B>),
    InvertedResidual(InvertedResidual<B>),
}

impl<B: Backend> FeatureBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            FeatureBlock::Conv(conv) => conv.forward(x),
            FeatureBlock::InvertedResidual(block) => block.forward(x),
        }
    }

    fn collect_tensors(&self, prefix: &str, sink: &mut TensorSink) {
        match self {
            FeatureBlock::Conv(conv) => conv.collect_tensors(prefix, sink),
            FeatureBlock::InvertedResidual(block) => block.collect_tensors(prefix, sink),
        }
    }
}

/// Pretrained MobileNetV2 feature extractor.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    blocks: Vec<FeatureBlock<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn init(device: &B::Device) -> Self {
        let mut channels = STEM_WIDTH;
        let mut blocks = vec![FeatureBlock::Conv(
            Conv2dNormConfig::new(
                [3, channels],
                [3, 3],
                [2, 2],
                PaddingConfig2d::Explicit(1, 1),
            )
            .init(device),
        )];

        for [t, c, n, s] in INVERTED_RESIDUAL_SETTINGS {
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                blocks.push(FeatureBlock::InvertedResidual(
                    InvertedResidualConfig::new([channels, c], [stride, stride], t).init(device),
                ));
                channels = c;
            }
        }

        blocks.push(FeatureBlock::Conv(
            Conv2dNormConfig::new(
                [channels, FEATURE_WIDTH],
                [1, 1],
                [1, 1],
                PaddingConfig2d::Valid,
            )
            .init(device),
        ));

        Self { blocks }
    }
}

/// Backbone with its ImageNet head replaced by a two-way linear classifier.
#[derive(Module, Debug)]
pub struct TransferModel<B: Backend> {
    backbone: Backbone<B>,
    avg_pool: AdaptiveAvgPool2d,
    classifier: Classifier<B>,
}

impl<B: Backend> ImageClassifier<B> for TransferModel<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.backbone.forward(images);
        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);

        self.classifier.forward(x)
    }
}

impl<B: Backend> NamedTensors<B> for TransferModel<B> {
    fn collect_tensors(&self, prefix: &str, sink: &mut TensorSink) {
        for (index, block) in self.backbone.blocks.iter().enumerate() {
            block.collect_tensors(&scoped(prefix, &format!("{FEATURES}.{index}")), sink);
        }

        let head = scoped(prefix, &format!("{CLASSIFIER}.linear"));
        sink.param(&head, "weight", &self.classifier.linear.weight);
        if let Some(bias) = &self.classifier.linear.bias {
            sink.param(&head, "bias", bias);
        }
    }
}

impl<B: Backend> TransferModel<B> {
    /// Disables gradients on every group the plan marks frozen.
    pub fn apply_plan(self, plan: &FreezePlan) -> Self {
        let blocks = self
            .backbone
            .blocks
            .into_iter()
            .enumerate()
            .map(|(index, block)| match plan.block(index) {
                Trainability::Frozen => block.no_grad(),
                Trainability::Trainable => block,
            })
            .collect();

        let classifier = match plan.head() {
            Trainability::Frozen => self.classifier.no_grad(),
            Trainability::Trainable => self.classifier,
        };

        Self {
            backbone: Backbone { blocks },
            avg_pool: self.avg_pool,
            classifier,
        }
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    /// (frozen, trainable) parameter counts under `plan`.
    pub fn parameter_split(&self, plan: &FreezePlan) -> (usize, usize) {
        let mut frozen = 0;
        let mut trainable = 0;

        for (index, block) in self.backbone.blocks.iter().enumerate() {
            match plan.block(index) {
                Trainability::Frozen => frozen += block.num_params(),
                Trainability::Trainable => trainable += block.num_params(),
            }
        }
        match plan.head() {
            Trainability::Frozen => frozen += self.classifier.num_params(),
            Trainability::Trainable => trainable += self.classifier.num_params(),
        }

        (frozen, trainable)
    }
}

const FEATURES: &str = "features";
const CLASSIFIER: &str = "classifier";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trainability {
    Frozen,
    Trainable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerGroup {
    pub name: String,
    pub trainability: Trainability,
}

/// Named frozen/trainable decision for every layer group, fixed when the
/// model is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezePlan {
    blocks: Vec<LayerGroup>,
    head: LayerGroup,
}

impl FreezePlan {
    /// Freezes every feature block except the last `trainable_blocks`; the
    /// head is always trainable.
    pub fn fine_tune_last(block_count: usize, trainable_blocks: usize) -> Self {
        let first_trainable = block_count.saturating_sub(trainable_blocks);
        let blocks = (0..block_count)
            .map(|index| LayerGroup {
                name: format!("{FEATURES}.{index}"),
                trainability: if index < first_trainable {
                    Trainability::Frozen
                } else {
                    Trainability::Trainable
                },
            })
            .collect();

        Self {
            blocks,
            head: LayerGroup {
                name: CLASSIFIER.to_owned(),
                trainability: Trainability::Trainable,
            },
        }
    }

    pub fn block(&self, index: usize) -> Trainability {
        self.blocks
            .get(index)
            .map_or(Trainability::Frozen, |group| group.trainability)
    }

    pub fn head(&self) -> Trainability {
        self.head.trainability
    }

    pub fn groups(&self) -> impl Iterator<Item = &LayerGroup> {
        self.blocks.iter().chain(std::iter::once(&self.head))
    }

    pub fn trainable_groups(&self) -> Vec<&str> {
        self.groups()
            .filter(|group| group.trainability == Trainability::Trainable)
            .map(|group| group.name.as_str())
            .collect()
    }
}

#[derive(Config, Debug)]
pub struct TransferModelConfig {
    #[config(default = 0.2)]
    pub dropout: f64,

    /// Number of trailing feature blocks fine-tuned along with the head.
    #[config(default = 3)]
    pub trainable_blocks: usize,

    /// Backbone weights saved as a full-precision named MessagePack record.
    #[config(default = "None")]
    pub pretrained_backbone: Option<String>,
}

impl TransferModelConfig {
    /// Builds the architecture with fresh weights and the freeze plan applied.
    pub fn init<B: Backend>(&self, device: &B::Device) -> TransferModel<B> {
        let model = TransferModel {
            backbone: Backbone::init(device),
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            classifier: Classifier {
                dropout: DropoutConfig::new(self.dropout).init(),
                linear: LinearConfig::new(FEATURE_WIDTH, CLASS_COUNT).init(device),
            },
        };
        let plan = self.freeze_plan(model.backbone.block_count());

        model.apply_plan(&plan)
    }

    /// Like [`init`](Self::init), with backbone weights loaded from
    /// `pretrained_backbone` when configured.
    pub fn init_pretrained<B: Backend>(
        &self,
        device: &B::Device,
    ) -> error::Result<TransferModel<B>> {
        let model = self.init::<B>(device);

        let Some(path) = &self.pretrained_backbone else {
            warn!("no pretrained backbone configured, fine-tuning from random weights");
            return Ok(model);
        };

        let backbone =
            load_snapshot::<B, Backbone<B>>(model.backbone, std::path::Path::new(path), device)?;
        info!(path = %path, "loaded pretrained backbone");

        let plan = self.freeze_plan(backbone.block_count());
        let model = TransferModel { backbone, ..model };

        Ok(model.apply_plan(&plan))
    }

    pub fn freeze_plan(&self, block_count: usize) -> FreezePlan {
        FreezePlan::fine_tune_last(block_count, self.trainable_blocks)
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        nn::loss::CrossEntropyLossConfig,
        optim::{AdamWConfig, GradientsParams, Optimizer},
        tensor::Distribution,
    };

    use super::*;
    use crate::{
        checkpoint::save_snapshot,
        error::PipelineError,
        test_utils::{labels, TestAutodiffBackend, TestBackend},
    };

    fn tensor<'a>(sink: &'a TensorSink, name: &str) -> &'a [f32] {
        &sink
            .entries()
            .iter()
            .find(|entry| entry.name == name)
            .unwrap_or_else(|| panic!("missing tensor {name}"))
            .data
    }

    #[test]
    fn produces_two_logits_per_image() {
        let device = Default::default();
        let model = TransferModelConfig::new().init::<TestBackend>(&device);

        let logits = model.forward(Tensor::zeros([2, 3, 32, 32], &device));

        assert_eq!(logits.dims(), [2, CLASS_COUNT]);
        assert_eq!(model.backbone().block_count(), 19);
    }

    #[test]
    fn plan_freezes_all_but_last_blocks() {
        let plan = FreezePlan::fine_tune_last(19, 3);

        assert_eq!(plan.block(0), Trainability::Frozen);
        assert_eq!(plan.block(15), Trainability::Frozen);
        assert_eq!(plan.block(16), Trainability::Trainable);
        assert_eq!(plan.block(18), Trainability::Trainable);
        assert_eq!(plan.head(), Trainability::Trainable);
        assert_eq!(
            plan.trainable_groups(),
            ["features.16", "features.17", "features.18", "classifier"]
        );
    }

    #[test]
    fn plan_with_more_trainable_blocks_than_exist_unfreezes_everything() {
        let plan = FreezePlan::fine_tune_last(4, 10);

        assert!(plan.groups().all(|g| g.trainability == Trainability::Trainable));
    }

    #[test]
    fn parameter_split_covers_every_parameter() {
        let device = Default::default();
        let config = TransferModelConfig::new();
        let model = config.init::<TestBackend>(&device);
        let plan = config.freeze_plan(model.backbone().block_count());

        let (frozen, trainable) = model.parameter_split(&plan);

        assert_eq!(frozen + trainable, model.num_params());
        assert!(trainable >= FEATURE_WIDTH * CLASS_COUNT);
    }

    /// Takes one AdamW step and checks that the frozen stem stays put while
    /// the head and the last block move.
    fn assert_step_moves_only_trainable_groups(model: TransferModel<TestAutodiffBackend>) {
        let device = Default::default();
        let mut before = TensorSink::default();
        model.collect_tensors("", &mut before);

        let images = Tensor::random([2, 3, 16, 16], Distribution::Default, &device);
        let targets = labels::<TestAutodiffBackend>(&[0, 1], &device);
        let logits = model.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, targets);

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let mut optimizer = AdamWConfig::new()
            .init::<TestAutodiffBackend, TransferModel<TestAutodiffBackend>>();
        let model = optimizer.step(1.0e-2, model, grads);

        let mut after = TensorSink::default();
        model.collect_tensors("", &mut after);

        let stem = "features.0.conv.weight";
        assert_eq!(tensor(&before, stem), tensor(&after, stem));
        let head = "classifier.linear.weight";
        assert_ne!(tensor(&before, head), tensor(&after, head));
        let last = "features.18.conv.weight";
        assert_ne!(tensor(&before, last), tensor(&after, last));
    }

    #[test]
    fn optimizer_step_only_moves_trainable_groups() {
        let device = Default::default();
        let model = TransferModelConfig::new()
            .with_dropout(0.0)
            .init::<TestAutodiffBackend>(&device);

        assert_step_moves_only_trainable_groups(model);
    }

    #[test]
    fn pretrained_backbone_is_loaded_and_stays_frozen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone");
        let device = Default::default();

        let source = TransferModelConfig::new().init::<TestBackend>(&device);
        save_snapshot::<TestBackend, _>(source.backbone().clone(), &path).unwrap();
        let mut expected = TensorSink::default();
        source.collect_tensors("", &mut expected);

        let model = TransferModelConfig::new()
            .with_dropout(0.0)
            .with_pretrained_backbone(Some(path.to_string_lossy().into_owned()))
            .init_pretrained::<TestAutodiffBackend>(&device)
            .unwrap();
        let mut loaded = TensorSink::default();
        model.collect_tensors("", &mut loaded);

        for name in ["features.0.conv.weight", "features.18.conv.weight"] {
            assert_eq!(tensor(&expected, name), tensor(&loaded, name));
        }

        assert_step_moves_only_trainable_groups(model);
    }

    #[test]
    fn missing_pretrained_backbone_is_a_recorder_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");

        let result = TransferModelConfig::new()
            .with_pretrained_backbone(Some(missing.to_string_lossy().into_owned()))
            .init_pretrained::<TestBackend>(&Default::default());

        assert!(matches!(result, Err(PipelineError::Recorder(_))));
    }
}
