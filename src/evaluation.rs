use std::{
    fmt,
    path::{Path, PathBuf},
};

use burn::{config::Config, prelude::*};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    augment::{AugmentationConfig, AugmentationPipeline},
    data::{decode_image, list_images},
    error::{self, PipelineError},
    model::ImageClassifier,
    CLASS_COUNT,
};

/// A folder whose images all belong to `label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledFolder {
    pub path: String,
    pub label: usize,
}

impl LabeledFolder {
    pub fn new(path: impl Into<String>, label: usize) -> Self {
        Self {
            path: path.into(),
            label,
        }
    }
}

#[derive(Config, Debug)]
pub struct EvaluationConfig {
    /// Directory holding the exported model and the training `config.json`.
    #[config(default = "String::from(\"artifact\")")]
    pub artifact_dir: String,

    #[config(
        default = "vec![LabeledFolder::new(\"laindb/lains\", 0), LabeledFolder::new(\"laindb/nonlains\", 1)]"
    )]
    pub folders: Vec<LabeledFolder>,

    /// Display names indexed by label. Must follow the training class order.
    #[config(default = "vec![String::from(\"lain\"), String::from(\"non-lain\")]")]
    pub class_names: Vec<String>,

    #[config(default = true)]
    pub accelerate: bool,
}

impl EvaluationConfig {
    /// Checks labels and display names against the class directories the
    /// model was trained on, in training order.
    pub fn check_classes(&self, trained: &[String]) -> error::Result<()> {
        if trained.len() != CLASS_COUNT {
            return Err(PipelineError::Config(format!(
                "model was trained on {} classes, expected {CLASS_COUNT}",
                trained.len()
            )));
        }
        if self.class_names.len() != trained.len() {
            return Err(PipelineError::Config(format!(
                "{} class names given for {} trained classes {trained:?}",
                self.class_names.len(),
                trained.len()
            )));
        }
        if let Some(folder) = self.folders.iter().find(|f| f.label >= trained.len()) {
            return Err(PipelineError::Config(format!(
                "folder '{}' has label {} but only {} classes exist",
                folder.path,
                folder.label,
                trained.len()
            )));
        }

        for folder in self.label_mismatches(trained) {
            warn!(
                folder = %folder.path,
                label = folder.label,
                trained = %trained[folder.label],
                "folder name differs from the trained class directory for its label"
            );
        }

        Ok(())
    }

    /// Folders whose final path component is not the trained class directory
    /// for their label.
    pub fn label_mismatches<'a>(&'a self, trained: &[String]) -> Vec<&'a LabeledFolder> {
        self.folders
            .iter()
            .filter(|folder| {
                let name = Path::new(&folder.path)
                    .file_name()
                    .map(|name| name.to_string_lossy());
                match (name, trained.get(folder.label)) {
                    (Some(name), Some(class)) => name != class.as_str(),
                    _ => true,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Correct,
    Incorrect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRecord {
    pub path: PathBuf,
    pub predicted: usize,
    pub actual: usize,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub correct: usize,
    pub total: usize,
}

impl Tally {
    pub fn add(&mut self, other: Tally) {
        self.correct += other.correct;
        self.total += other.total;
    }

    /// Zero when nothing was scored.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct FolderReport {
    pub folder: LabeledFolder,
    pub records: Vec<EvaluationRecord>,
    /// Files that could not be decoded or classified, with the reason.
    pub failures: Vec<(PathBuf, String)>,
    pub tally: Tally,
}

#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub class_names: Vec<String>,
    pub folders: Vec<FolderReport>,
}

impl EvaluationReport {
    pub fn overall(&self) -> Tally {
        self.folders.iter().fold(Tally::default(), |mut sum, folder| {
            sum.add(folder.tally);
            sum
        })
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary:")?;
        for folder in &self.folders {
            let name = class_name(&self.class_names, folder.folder.label);
            writeln!(
                f,
                "{} ({name}): {}/{} correct",
                folder.folder.path, folder.tally.correct, folder.tally.total
            )?;
        }

        let overall = self.overall();
        write!(
            f,
            "Overall accuracy: {}/{} ({:.2}%)",
            overall.correct,
            overall.total,
            overall.percent()
        )
    }
}

fn class_name(class_names: &[String], label: usize) -> String {
    class_names
        .get(label)
        .cloned()
        .unwrap_or_else(|| label.to_string())
}

/// Runs a trained classifier over labeled folders, one image at a time.
pub struct Evaluator<B: Backend, M> {
    model: M,
    pipeline: AugmentationPipeline,
    class_names: Vec<String>,
    device: B::Device,
}

impl<B, M> Evaluator<B, M>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    pub fn new(
        model: M,
        augmentation: &AugmentationConfig,
        class_names: Vec<String>,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            pipeline: AugmentationPipeline::eval(augmentation.clone()),
            class_names,
            device,
        }
    }

    /// Predicted label for one image file.
    pub fn classify(&mut self, path: &Path) -> error::Result<usize> {
        let image = decode_image(path)?.to_rgb8();
        let pixels = self.pipeline.apply(&image);
        let (channels, height, width) = pixels.dim();

        let values: Vec<f32> = pixels.iter().copied().collect();
        let data = TensorData::new(values, [1, channels, height, width])
            .convert::<B::FloatElem>();
        let logits = self
            .model
            .forward(Tensor::<B, 4>::from_data(data, &self.device));

        let predicted: i64 = logits.argmax(1).into_scalar().elem();
        usize::try_from(predicted)
            .map_err(|_| PipelineError::decode(path, format!("invalid prediction {predicted}")))
    }

    /// Classifies every image in the folder, printing one line per file.
    /// Per-file failures are reported and left out of the tally.
    pub fn evaluate_folder(&mut self, folder: &LabeledFolder) -> error::Result<FolderReport> {
        let paths = list_images(Path::new(&folder.path))?;
        let actual = class_name(&self.class_names, folder.label);

        let mut records = Vec::with_capacity(paths.len());
        let mut failures = Vec::new();
        let mut tally = Tally::default();

        for path in paths {
            match self.classify(&path) {
                Ok(predicted) => {
                    let outcome = if predicted == folder.label {
                        tally.correct += 1;
                        Outcome::Correct
                    } else {
                        Outcome::Incorrect
                    };
                    tally.total += 1;

                    println!(
                        "{}: predicted={}, actual={} {}",
                        path.display(),
                        class_name(&self.class_names, predicted),
                        actual,
                        match outcome {
                            Outcome::Correct => "✓",
                            Outcome::Incorrect => "✗",
                        }
                    );
                    records.push(EvaluationRecord {
                        path,
                        predicted,
                        actual: folder.label,
                        outcome,
                    });
                }
                Err(err) => {
                    let message = match &err {
                        PipelineError::Decode { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    println!("{}: error ({message})", path.display());
                    warn!(path = %path.display(), "skipped unreadable image");
                    failures.push((path, message));
                }
            }
        }

        Ok(FolderReport {
            folder: folder.clone(),
            records,
            failures,
            tally,
        })
    }

    pub fn evaluate(&mut self, folders: &[LabeledFolder]) -> error::Result<EvaluationReport> {
        let folders = folders
            .iter()
            .map(|folder| {
                println!("Testing {}...", folder.path);
                let report = self.evaluate_folder(folder);
                println!();
                report
            })
            .collect::<error::Result<Vec<_>>>()?;

        Ok(EvaluationReport {
            class_names: self.class_names.clone(),
            folders,
        })
    }
}
