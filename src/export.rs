//! Final artifacts of a training run.
//!
//! The best checkpoint is reloaded into a fresh model and written twice: a
//! native full-precision snapshot that `burn` loads directly, and a JSON
//! manifest that any runtime can read. The manifest carries every named tensor
//! with its shape, plus the input/output signature obtained by running the
//! model once on a zero-valued input of the configured image size.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use burn::{module::Param, prelude::*};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    augment::AugmentationConfig,
    checkpoint::{load_snapshot, save_snapshot, snapshot_file},
    error::{PipelineError, Result},
    model::ImageClassifier,
};

pub const NATIVE_SNAPSHOT: &str = "model";
pub const INTERCHANGE_MANIFEST: &str = "model.json";
pub const INTERCHANGE_FORMAT: &str = "named-tensor-manifest";
pub const INTERCHANGE_VERSION: u32 = 1;

pub fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Modules that can enumerate their tensors under stable dotted names.
pub trait NamedTensors<B: Backend> {
    fn collect_tensors(&self, prefix: &str, sink: &mut TensorSink);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct TensorSink {
    entries: Vec<TensorEntry>,
}

impl TensorSink {
    pub fn push<B: Backend, const D: usize>(&mut self, name: String, tensor: Tensor<B, D>) {
        let shape = tensor.dims().to_vec();
        let data = tensor.into_data().iter::<f32>().collect();
        self.entries.push(TensorEntry { name, shape, data });
    }

    pub fn param<B: Backend, const D: usize>(
        &mut self,
        prefix: &str,
        name: &str,
        param: &Param<Tensor<B, D>>,
    ) {
        self.push(scoped(prefix, name), param.val());
    }

    pub fn entries(&self) -> &[TensorEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<TensorEntry> {
        self.entries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterchangeManifest {
    pub format: String,
    pub version: u32,
    pub class_names: Vec<String>,
    pub input: TensorSpec,
    pub output: TensorSpec,
    pub normalization: Normalization,
    pub tensors: Vec<TensorEntry>,
}

#[derive(Debug, Clone)]
pub struct ExportArtifacts {
    pub native: PathBuf,
    pub interchange: PathBuf,
}

pub struct Exporter {
    artifact_dir: PathBuf,
    image_size: usize,
    normalization: Normalization,
    class_names: Vec<String>,
}

impl Exporter {
    pub fn new(
        artifact_dir: impl Into<PathBuf>,
        augmentation: &AugmentationConfig,
        class_names: Vec<String>,
    ) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            image_size: augmentation.image_size,
            normalization: Normalization {
                mean: augmentation.mean,
                std: augmentation.std,
            },
            class_names,
        }
    }

    /// Loads the checkpoint into `template` and writes both artifacts.
    ///
    /// Returns the reloaded model so callers can keep using the exact
    /// parameters that were exported.
    pub fn export<B, M>(
        &self,
        template: M,
        checkpoint: &Path,
        device: &B::Device,
    ) -> Result<(M, ExportArtifacts)>
    where
        B: Backend,
        M: ImageClassifier<B> + NamedTensors<B>,
    {
        let checkpoint_file = snapshot_file(checkpoint);
        if !checkpoint_file.is_file() {
            return Err(PipelineError::Export(format!(
                "no checkpoint at '{}', training never completed an epoch",
                checkpoint_file.display()
            )));
        }

        let model = load_snapshot::<B, M>(template, checkpoint, device)?;
        fs::create_dir_all(&self.artifact_dir)?;

        let native = self.artifact_dir.join(NATIVE_SNAPSHOT);
        save_snapshot::<B, M>(model.clone(), &native)?;

        let interchange = self.artifact_dir.join(INTERCHANGE_MANIFEST);
        let manifest = self.trace::<B, M>(&model, device);
        write_json_atomic(&interchange, &manifest)?;

        let artifacts = ExportArtifacts {
            native: snapshot_file(&native),
            interchange,
        };
        info!(
            native = %artifacts.native.display(),
            interchange = %artifacts.interchange.display(),
            tensors = manifest.tensors.len(),
            "exported best model"
        );

        Ok((model, artifacts))
    }

    fn trace<B, M>(&self, model: &M, device: &B::Device) -> InterchangeManifest
    where
        B: Backend,
        M: ImageClassifier<B> + NamedTensors<B>,
    {
        let input_shape = [1, 3, self.image_size, self.image_size];
        let output = model.forward(Tensor::<B, 4>::zeros(input_shape, device));

        let mut sink = TensorSink::default();
        model.collect_tensors("", &mut sink);

        InterchangeManifest {
            format: INTERCHANGE_FORMAT.to_owned(),
            version: INTERCHANGE_VERSION,
            class_names: self.class_names.clone(),
            input: TensorSpec {
                name: "input".to_owned(),
                shape: input_shape.to_vec(),
            },
            output: TensorSpec {
                name: "output".to_owned(),
                shape: output.dims().to_vec(),
            },
            normalization: self.normalization.clone(),
            tensors: sink.into_entries(),
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let staging = path.with_extension("partial");
    {
        let mut writer = BufWriter::new(File::create(&staging)?);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    fs::rename(&staging, path)?;

    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<InterchangeManifest> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
