use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Dataset layout problems. Always fatal.
    #[error("data error: {0}")]
    Data(String),

    /// An image could not be opened or decoded.
    #[error("failed to decode image at '{path}': {message}")]
    Decode { path: PathBuf, message: String },

    #[error("export error: {0}")]
    Export(String),

    #[error("training diverged at epoch {epoch}: {phase} loss is {loss}")]
    NonFiniteLoss {
        epoch: usize,
        phase: &'static str,
        loss: f64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn decode(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl From<RecorderError> for PipelineError {
    fn from(err: RecorderError) -> Self {
        Self::Recorder(format!("{err:?}"))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
