//! Fine-tunes a MobileNetV2 backbone into a two-class image classifier and
//! scores the result on labeled folders.

pub mod augment;
pub mod checkpoint;
pub mod data;
pub mod device;
pub mod error;
pub mod evaluation;
pub mod export;
pub mod logging;
pub mod model;
pub mod module;
pub mod optim;
pub mod training;

#[cfg(test)]
mod test_utils;

/// The classifier is strictly binary.
pub const CLASS_COUNT: usize = 2;

pub use error::{PipelineError, Result};
