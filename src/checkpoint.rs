use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};
use tracing::{debug, info};

use crate::error::Result;

pub type SnapshotRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

const SNAPSHOT_EXTENSION: &str = "mpk";

/// File actually written by the recorder for a snapshot path.
pub fn snapshot_file(path: &Path) -> PathBuf {
    path.with_extension(SNAPSHOT_EXTENSION)
}

/// Writes to a sibling staging file first, so `path` is either the previous
/// snapshot or the new one, never a partial write.
pub fn save_snapshot<B: Backend, M: Module<B>>(model: M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = path.with_file_name(format!("{stem}-partial"));

    model.save_file(&staging, &SnapshotRecorder::new())?;
    fs::rename(snapshot_file(&staging), snapshot_file(path))?;

    Ok(())
}

pub fn load_snapshot<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    Ok(model.load_file(snapshot_file(path), &SnapshotRecorder::new(), device)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Improved,
    NotImproved,
}

/// Keeps the single best-validation snapshot and the early-stopping counter.
#[derive(Debug)]
pub struct CheckpointController {
    path: PathBuf,
    patience: usize,
    best_loss: Option<f64>,
    stale_epochs: usize,
}

impl CheckpointController {
    pub fn new(path: impl Into<PathBuf>, patience: usize) -> Self {
        Self {
            path: path.into(),
            patience,
            best_loss: None,
            stale_epochs: 0,
        }
    }

    pub fn observe<B: Backend, M: Module<B>>(
        &mut self,
        valid_loss: f64,
        model: &M,
    ) -> Result<Observation> {
        let improved = self.best_loss.map_or(true, |best| valid_loss < best);

        if !improved {
            self.stale_epochs += 1;
            debug!(
                valid_loss,
                best = self.best_loss,
                stale = self.stale_epochs,
                patience = self.patience,
                "validation loss did not improve"
            );
            return Ok(Observation::NotImproved);
        }

        save_snapshot::<B, M>(model.clone(), &self.path)?;
        info!(
            "Saved best model (val_loss: {:.4}) to {}",
            valid_loss,
            self.file().display()
        );
        self.best_loss = Some(valid_loss);
        self.stale_epochs = 0;

        Ok(Observation::Improved)
    }

    pub fn should_stop(&self) -> bool {
        self.stale_epochs >= self.patience
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn file(&self) -> PathBuf {
        snapshot_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{weights, TestBackend, TinyClassifier};

    #[test]
    fn first_observation_always_saves() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut controller = CheckpointController::new(dir.path().join("checkpoint"), 3);

        let model = TinyClassifier::<TestBackend>::new(&device);
        let observation = controller
            .observe::<TestBackend, _>(f64::MAX, &model)
            .unwrap();

        assert_eq!(observation, Observation::Improved);
        assert!(controller.file().is_file());
        assert_eq!(controller.best_loss(), Some(f64::MAX));
    }

    #[test]
    fn saved_losses_strictly_decrease() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut controller = CheckpointController::new(dir.path().join("checkpoint"), 10);
        let model = TinyClassifier::<TestBackend>::new(&device);

        let losses = [0.9, 0.7, 0.7, 0.8, 0.5, 0.6, 0.5, 0.2];
        let mut saved = Vec::new();
        for loss in losses {
            if controller.observe::<TestBackend, _>(loss, &model).unwrap()
                == Observation::Improved
            {
                saved.push(loss);
            }
        }

        assert_eq!(saved, vec![0.9, 0.7, 0.5, 0.2]);
        assert!(saved.windows(2).all(|pair| pair[1] < pair[0]));
    }

    #[test]
    fn stops_exactly_at_patience() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut controller = CheckpointController::new(dir.path().join("checkpoint"), 3);
        let model = TinyClassifier::<TestBackend>::new(&device);

        controller.observe::<TestBackend, _>(1.0, &model).unwrap();
        for stale in 1..=3 {
            assert!(!controller.should_stop());
            controller.observe::<TestBackend, _>(1.0 + stale as f64, &model).unwrap();
            assert_eq!(controller.stale_epochs, stale);
        }
        assert!(controller.should_stop());
    }

    #[test]
    fn improvement_resets_counter_and_overwrites_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut controller = CheckpointController::new(dir.path().join("checkpoint"), 2);

        let first = TinyClassifier::<TestBackend>::new(&device);
        let second = TinyClassifier::<TestBackend>::new(&device);
        controller.observe::<TestBackend, _>(0.6, &first).unwrap();
        controller.observe::<TestBackend, _>(0.7, &first).unwrap();
        controller.observe::<TestBackend, _>(0.4, &second).unwrap();

        assert_eq!(controller.stale_epochs, 0);
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);

        let restored = load_snapshot::<TestBackend, _>(
            TinyClassifier::new(&device),
            &controller.path,
            &device,
        )
        .unwrap();
        assert_eq!(weights(&restored), weights(&second));
    }
}
