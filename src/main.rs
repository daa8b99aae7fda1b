use std::path::Path;

use anyhow::anyhow;
use burn::{backend::Autodiff, config::Config, optim::AdamWConfig};
use mobilenet_transfer::{
    augment::AugmentationConfig,
    device::{Accelerator, CpuBackend, GpuBackend},
    logging,
    model::TransferModelConfig,
    optim::PlateauConfig,
    training::{train, TrainingConfig},
};
use tracing::info;

const CONFIG_OVERRIDE: &str = "training.json";

fn load_config() -> anyhow::Result<TrainingConfig> {
    let path = Path::new(CONFIG_OVERRIDE);
    if path.is_file() {
        info!("Loading training configuration from {CONFIG_OVERRIDE}");
        return TrainingConfig::load(path)
            .map_err(|err| anyhow!("invalid {CONFIG_OVERRIDE}: {err}"));
    }

    Ok(TrainingConfig::new(
        "laindb".to_owned(),
        "artifact".to_owned(),
        TransferModelConfig::new(),
        AdamWConfig::new().with_weight_decay(1.0e-4),
        AugmentationConfig::new(),
        PlateauConfig::new(),
    ))
}

fn main() -> anyhow::Result<()> {
    logging::init()?;

    let config = load_config()?;
    let summary = match Accelerator::resolve(config.accelerate) {
        Accelerator::Gpu(device) => train::<Autodiff<GpuBackend>>(&config, &device)?,
        Accelerator::Cpu(device) => train::<Autodiff<CpuBackend>>(&config, &device)?,
    };

    info!(
        state = ?summary.state,
        epochs = summary.epochs,
        best_valid_loss = ?summary.best_valid_loss,
        classes = ?summary.class_names,
        "training finished"
    );
    println!(
        "Training complete. Model saved as {} and exported to {}",
        summary.artifacts.native.display(),
        summary.artifacts.interchange.display()
    );

    Ok(())
}
