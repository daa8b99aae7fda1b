use std::path::Path;

use anyhow::anyhow;
use burn::{config::Config, prelude::Backend};
use mobilenet_transfer::{
    checkpoint::load_snapshot,
    device::{Accelerator, CpuBackend, GpuBackend},
    evaluation::{EvaluationConfig, EvaluationReport, Evaluator},
    export::{read_manifest, INTERCHANGE_MANIFEST, NATIVE_SNAPSHOT},
    logging,
    training::{TrainingConfig, CONFIG_FILE},
};
use tracing::info;

const CONFIG_OVERRIDE: &str = "evaluation.json";

fn load_config() -> anyhow::Result<EvaluationConfig> {
    let path = Path::new(CONFIG_OVERRIDE);
    if !path.is_file() {
        return Ok(EvaluationConfig::new());
    }

    info!("Loading evaluation configuration from {CONFIG_OVERRIDE}");
    EvaluationConfig::load(path).map_err(|err| anyhow!("invalid {CONFIG_OVERRIDE}: {err}"))
}

fn evaluate<B: Backend>(
    config: &EvaluationConfig,
    device: B::Device,
) -> anyhow::Result<EvaluationReport> {
    let artifact_dir = Path::new(&config.artifact_dir);
    let training = TrainingConfig::load(artifact_dir.join(CONFIG_FILE)).map_err(|err| {
        anyhow!(
            "cannot read training configuration in '{}': {err}",
            artifact_dir.display()
        )
    })?;

    let manifest = read_manifest(&artifact_dir.join(INTERCHANGE_MANIFEST))?;
    config.check_classes(&manifest.class_names)?;

    let model = load_snapshot::<B, _>(
        training.model.init::<B>(&device),
        &artifact_dir.join(NATIVE_SNAPSHOT),
        &device,
    )?;
    info!("Loaded model from {}", artifact_dir.display());

    let mut evaluator = Evaluator::<B, _>::new(
        model,
        &training.augmentation,
        config.class_names.clone(),
        device,
    );

    Ok(evaluator.evaluate(&config.folders)?)
}

fn main() -> anyhow::Result<()> {
    logging::init()?;

    let config = load_config()?;
    let report = match Accelerator::resolve(config.accelerate) {
        Accelerator::Gpu(device) => evaluate::<GpuBackend>(&config, device)?,
        Accelerator::Cpu(device) => evaluate::<CpuBackend>(&config, device)?,
    };

    println!("{report}");

    Ok(())
}
