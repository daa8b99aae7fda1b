//! Compute device selection, resolved once per process.

use burn::backend::{
    ndarray::NdArrayDevice,
    wgpu::{Wgpu, WgpuDevice},
    NdArray,
};
use tracing::info;

pub type GpuBackend = Wgpu<f32, i32>;
pub type CpuBackend = NdArray<f32>;

#[derive(Debug, Clone)]
pub enum Accelerator {
    Gpu(WgpuDevice),
    Cpu(NdArrayDevice),
}

impl Accelerator {
    /// The default wgpu adapter when `prefer_gpu` is set, the ndarray CPU
    /// backend otherwise.
    pub fn resolve(prefer_gpu: bool) -> Self {
        let accelerator = if prefer_gpu {
            Self::Gpu(WgpuDevice::default())
        } else {
            Self::Cpu(NdArrayDevice::Cpu)
        };
        info!("Using device: {}", accelerator.name());

        accelerator
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gpu(_) => "wgpu",
            Self::Cpu(_) => "ndarray (cpu)",
        }
    }
}
