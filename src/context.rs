use candle_core::{DType, Device};
use tracing::{info, warn};

/// Device and precision every tensor allocation and forward pass runs under.
///
/// Passed explicitly into model construction, batch assembly and loss
/// assembly instead of living in global state.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub device: Device,
    pub dtype: DType,
}

impl ExecutionContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }

    /// CUDA device `ordinal` when available, CPU otherwise.
    pub fn cuda_if_available(ordinal: usize) -> Self {
        let device = match Device::new_cuda(ordinal) {
            Ok(d) => {
                info!(ordinal, "using device: CUDA");
                d
            }
            Err(e) => {
                warn!("CUDA not available ({e}), using CPU");
                Device::Cpu
            }
        };
        Self::new(device, DType::F32)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}
