use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::info;

use crate::error::PipelineError;

/// Where a pipeline's weights should live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    /// Resolve to a concrete device, preferring CUDA, then Metal, then CPU.
    pub fn select(self) -> Result<Device, PipelineError> {
        match self {
            DeviceMap::ForceCpu => Ok(Device::Cpu),
            DeviceMap::Ordinal(ordinal) if cuda_is_available() => {
                Device::new_cuda(ordinal).map_err(PipelineError::Load)
            }
            DeviceMap::Ordinal(ordinal) if metal_is_available() => {
                Device::new_metal(ordinal).map_err(PipelineError::Load)
            }
            DeviceMap::Ordinal(_) => {
                info!("no accelerator available, running on CPU");
                Ok(Device::Cpu)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_cpu_selects_cpu() {
        let device = DeviceMap::ForceCpu.select().unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn default_is_first_ordinal() {
        assert_eq!(DeviceMap::default(), DeviceMap::Ordinal(0));
    }
}
