//! Compute device selection.
//!
//! Tries CUDA, then Metal, then falls back to CPU. Only the first configured
//! device id is ever used; all tensors of a forward pass live on it.

use candle_core::Device;

use crate::config::DeviceConfig;

/// Pick the device for the first configured id.
pub fn select_device(config: &DeviceConfig) -> Device {
    if config.device_ids.len() > 1 {
        tracing::warn!(
            configured = config.device_ids.len(),
            "multiple devices configured, only the first is used"
        );
    }

    if !config.use_gpu {
        tracing::info!("GPU disabled in config, using CPU device");
        return Device::Cpu;
    }

    let device_id = config.device_ids.first().copied().unwrap_or(0);
    new_device(device_id)
}

fn new_device(device_id: usize) -> Device {
    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(device_id) {
            Ok(device) => {
                tracing::info!("Using CUDA device {}", device_id);
                return device;
            }
            Err(e) => {
                tracing::debug!("CUDA not available: {}", e);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(device_id) {
            Ok(device) => {
                tracing::info!("Using Metal device {}", device_id);
                return device;
            }
            Err(e) => {
                tracing::debug!("Metal not available: {}", e);
            }
        }
    }

    tracing::info!(requested = device_id, "Using CPU device");
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_when_gpu_disabled() {
        let config = DeviceConfig {
            use_gpu: false,
            device_ids: vec![0, 1],
        };
        assert!(select_device(&config).is_cpu());
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn test_cpu_fallback_without_gpu_features() {
        let config = DeviceConfig::default();
        assert!(select_device(&config).is_cpu());
    }
}
