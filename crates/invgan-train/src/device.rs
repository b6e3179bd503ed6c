//! Device selection for the libtorch backend

use std::fmt;
use std::str::FromStr;

use tch::Device;

use crate::error::ConfigError;

/// Where tensors live during training
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorchDevice {
    Cpu,
    Cuda(usize),
}

impl TorchDevice {
    pub fn to_tch_device(self) -> Device {
        match self {
            TorchDevice::Cpu => Device::Cpu,
            TorchDevice::Cuda(idx) => Device::Cuda(idx),
        }
    }

    /// Check if CUDA is available and return appropriate device
    pub fn cuda_if_available() -> Self {
        if tch::Cuda::is_available() {
            TorchDevice::Cuda(0)
        } else {
            tracing::warn!("CUDA not available, falling back to CPU");
            TorchDevice::Cpu
        }
    }

    /// Resolve to a tch device, failing if CUDA was requested but is missing
    pub fn resolve(self) -> Result<Device, ConfigError> {
        if let TorchDevice::Cuda(idx) = self {
            if !tch::Cuda::is_available() {
                return Err(ConfigError::invalid_value(
                    "device",
                    "CUDA requested but not available. Ensure libtorch is built with CUDA support.",
                ));
            }
            let count = tch::Cuda::device_count() as usize;
            if idx >= count {
                return Err(ConfigError::invalid_value(
                    "device",
                    format!("cuda:{} requested but only {} device(s) present", idx, count),
                ));
            }
            tracing::info!("CUDA available with {} device(s)", count);
        }
        Ok(self.to_tch_device())
    }
}

impl FromStr for TorchDevice {
    type Err = ConfigError;

    /// Parses `cpu`, `cuda`, `cuda:N` and `auto`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(TorchDevice::Cpu),
            "cuda" | "gpu" => Ok(TorchDevice::Cuda(0)),
            "auto" => Ok(TorchDevice::cuda_if_available()),
            other => other
                .strip_prefix("cuda:")
                .and_then(|idx| idx.parse().ok())
                .map(TorchDevice::Cuda)
                .ok_or_else(|| ConfigError::UnknownDevice(s.to_string())),
        }
    }
}

impl fmt::Display for TorchDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorchDevice::Cpu => write!(f, "cpu"),
            TorchDevice::Cuda(idx) => write!(f, "cuda:{}", idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_names() {
        assert_eq!("cpu".parse::<TorchDevice>().unwrap(), TorchDevice::Cpu);
        assert_eq!("CUDA".parse::<TorchDevice>().unwrap(), TorchDevice::Cuda(0));
        assert_eq!("cuda:2".parse::<TorchDevice>().unwrap(), TorchDevice::Cuda(2));
        assert!(matches!(
            "tpu".parse::<TorchDevice>(),
            Err(ConfigError::UnknownDevice(_))
        ));
        assert!("cuda:x".parse::<TorchDevice>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for dev in [TorchDevice::Cpu, TorchDevice::Cuda(1)] {
            assert_eq!(dev.to_string().parse::<TorchDevice>().unwrap(), dev);
        }
    }

    #[test]
    fn cpu_always_resolves() {
        assert_eq!(TorchDevice::Cpu.resolve().unwrap(), Device::Cpu);
    }
}
