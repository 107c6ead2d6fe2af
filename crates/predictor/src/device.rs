//! Device and precision selection

use candle_core::{DType, Device};
use lmshim_common::config::{DeviceKind, RuntimeConfig, WeightDType};
use lmshim_common::Result;
use tracing::info;

/// Pick the compute device
///
/// `auto` prefers CUDA, then Metal, then the CPU.
pub fn select_device(runtime: &RuntimeConfig) -> Result<Device> {
    let device = match runtime.device {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::new_cuda(runtime.device_ordinal)?,
        DeviceKind::Metal => Device::new_metal(runtime.device_ordinal)?,
        DeviceKind::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(runtime.device_ordinal)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(runtime.device_ordinal)?
            } else {
                Device::Cpu
            }
        }
    };

    info!("Using device {:?}", device);
    Ok(device)
}

/// Pick the weight dtype for a device
///
/// Half precision is only kept on accelerators; the CPU backend runs f32.
pub fn select_dtype(requested: WeightDType, device: &Device) -> DType {
    let dtype = match requested {
        WeightDType::F16 => DType::F16,
        WeightDType::Bf16 => DType::BF16,
        WeightDType::F32 => DType::F32,
    };

    if device.is_cpu() && dtype != DType::F32 {
        info!("{:?} requested on CPU, loading weights as F32", dtype);
        return DType::F32;
    }

    dtype
}
