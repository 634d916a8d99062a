use std::str::FromStr;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

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

/// Numeric precision the weights are materialized in.
///
/// `F32` is the default: half precision is faster but less stable on some
/// accelerators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
}

impl Precision {
    /// Resolves to a dtype the device supports. `Bf16` falls back to `F32` on
    /// devices without bf16 kernels.
    pub fn dtype(self, device: &Device) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => device.bf16_default_to_f32(),
        }
    }
}

impl FromStr for Precision {
    type Err = serde_plain::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_plain::from_str(s)
    }
}

serde_plain::derive_display_from_serialize!(Precision);
