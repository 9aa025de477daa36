use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use gpu::Stream;

pub mod gpu;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceKind {
    #[default]
    #[display("cpu")]
    Cpu,
    #[display("gpu")]
    Gpu,
}

impl DeviceKind {
    /// Device type code used in persisted tensors.
    pub const fn code(self) -> i32 {
        match self {
            DeviceKind::Cpu => 1,
            DeviceKind::Gpu => 2,
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(DeviceKind::Cpu),
            2 => Some(DeviceKind::Gpu),
            _ => None,
        }
    }
}

/// Identifies the compute resource that owns a buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{kind}({id})")]
pub struct Context {
    pub kind: DeviceKind,
    pub id: u32,
}

impl Context {
    #[inline]
    pub const fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            id: 0,
        }
    }

    #[inline]
    pub const fn gpu(id: u32) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            id,
        }
    }

    #[inline]
    pub const fn is_cpu(&self) -> bool {
        matches!(self.kind, DeviceKind::Cpu)
    }

    #[inline]
    pub const fn is_gpu(&self) -> bool {
        matches!(self.kind, DeviceKind::Gpu)
    }

    /// Two contexts are compatible if they are equal or both live in host memory.
    #[inline]
    pub fn is_compatible(&self, other: &Context) -> bool {
        self == other || (self.is_cpu() && other.is_cpu())
    }
}
