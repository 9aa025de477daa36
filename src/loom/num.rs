use std::ops::{Add, Div, Mul, Sub};

use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    U8,
    U16,
    U32,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
        }
    }

    /// Type flag written in front of a persisted payload.
    pub const fn tag(self) -> i32 {
        match self {
            DataType::F32 => 0,
            DataType::F16 => 2,
            DataType::U8 => 3,
            DataType::U16 => 7,
            DataType::U32 => 8,
        }
    }

    pub const fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(DataType::F32),
            2 => Some(DataType::F16),
            3 => Some(DataType::U8),
            7 => Some(DataType::U16),
            8 => Some(DataType::U32),
            _ => None,
        }
    }

    /// Returns `true` if arithmetic kernels accept the type.
    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F16)
    }
}

pub trait Scalar: Sized + Zeroable + Pod + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

/// Element types that arithmetic, clipping and sampling kernels operate on.
pub trait Float:
    Scalar
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
{
    fn from_f32(value: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

impl Scalar for u16 {
    const DATA_TYPE: DataType = DataType::U16;
}

impl Scalar for u32 {
    const DATA_TYPE: DataType = DataType::U32;
}

impl Float for f32 {
    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Float for f16 {
    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}
