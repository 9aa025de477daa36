//! Reference kernels on host memory.
//!
//! Accelerator memory is emulated on the host as well, so the same kernels serve every device;
//! what differs is where they are launched (see [`RunContext::launch`](crate::loom::engine::RunContext::launch)).
//! Kernels read all inputs before taking the output for writing, since the output may share
//! storage with an input.

/// Runs `$body` with `$T` bound to the floating point element type matching `$type`.
macro_rules! dispatch_float {
    ($type:expr, $T:ident => $body:expr) => {
        match $type {
            $crate::loom::num::DataType::F32 => {
                type $T = f32;
                $body
            }
            $crate::loom::num::DataType::F16 => {
                type $T = half::f16;
                $body
            }
            other => Err($crate::loom::engine::ExecError::Failed(format!(
                "no kernel for data type {other}"
            ))),
        }
    };
}

pub(crate) use dispatch_float;

pub use dot::dot;
pub use elementwise::{binary, clip, copy, elementwise_sum, scalar, set_value};
pub use index::{choose_element, one_hot};
pub use sample::sample;

mod dot;
mod elementwise;
mod index;
mod sample;
