//! Tensor operations built on the engine: op kinds, host kernels, dispatch, persistence and the
//! named function registry.

pub mod cpu;
pub mod frontend;
pub mod io;
pub mod ops;
pub mod registry;
