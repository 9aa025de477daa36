//! The `loom` module provides the execution foundation that every tensor operation is built on.
//! Tensors never compute eagerly: they record deferred operations into a dependency engine which
//! schedules them across CPU and accelerator devices.
//!
//! ## Key Components
//! 1. **Dependency Engine** (`engine`):
//!    - Variables (`Var`) as identity tokens for mutable resources.
//!    - Operation descriptors (`OpDesc`) with explicit read and write sets.
//!    - A resolver granting exclusive writers and concurrent readers per variable.
//!    - Execution lanes per device context, ordered by priority and submission.
//!
//! 2. **Device Abstraction** (`device`):
//!    - Device contexts (`Context`) for the host and accelerators.
//!    - Ordered command streams (`Stream`) owned by accelerator lane workers.
//!
//! 3. **Numerical System** (`num`, `shape`):
//!    - Element types (`f32`, `f16`, `u8`, ...) and their persisted type tags.
//!    - Shape descriptors for dense tensors.
//!
//! 4. **Tensor Handles** (`tensor`, `storage`, `resource`):
//!    - `NDArray`: a lazily-allocated buffer paired with a variable.
//!    - Scheduled deletion of storage through the engine.
//!    - Per-device random generator resources.
//!
//! ## Design Principles
//! - **Ordering**: The variable is the only unit of mutual exclusion.
//! - **Ownership**: Deferred bodies own their operands, never borrow them.
//! - **Failure**: Faults inside deferred work poison the variables they write.

pub mod device;
pub mod engine;
pub mod num;
pub mod resource;
pub mod shape;
pub mod storage;
pub mod tensor;
