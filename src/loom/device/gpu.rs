//! Accelerator command streams.
//!
//! Accelerator memory is emulated in host memory; what the engine relies on is the execution
//! model. Kernels launched on a [`Stream`] are queued, not run, and only take effect once the
//! stream is drained by [`Stream::wait`]. Each accelerator lane worker owns one stream for its
//! whole lifetime, so no two workers ever queue onto the same stream.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
};

use super::Context;
use crate::loom::engine::ExecError;

type Kernel = Box<dyn FnOnce() -> Result<(), ExecError>>;

pub struct Stream {
    context: Context,
    kernels: RefCell<VecDeque<Kernel>>,
    launched: Cell<usize>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("context", &self.context)
            .field("queued", &self.kernels.borrow().len())
            .field("launched", &self.launched.get())
            .finish()
    }
}

impl Stream {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            kernels: Default::default(),
            launched: Default::default(),
        }
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.context
    }

    /// Total number of kernels launched on this stream.
    #[inline]
    pub fn launched(&self) -> usize {
        self.launched.get()
    }

    /// Number of kernels queued but not yet executed.
    #[inline]
    pub fn queued(&self) -> usize {
        self.kernels.borrow().len()
    }

    /// Queues a kernel. It runs during the next [`Stream::wait`].
    pub fn launch(&self, kernel: impl FnOnce() -> Result<(), ExecError> + 'static) {
        self.kernels.borrow_mut().push_back(Box::new(kernel));
        self.launched.set(self.launched.get() + 1);
    }

    /// Drops every queued kernel without running it. Returns how many were dropped.
    pub fn discard(&self) -> usize {
        std::mem::take(&mut *self.kernels.borrow_mut()).len()
    }

    /// Drains the stream in launch order. Kernels queued after a failing one are discarded.
    pub fn wait(&self) -> Result<(), ExecError> {
        loop {
            let kernel = self.kernels.borrow_mut().pop_front();
            let Some(kernel) = kernel else {
                return Ok(());
            };
            if let Err(err) = kernel() {
                let discarded = self.discard();
                if discarded > 0 {
                    log::warn!("{}: discarded {discarded} kernels after failure", self.context);
                }
                return Err(err);
            }
        }
    }
}
