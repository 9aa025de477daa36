//! The dependency engine.
//!
//! Work is submitted as an [`OpDesc`]: a deferred body together with the [`Var`]s it reads and
//! writes. For every variable the engine grants access in submission order: a writer waits for
//! the previous writer and all readers before it, a reader only waits for the previous writer.
//! Ready operations are queued on a [`Lane`] of their device context and run by that lane's
//! workers, so transfers overlap with compute and different devices run in parallel.
//!
//! A body that fails (returns an error or panics) does not bring the process down. Its error is
//! delivered through the operation's [`OpHandle`], and every variable it writes is poisoned:
//! later operations touching a poisoned variable are skipped and fail with
//! [`ExecError::Poisoned`], which is also what [`Executor::wait_to_read`] and
//! [`Executor::wait_to_write`] report.

use std::{
    any::Any,
    borrow::Cow,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, OnceLock},
};

use derive_more::Display;
use itertools::Itertools;
use thiserror::Error;

use super::device::{Context, Stream};

pub use config::{EngineBuilder, EngineConfig, EngineKind};
pub use naive::NaiveEngine;
pub use threaded::ThreadedEngine;

pub mod config;
mod lane;
pub mod naive;
pub mod threaded;
mod var;

/// Identity token of a mutable resource. Carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct Var(uid::Id<Var>);

impl Var {
    #[inline]
    fn new() -> Self {
        Self(uid::Id::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct OpId(uid::Id<OpId>);

/// Scheduling class of an operation. Each device context has its own instance of every lane.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Lane {
    /// Ordinary compute.
    #[default]
    #[display("normal")]
    Normal,
    /// Host to accelerator transfers.
    #[display("copy_to_gpu")]
    CopyToGpu,
    /// Accelerator to host (or accelerator) transfers.
    #[display("copy_from_gpu")]
    CopyFromGpu,
    /// Variable and storage teardown.
    #[display("delete")]
    Delete,
}

/// Lower values run sooner within a lane.
pub type Priority = i32;

pub const PRIORITY_NORMAL: Priority = 0;
/// Used by blocking waits so they preempt background work.
pub const PRIORITY_SYNC: Priority = Priority::MIN;

#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("operation failed: {0}")]
    Failed(String),
    #[error("operation panicked: {0}")]
    Panicked(String),
    #[error("variable poisoned by an earlier failure: {0}")]
    Poisoned(Arc<ExecError>),
    #[error("operation was dropped before completion")]
    Disconnected,
}

impl ExecError {
    fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => message.to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        };
        Self::Panicked(message)
    }

    /// The error that dependents of a failed operation observe.
    pub fn poison(&self) -> Self {
        match self {
            Self::Poisoned(root) => Self::Poisoned(root.clone()),
            err => Self::Poisoned(Arc::new(err.clone())),
        }
    }

    /// The failure that started a chain of poisoned operations.
    pub fn root(&self) -> &ExecError {
        match self {
            Self::Poisoned(root) => root.as_ref(),
            err => err,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation {0} declares neither reads nor writes")]
    EmptyDependencies(Cow<'static, str>),
    #[error("unknown or deleted variable {0}")]
    UnknownVariable(Var),
    #[error("engine is already initialized")]
    AlreadyInitialized,
    #[error("failed to spawn lane worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Execution environment handed to an operation body on its worker.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    context: Context,
    stream: Option<&'a Stream>,
}

impl<'a> RunContext<'a> {
    #[inline]
    pub fn new(context: Context, stream: Option<&'a Stream>) -> Self {
        Self { context, stream }
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.context
    }

    #[inline]
    pub fn stream(&self) -> Option<&'a Stream> {
        self.stream
    }

    /// Runs a kernel on the context. Host kernels run inline, accelerator kernels are queued on
    /// the worker's stream and take effect on [`RunContext::wait`].
    pub fn launch<F>(&self, kernel: F) -> Result<(), ExecError>
    where
        F: FnOnce() -> Result<(), ExecError> + 'static,
    {
        match self.stream {
            Some(stream) => {
                stream.launch(kernel);
                Ok(())
            }
            None => kernel(),
        }
    }

    /// Blocks until every kernel launched on the stream has completed.
    pub fn wait(&self) -> Result<(), ExecError> {
        match self.stream {
            Some(stream) => stream.wait(),
            None => Ok(()),
        }
    }
}

pub type OpBody = Box<dyn FnOnce(&RunContext) -> Result<(), ExecError> + Send>;

/// A deferred unit of work. The body must own everything it touches.
pub struct OpDesc {
    name: Cow<'static, str>,
    context: Context,
    reads: Vec<Var>,
    writes: Vec<Var>,
    lane: Lane,
    priority: Priority,
    body: OpBody,
}

impl std::fmt::Debug for OpDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpDesc")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("lane", &self.lane)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl OpDesc {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, context: Context, body: F) -> Self
    where
        F: FnOnce(&RunContext) -> Result<(), ExecError> + Send + 'static,
    {
        Self {
            name: name.into(),
            context,
            reads: vec![],
            writes: vec![],
            lane: Lane::Normal,
            priority: PRIORITY_NORMAL,
            body: Box::new(body),
        }
    }

    pub fn reads(mut self, vars: impl IntoIterator<Item = Var>) -> Self {
        self.reads.extend(vars);
        self
    }

    pub fn writes(mut self, vars: impl IntoIterator<Item = Var>) -> Self {
        self.writes.extend(vars);
        self
    }

    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.context
    }

    /// Removes duplicates and drops written variables from the read set, since a write access
    /// is exclusive anyway. Rejects an operation without any dependency.
    fn normalize(&mut self) -> Result<(), EngineError> {
        let writes = self.writes.iter().copied().unique().collect_vec();
        let reads = self
            .reads
            .iter()
            .copied()
            .unique()
            .filter(|var| !writes.contains(var))
            .collect_vec();
        if reads.is_empty() && writes.is_empty() {
            return Err(EngineError::EmptyDependencies(self.name.clone()));
        }
        self.reads = reads;
        self.writes = writes;
        Ok(())
    }
}

/// Receives the outcome of a submitted operation.
#[derive(Debug)]
pub struct OpHandle {
    id: OpId,
    receiver: flume::Receiver<Result<(), ExecError>>,
}

impl OpHandle {
    fn channel() -> (flume::Sender<Result<(), ExecError>>, Self) {
        let id = OpId(uid::Id::new());
        let (sender, receiver) = flume::bounded(1);
        (sender, Self { id, receiver })
    }

    #[inline]
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Blocks until the operation has completed.
    pub fn wait(self) -> Result<(), ExecError> {
        self.receiver
            .recv()
            .map_err(|_| ExecError::Disconnected)?
    }

    pub async fn wait_async(self) -> Result<(), ExecError> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| ExecError::Disconnected)?
    }
}

/// Runs a body, converting a panic into an [`ExecError`]. Kernels left queued on the stream are
/// drained before the operation counts as complete.
fn execute(body: OpBody, context: Context, stream: Option<&Stream>) -> Result<(), ExecError> {
    let run = RunContext::new(context, stream);
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let result = body(&run);
        let drained = run.wait();
        result.and(drained)
    }));
    match result {
        Ok(result) => result,
        Err(payload) => {
            if let Some(count) = stream.map(Stream::discard).filter(|&count| count > 0) {
                log::warn!("{context}: discarded {count} kernels after panic");
            }
            Err(ExecError::panicked(payload))
        }
    }
}

/// The capability shared by every engine backend.
pub trait Executor {
    /// Creates a fresh variable.
    fn new_variable(&self) -> Var;

    /// Queues an operation without blocking.
    fn submit(&self, op: OpDesc) -> Result<OpHandle, EngineError>;

    /// Blocks until every operation submitted so far has completed.
    fn wait_for_all(&self);

    /// Schedules the deletion of `var` after every operation on it. `f` releases the resource
    /// and runs on the teardown lane of `context`. The variable must not be used afterwards.
    fn delete_variable<F>(&self, context: Context, var: Var, f: F) -> Result<OpHandle, EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let op = OpDesc::new("delete_variable", context, move |_| {
            f();
            Ok(())
        })
        .writes([var])
        .lane(Lane::Delete);
        self.submit(op)
    }

    /// Blocks until the current writer of `var` has completed.
    fn wait_to_read(&self, var: Var) -> Result<(), EngineError> {
        let op = OpDesc::new("wait_to_read", Context::cpu(), |_| Ok(()))
            .reads([var])
            .priority(PRIORITY_SYNC);
        self.submit(op)?.wait()?;
        Ok(())
    }

    /// Blocks until the current writer and all pending readers of `var` have completed.
    fn wait_to_write(&self, var: Var) -> Result<(), EngineError> {
        let op = OpDesc::new("wait_to_write", Context::cpu(), |_| Ok(()))
            .writes([var])
            .priority(PRIORITY_SYNC);
        self.submit(op)?.wait()?;
        Ok(())
    }

    fn wait_to_read_async(&self, var: Var) -> impl Future<Output = Result<(), EngineError>> + Send {
        let op = OpDesc::new("wait_to_read", Context::cpu(), |_| Ok(()))
            .reads([var])
            .priority(PRIORITY_SYNC);
        let handle = self.submit(op);
        async move {
            handle?.wait_async().await?;
            Ok(())
        }
    }
}

static ENGINE: OnceLock<Engine> = OnceLock::new();

/// The engine backend, chosen once from an [`EngineConfig`].
#[derive(Debug, Clone)]
pub enum Engine {
    Naive(NaiveEngine),
    Threaded(ThreadedEngine),
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        log::debug!("create engine: {config:?}");
        match config.kind {
            EngineKind::Naive => Self::Naive(NaiveEngine::new()),
            EngineKind::Threaded => Self::Threaded(ThreadedEngine::new(config)),
        }
    }

    /// The process-wide engine. Built from the environment on first use unless
    /// [`Engine::init`] was called before.
    pub fn get() -> &'static Engine {
        ENGINE.get_or_init(|| EngineBuilder::new().with_env().build())
    }

    /// Installs the process-wide engine. Fails if it is already in use.
    pub fn init(config: EngineConfig) -> Result<&'static Engine, EngineError> {
        ENGINE
            .set(Self::new(config))
            .map_err(|_| EngineError::AlreadyInitialized)?;
        Ok(Self::get())
    }

    #[inline]
    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Naive(_) => EngineKind::Naive,
            Engine::Threaded(_) => EngineKind::Threaded,
        }
    }
}

impl Executor for Engine {
    #[inline]
    fn new_variable(&self) -> Var {
        match self {
            Engine::Naive(engine) => engine.new_variable(),
            Engine::Threaded(engine) => engine.new_variable(),
        }
    }

    #[inline]
    fn submit(&self, op: OpDesc) -> Result<OpHandle, EngineError> {
        match self {
            Engine::Naive(engine) => engine.submit(op),
            Engine::Threaded(engine) => engine.submit(op),
        }
    }

    #[inline]
    fn wait_for_all(&self) {
        match self {
            Engine::Naive(engine) => engine.wait_for_all(),
            Engine::Threaded(engine) => engine.wait_for_all(),
        }
    }
}
