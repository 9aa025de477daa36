use std::{
    collections::hash_map::Entry,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use rustc_hash::FxHashMap as HashMap;

use super::{
    EngineConfig, EngineError, ExecError, Executor, Lane, OpDesc, OpHandle, Var,
    lane::{LaneKey, LaneQueue},
    var::{Operation, Ready, VarTable},
};
use crate::loom::device::{Context, DeviceKind};

/// Asynchronous engine: ready operations run on worker threads of per-context lanes.
///
/// Lanes are spawned on first use. The workers stop once the last handle of the engine is dropped;
/// operations still pending at that point never run and their handles report
/// [`ExecError::Disconnected`].
#[derive(Debug, Clone)]
pub struct ThreadedEngine {
    shared: Arc<Shared>,
}

#[derive(Debug)]
pub(super) struct Shared {
    config: EngineConfig,
    table: Mutex<VarTable>,
    lanes: RwLock<HashMap<LaneKey, LaneQueue>>,
    /// Next submission sequence number.
    seq: AtomicU64,
    pending: Mutex<Pending>,
    /// Completed operations per lane.
    stats: Mutex<HashMap<LaneKey, u64>>,
    this: Weak<Shared>,
}

/// Submitted but not yet completed operations, and the callers waiting for them to drain.
#[derive(Debug, Default)]
struct Pending {
    count: usize,
    waiters: Vec<flume::Sender<()>>,
}

impl ThreadedEngine {
    pub fn new(config: EngineConfig) -> Self {
        let shared = Arc::new_cyclic(|this| Shared {
            config,
            table: Default::default(),
            lanes: Default::default(),
            seq: AtomicU64::new(0),
            pending: Default::default(),
            stats: Default::default(),
            this: this.clone(),
        });
        Self { shared }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Number of operations that have completed on a lane.
    pub fn completed(&self, context: Context, lane: Lane) -> u64 {
        let key = LaneKey { context, lane };
        let stats = self.shared.stats.lock().expect("failed to lock");
        stats.get(&key).copied().unwrap_or_default()
    }

    /// Number of live variables, including those with a deletion still pending.
    pub fn num_variables(&self) -> usize {
        self.shared.table.lock().expect("failed to lock").len()
    }

    /// The failure that poisoned `var`, if any.
    pub fn poison(&self, var: Var) -> Option<ExecError> {
        self.shared.table.lock().expect("failed to lock").poison(var)
    }
}

impl Executor for ThreadedEngine {
    fn new_variable(&self) -> Var {
        let var = Var::new();
        self.shared.table.lock().expect("failed to lock").insert(var);
        var
    }

    fn submit(&self, mut op: OpDesc) -> Result<OpHandle, EngineError> {
        op.normalize()?;
        let key = LaneKey {
            context: op.context,
            lane: op.lane,
        };
        self.shared.ensure_lane(key)?;

        self.shared.pending.lock().expect("failed to lock").count += 1;
        // the operation is dropped outside the table lock, since dropping its body may submit
        let (op, handle, ready) = {
            let mut table = self.shared.table.lock().expect("failed to lock");
            let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
            let (op, handle) = Operation::new(op, seq);
            let op = Arc::new(op);
            let ready = table.append(op.clone());
            (op, handle, ready)
        };
        drop(op);

        match ready {
            Ok(ready) => {
                if let Some(ready) = ready {
                    self.shared.dispatch(ready);
                }
                Ok(handle)
            }
            Err(err) => {
                self.shared.finish();
                Err(err)
            }
        }
    }

    /// Must not be called from inside an operation body.
    fn wait_for_all(&self) {
        let receiver = {
            let mut pending = self.shared.pending.lock().expect("failed to lock");
            if pending.count == 0 {
                return;
            }
            let (sender, receiver) = flume::bounded(1);
            pending.waiters.push(sender);
            receiver
        };
        _ = receiver.recv();
    }
}

impl Shared {
    fn workers(&self, key: LaneKey) -> usize {
        match (key.context.kind, key.lane) {
            (_, Lane::Delete) => 1,
            (DeviceKind::Cpu, Lane::Normal) => self.config.cpu_workers,
            (DeviceKind::Gpu, Lane::Normal) => self.config.gpu_workers,
            (_, Lane::CopyToGpu | Lane::CopyFromGpu) => self.config.copy_workers,
        }
    }

    fn ensure_lane(&self, key: LaneKey) -> Result<(), EngineError> {
        if self.lanes.read().expect("failed to lock").contains_key(&key) {
            return Ok(());
        }
        let mut lanes = self.lanes.write().expect("failed to lock");
        if let Entry::Vacant(entry) = lanes.entry(key) {
            let queue = LaneQueue::spawn(key, self.workers(key), self.this.clone())?;
            entry.insert(queue);
        }
        Ok(())
    }

    fn dispatch(&self, ready: Ready) {
        let key = LaneKey {
            context: ready.op.context,
            lane: ready.op.lane,
        };
        let lanes = self.lanes.read().expect("failed to lock");
        match lanes.get(&key) {
            Some(queue) => queue.push(ready),
            None => {
                drop(lanes);
                log::error!("lane {key} vanished before dispatch");
                let err = ExecError::Failed(format!("lane {key} is not available"));
                self.complete(key, ready.op, Err(err));
            }
        }
    }

    /// Called by a lane worker once an operation has run (or was skipped).
    pub(super) fn complete(&self, key: LaneKey, op: Arc<Operation>, result: Result<(), ExecError>) {
        *self
            .stats
            .lock()
            .expect("failed to lock")
            .entry(key)
            .or_default() += 1;

        let ready = self
            .table
            .lock()
            .expect("failed to lock")
            .complete(&op, result.as_ref().err());

        match &result {
            Ok(()) => {}
            Err(err @ ExecError::Poisoned(_)) => log::debug!("skip {} on {key}: {err}", op.name),
            Err(err) => log::error!("{} on {key}: {err}", op.name),
        }
        _ = op.sender.send(result);

        for ready in ready {
            self.dispatch(ready);
        }
        self.finish();
    }

    fn finish(&self) {
        let mut pending = self.pending.lock().expect("failed to lock");
        pending.count -= 1;
        if pending.count == 0 {
            for sender in pending.waiters.drain(..) {
                _ = sender.send(());
            }
        }
    }
}
