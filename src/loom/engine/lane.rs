use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{Arc, Mutex, Weak},
};

use derive_more::Display;

use super::{
    EngineError, ExecError, Lane,
    threaded::Shared,
    var::{Operation, Ready},
};
use crate::loom::device::{Context, Stream};

/// Identifies one lane instance: a lane class of one device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{context}/{lane}")]
pub(super) struct LaneKey {
    pub context: Context,
    pub lane: Lane,
}

impl LaneKey {
    /// Lane workers of accelerator contexts own a stream, except the teardown lane.
    #[inline]
    fn has_stream(&self) -> bool {
        self.context.is_gpu() && self.lane != Lane::Delete
    }
}

#[derive(Debug)]
struct Task(Ready);

impl Task {
    #[inline]
    fn key(&self) -> (i32, u64) {
        (self.0.op.priority, self.0.op.seq)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    /// The heap pops the lowest priority value first, then the earliest submission.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Ready queue of a lane, served by a fixed set of worker threads.
#[derive(Debug)]
pub(super) struct LaneQueue {
    heap: Arc<Mutex<BinaryHeap<Task>>>,
    /// One token per queued task. Dropping the sender stops the workers.
    sender: flume::Sender<()>,
}

impl LaneQueue {
    pub fn spawn(key: LaneKey, workers: usize, shared: Weak<Shared>) -> Result<Self, EngineError> {
        let heap: Arc<Mutex<BinaryHeap<Task>>> = Default::default();
        let (sender, receiver) = flume::unbounded();

        for index in 0..workers.max(1) {
            let name = format!("skein-{}-{}-{index}", key.context, key.lane);
            let heap = heap.clone();
            let receiver = receiver.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(name)
                .spawn(move || serve(key, heap, receiver, shared))?;
        }
        log::debug!("spawned {} workers for lane {key}", workers.max(1));

        Ok(Self { heap, sender })
    }

    pub fn push(&self, ready: Ready) {
        self.heap
            .lock()
            .expect("failed to lock")
            .push(Task(ready));
        _ = self.sender.send(());
    }
}

fn serve(
    key: LaneKey,
    heap: Arc<Mutex<BinaryHeap<Task>>>,
    receiver: flume::Receiver<()>,
    shared: Weak<Shared>,
) {
    let stream = key.has_stream().then(|| Stream::new(key.context));

    while let Ok(()) = receiver.recv() {
        let task = heap.lock().expect("failed to lock").pop();
        let Some(Task(Ready { op, poison })) = task else {
            continue;
        };
        let result = run(key, &op, poison, stream.as_ref());

        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.complete(key, op, result);
    }

    if let Some(stream) = stream {
        log::trace!("lane {key} stopped after {} kernels", stream.launched());
    }
}

fn run(
    key: LaneKey,
    op: &Arc<Operation>,
    poison: Option<ExecError>,
    stream: Option<&Stream>,
) -> Result<(), ExecError> {
    #[cfg(feature = "trace")]
    let _span = tracing::trace_span!("op", name = %op.name, lane = %key).entered();

    // teardown still runs on poisoned variables
    if let Some(err) = poison.filter(|_| key.lane != Lane::Delete) {
        return Err(err);
    }
    match op.take_body() {
        Some(body) => super::execute(body, op.context, stream),
        None => {
            log::error!("operation {} on lane {key} ran twice", op.name);
            Err(ExecError::Disconnected)
        }
    }
}
