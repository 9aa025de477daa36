use std::{
    borrow::Cow,
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use rustc_hash::FxHashMap as HashMap;

use super::{
    EngineError, ExecError, Lane, OpBody, OpDesc, OpHandle, OpId, Priority, Var,
};
use crate::loom::device::Context;

/// A submitted operation, shared by the queues of all variables it touches.
pub(super) struct Operation {
    pub id: OpId,
    /// Global submission sequence.
    pub seq: u64,
    pub name: Cow<'static, str>,
    pub context: Context,
    pub lane: Lane,
    pub priority: Priority,
    pub reads: Vec<Var>,
    pub writes: Vec<Var>,
    pub body: Mutex<Option<OpBody>>,
    pub sender: flume::Sender<Result<(), ExecError>>,
    /// Number of variables that have not granted access yet. Only changed under the table lock.
    wait: AtomicUsize,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("name", &self.name)
            .field("context", &self.context)
            .field("lane", &self.lane)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Operation {
    /// Wraps a normalized descriptor.
    pub fn new(desc: OpDesc, seq: u64) -> (Self, OpHandle) {
        let OpDesc {
            name,
            context,
            reads,
            writes,
            lane,
            priority,
            body,
        } = desc;
        let (sender, handle) = OpHandle::channel();
        let op = Self {
            id: handle.id(),
            seq,
            name,
            context,
            lane,
            priority,
            reads,
            writes,
            body: Mutex::new(Some(body)),
            sender,
            wait: AtomicUsize::new(0),
        };
        (op, handle)
    }

    /// Takes the body out. Returns `None` if the operation already ran.
    pub fn take_body(&self) -> Option<OpBody> {
        self.body.lock().expect("failed to lock").take()
    }
}

/// An operation with every dependency satisfied.
#[derive(Debug)]
pub(super) struct Ready {
    pub op: Arc<Operation>,
    /// Set if any variable the operation touches was poisoned when it became ready.
    pub poison: Option<ExecError>,
}

#[derive(Debug)]
struct Access {
    op: Arc<Operation>,
    write: bool,
}

/// Resolver state of one variable.
///
/// Accesses are granted strictly in request order: consecutive reads are granted together
/// while no write runs, a write is granted alone once every earlier access has been released.
#[derive(Debug, Default)]
struct VarState {
    queue: VecDeque<Access>,
    readers: usize,
    writing: bool,
    poison: Option<ExecError>,
    deleting: bool,
}

impl VarState {
    #[inline]
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.readers == 0 && !self.writing
    }

    /// Requests access. Returns `true` if it is granted immediately.
    fn request(&mut self, op: &Arc<Operation>, write: bool) -> bool {
        let granted = match write {
            true => self.is_idle(),
            false => self.queue.is_empty() && !self.writing,
        };
        match (granted, write) {
            (true, true) => self.writing = true,
            (true, false) => self.readers += 1,
            (false, _) => self.queue.push_back(Access {
                op: op.clone(),
                write,
            }),
        }
        granted
    }

    fn release_read(&mut self) -> Vec<Arc<Operation>> {
        assert!(
            self.readers > 0 && !self.writing,
            "resolver state corrupted: read released without a running reader"
        );
        self.readers -= 1;
        self.grant()
    }

    fn release_write(&mut self) -> Vec<Arc<Operation>> {
        assert!(
            self.writing && self.readers == 0,
            "resolver state corrupted: write released without a running writer"
        );
        self.writing = false;
        self.grant()
    }

    /// Grants queued accesses from the front.
    fn grant(&mut self) -> Vec<Arc<Operation>> {
        let mut granted = vec![];
        while let Some(access) = self.queue.front() {
            match access.write {
                true if self.writing || self.readers > 0 => break,
                true => {
                    self.writing = true;
                    granted.extend(self.queue.pop_front().map(|access| access.op));
                    break;
                }
                false if self.writing => break,
                false => {
                    self.readers += 1;
                    granted.extend(self.queue.pop_front().map(|access| access.op));
                }
            }
        }
        granted
    }
}

/// The variable arena and dependency resolver.
#[derive(Debug, Default)]
pub(super) struct VarTable {
    vars: HashMap<Var, VarState>,
}

impl VarTable {
    #[inline]
    pub fn insert(&mut self, var: Var) {
        self.vars.insert(var, VarState::default());
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[inline]
    pub fn poison(&self, var: Var) -> Option<ExecError> {
        self.vars.get(&var).and_then(|state| state.poison.clone())
    }

    /// Registers every access of `op`. Returns the operation if it can run right away.
    ///
    /// Nothing is registered if any variable is unknown or already scheduled for deletion.
    pub fn append(&mut self, op: Arc<Operation>) -> Result<Option<Ready>, EngineError> {
        if let Some(&var) = op
            .reads
            .iter()
            .chain(op.writes.iter())
            .find(|var| !self.vars.get(var).is_some_and(|state| !state.deleting))
        {
            return Err(EngineError::UnknownVariable(var));
        }

        let mut wait = 0;
        for var in &op.reads {
            let state = self.state(var);
            if !state.request(&op, false) {
                wait += 1;
            }
        }
        for var in &op.writes {
            let state = self.state(var);
            if !state.request(&op, true) {
                wait += 1;
            }
            if op.lane == Lane::Delete {
                state.deleting = true;
            }
        }
        op.wait.store(wait, Ordering::Release);

        Ok((wait == 0).then(|| self.ready(op)))
    }

    /// Releases the accesses of a finished operation and poisons its writes on failure.
    /// Returns the operations that became ready, in submission order.
    pub fn complete(&mut self, op: &Operation, failure: Option<&ExecError>) -> Vec<Ready> {
        let mut granted = vec![];
        for var in &op.reads {
            granted.append(&mut self.state(var).release_read());
        }
        for var in &op.writes {
            let state = self.state(var);
            if let Some(err) = failure.filter(|_| op.lane != Lane::Delete) {
                state.poison = Some(err.poison());
            }
            granted.append(&mut state.release_write());
            if state.deleting && state.is_idle() {
                self.vars.remove(var);
            }
        }

        let mut ready: Vec<_> = granted
            .into_iter()
            .filter(|op| op.wait.fetch_sub(1, Ordering::AcqRel) == 1)
            .map(|op| self.ready(op))
            .collect();
        ready.sort_by_key(|ready| ready.op.seq);
        ready
    }

    fn state(&mut self, var: &Var) -> &mut VarState {
        match self.vars.get_mut(var) {
            Some(state) => state,
            None => panic!("resolver state corrupted: variable {var} vanished while in use"),
        }
    }

    fn ready(&self, op: Arc<Operation>) -> Ready {
        let poison = op
            .reads
            .iter()
            .chain(op.writes.iter())
            .find_map(|var| self.vars.get(var).and_then(|state| state.poison.clone()));
        Ready { op, poison }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use itertools::Itertools;

    use super::{Operation, Ready, VarTable};
    use crate::loom::{
        device::Context,
        engine::{EngineError, ExecError, Lane, OpDesc, Var},
    };

    fn phony(seq: u64, reads: &[Var], writes: &[Var]) -> Arc<Operation> {
        let desc = OpDesc::new(format!("phony_{seq}"), Context::cpu(), |_| Ok(()))
            .reads(reads.iter().copied())
            .writes(writes.iter().copied());
        let (op, _) = Operation::new(desc, seq);
        Arc::new(op)
    }

    fn seqs(ready: &[Ready]) -> Vec<u64> {
        ready.iter().map(|ready| ready.op.seq).collect_vec()
    }

    #[test]
    fn test_readers_share() -> Result<(), EngineError> {
        let mut table = VarTable::default();
        let v = Var::new();
        table.insert(v);

        let w0 = phony(0, &[], &[v]);
        let r1 = phony(1, &[v], &[]);
        let r2 = phony(2, &[v], &[]);
        let w3 = phony(3, &[], &[v]);
        let r4 = phony(4, &[v], &[]);

        assert!(table.append(w0.clone())?.is_some());
        assert!(table.append(r1.clone())?.is_none());
        assert!(table.append(r2.clone())?.is_none());
        assert!(table.append(w3.clone())?.is_none());
        assert!(table.append(r4.clone())?.is_none());

        // both readers are released together by the writer
        assert_eq!(seqs(&table.complete(&w0, None)), vec![1, 2]);
        // the next writer waits for every reader
        assert!(table.complete(&r2, None).is_empty());
        assert_eq!(seqs(&table.complete(&r1, None)), vec![3]);
        // a reader submitted after a writer waits for it
        assert_eq!(seqs(&table.complete(&w3, None)), vec![4]);
        assert!(table.complete(&r4, None).is_empty());
        Ok(())
    }

    #[test]
    fn test_multiple_vars() -> Result<(), EngineError> {
        let mut table = VarTable::default();
        let [a, b, c] = [Var::new(), Var::new(), Var::new()];
        [a, b, c].into_iter().for_each(|v| table.insert(v));

        let wa = phony(0, &[], &[a]);
        let wb = phony(1, &[], &[b]);
        let add = phony(2, &[a, b], &[c]);
        let rc = phony(3, &[c], &[]);

        assert!(table.append(wa.clone())?.is_some());
        assert!(table.append(wb.clone())?.is_some());
        assert!(table.append(add.clone())?.is_none());
        assert!(table.append(rc.clone())?.is_none());

        assert!(table.complete(&wb, None).is_empty());
        assert_eq!(seqs(&table.complete(&wa, None)), vec![2]);
        assert_eq!(seqs(&table.complete(&add, None)), vec![3]);
        Ok(())
    }

    #[test]
    fn test_poison() -> Result<(), EngineError> {
        let mut table = VarTable::default();
        let [a, b] = [Var::new(), Var::new()];
        table.insert(a);
        table.insert(b);

        let wa = phony(0, &[], &[a]);
        let copy = phony(1, &[a], &[b]);
        let rb = phony(2, &[b], &[]);

        assert!(table.append(wa.clone())?.is_some());
        assert!(table.append(copy.clone())?.is_none());

        let err = ExecError::Failed("kernel fault".into());
        let ready = table.complete(&wa, Some(&err));
        assert_eq!(ready.len(), 1);
        let poison = ready[0].poison.clone().expect("dependent must see the poison");
        assert!(matches!(poison.root(), ExecError::Failed(_)));

        // the skipped operation forwards the poison to what it writes
        assert!(table.complete(&copy, Some(&poison)).is_empty());
        assert!(table.poison(b).is_some());
        let ready = table.append(rb)?.expect("no writer is pending");
        assert!(ready.poison.is_some());
        Ok(())
    }

    #[test]
    fn test_delete() -> Result<(), EngineError> {
        let mut table = VarTable::default();
        let v = Var::new();
        table.insert(v);

        let r = phony(0, &[v], &[]);
        let desc = OpDesc::new("delete", Context::cpu(), |_| Ok(()))
            .writes([v])
            .lane(Lane::Delete);
        let (delete, _) = Operation::new(desc, 1);
        let delete = Arc::new(delete);

        assert!(table.append(r.clone())?.is_some());
        assert!(table.append(delete.clone())?.is_none());

        // the variable refuses new work once its deletion is queued
        let late = phony(2, &[v], &[]);
        assert!(matches!(
            table.append(late),
            Err(EngineError::UnknownVariable(var)) if var == v
        ));

        assert_eq!(seqs(&table.complete(&r, None)), vec![1]);
        assert_eq!(table.len(), 1);
        assert!(table.complete(&delete, None).is_empty());
        assert_eq!(table.len(), 0);
        Ok(())
    }
}
