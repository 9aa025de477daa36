use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap as HashMap;

use super::{EngineError, ExecError, Executor, Lane, OpDesc, OpHandle, Var};
use crate::loom::device::Stream;

/// Synchronous engine: every operation runs on the calling thread before [`Executor::submit`]
/// returns. Dependencies are still validated and failures still poison variables, which makes
/// this backend useful for debugging.
#[derive(Debug, Default, Clone)]
pub struct NaiveEngine {
    /// Live variables and the failure that poisoned each, if any.
    vars: Arc<Mutex<HashMap<Var, Option<ExecError>>>>,
}

impl NaiveEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_variables(&self) -> usize {
        self.vars.lock().expect("failed to lock").len()
    }
}

impl Executor for NaiveEngine {
    fn new_variable(&self) -> Var {
        let var = Var::new();
        self.vars.lock().expect("failed to lock").insert(var, None);
        var
    }

    fn submit(&self, mut op: OpDesc) -> Result<OpHandle, EngineError> {
        op.normalize()?;
        let OpDesc {
            name,
            context,
            reads,
            writes,
            lane,
            body,
            ..
        } = op;

        let poison = {
            let vars = self.vars.lock().expect("failed to lock");
            let mut poison = None;
            for var in reads.iter().chain(writes.iter()) {
                match vars.get(var) {
                    Some(err) => poison = poison.or_else(|| err.clone()),
                    None => return Err(EngineError::UnknownVariable(*var)),
                }
            }
            poison
        };

        // the lock is released while the body runs, since it may drop tensors
        let result = match poison.filter(|_| lane != Lane::Delete) {
            Some(err) => Err(err),
            None => {
                let stream = (context.is_gpu() && lane != Lane::Delete).then(|| Stream::new(context));
                super::execute(body, context, stream.as_ref())
            }
        };

        {
            let mut vars = self.vars.lock().expect("failed to lock");
            for var in &writes {
                match (lane, &result) {
                    (Lane::Delete, _) => {
                        vars.remove(var);
                    }
                    (_, Err(err)) => {
                        vars.insert(*var, Some(err.poison()));
                    }
                    (_, Ok(())) => {}
                }
            }
        }

        match &result {
            Ok(()) => {}
            Err(err @ ExecError::Poisoned(_)) => log::debug!("skip {name} on {context}: {err}"),
            Err(err) => log::error!("{name} on {context}/{lane}: {err}"),
        }

        let (sender, handle) = OpHandle::channel();
        _ = sender.send(result);
        Ok(handle)
    }

    #[inline]
    fn wait_for_all(&self) {}
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::{Arc, Mutex},
    };

    use super::NaiveEngine;
    use crate::loom::{
        device::Context,
        engine::{Engine, EngineError, ExecError, Executor, OpDesc},
        num::DataType,
        storage::Chunk,
    };

    #[test]
    fn test_inline() -> Result<(), Box<dyn Error>> {
        let engine = NaiveEngine::new();
        let v = engine.new_variable();
        let trace = Arc::new(Mutex::new(vec![]));

        for index in 0..4 {
            let t = trace.clone();
            let op = OpDesc::new("push", Context::gpu(0), move |run| {
                run.launch(move || {
                    t.lock().expect("failed to lock").push(index);
                    Ok(())
                })
            })
            .writes([v]);
            engine.submit(op)?;
            // already complete on return
            assert_eq!(trace.lock().expect("failed to lock").len(), index + 1);
        }
        engine.wait_to_read(v)?;
        Ok(())
    }

    #[test]
    fn test_poison() -> Result<(), Box<dyn Error>> {
        let engine = NaiveEngine::new();
        let a = engine.new_variable();
        let b = engine.new_variable();

        let op = OpDesc::new("fail", Context::cpu(), |_| {
            Err(ExecError::Failed("kernel fault".into()))
        })
        .writes([a]);
        assert!(engine.submit(op)?.wait().is_err());

        let op = OpDesc::new("copy", Context::cpu(), |_| Ok(()))
            .reads([a])
            .writes([b]);
        assert!(matches!(engine.submit(op)?.wait(), Err(ExecError::Poisoned(_))));
        assert!(matches!(
            engine.wait_to_write(b),
            Err(EngineError::Exec(ExecError::Poisoned(_)))
        ));

        // teardown still runs
        let deleted = Arc::new(Mutex::new(false));
        let d = deleted.clone();
        engine
            .delete_variable(Context::cpu(), b, move || *d.lock().expect("failed to lock") = true)?
            .wait()?;
        assert!(*deleted.lock().expect("failed to lock"));
        assert_eq!(engine.num_variables(), 1);
        Ok(())
    }

    #[test]
    fn test_rejected_releases_storage() {
        let engine = NaiveEngine::new();
        let chunk = Chunk::new(Engine::Naive(engine.clone()), Context::cpu(), DataType::F32, 4);
        assert_eq!(engine.num_variables(), 1);

        let foreign = NaiveEngine::new().new_variable();
        let op = OpDesc::new("owner", Context::cpu(), move |_| {
            let _ = &chunk;
            Ok(())
        })
        .reads([foreign]);
        assert!(matches!(
            engine.submit(op),
            Err(EngineError::UnknownVariable(var)) if var == foreign
        ));
        assert_eq!(engine.num_variables(), 0);
    }
}
