//! Per-device resources shared by operations.
//!
//! A resource is guarded by its own [`Var`]: an operation that uses a random generator declares
//! a write on the generator's variable, so all sampling on one device is serialized while devices
//! sample independently.

use std::sync::{Arc, Mutex, OnceLock};

use rustc_hash::FxHashMap as HashMap;

use super::{
    device::Context,
    engine::{Engine, EngineError, Executor, OpDesc, OpHandle, Var},
};

/// Multiplier mixing the global seed into each device's seed.
const RAND_MAGIC: u64 = 127;

/// A pseudo random generator bound to one device context.
#[derive(Debug, Clone)]
pub struct RandomResource {
    context: Context,
    var: Var,
    rng: Arc<Mutex<fastrand::Rng>>,
}

impl RandomResource {
    #[inline]
    pub fn context(&self) -> Context {
        self.context
    }

    #[inline]
    pub fn var(&self) -> Var {
        self.var
    }

    /// Runs `f` with the generator. Must only be called from a body that writes [`Self::var`].
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut fastrand::Rng) -> R) -> R {
        let mut rng = self.rng.lock().expect("failed to lock");
        f(&mut rng)
    }
}

#[derive(Debug)]
pub struct ResourceManager {
    engine: Engine,
    seed: Mutex<u32>,
    randoms: Mutex<HashMap<Context, RandomResource>>,
}

impl ResourceManager {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            seed: Mutex::new(0),
            randoms: Default::default(),
        }
    }

    /// The resources of the process-wide engine.
    pub fn get() -> &'static ResourceManager {
        static RESOURCES: OnceLock<ResourceManager> = OnceLock::new();
        RESOURCES.get_or_init(|| ResourceManager::new(Engine::get().clone()))
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn device_seed(seed: u32, context: Context) -> u64 {
        let device = (u64::from(context.kind.code() as u32) << 32) | u64::from(context.id);
        u64::from(seed).wrapping_mul(RAND_MAGIC).wrapping_add(device)
    }

    /// Returns the random generator of `context`, creating it on first request.
    pub fn request_random(&self, context: Context) -> RandomResource {
        let mut randoms = self.randoms.lock().expect("failed to lock");
        randoms
            .entry(context)
            .or_insert_with(|| {
                let seed = *self.seed.lock().expect("failed to lock");
                let rng = fastrand::Rng::with_seed(Self::device_seed(seed, context));
                let var = self.engine.new_variable();
                log::debug!("create random resource on {context}");
                RandomResource {
                    context,
                    var,
                    rng: Arc::new(Mutex::new(rng)),
                }
            })
            .clone()
    }

    /// Reseeds every generator. Each reseed is ordered after the sampling submitted before it.
    pub fn seed(&self, seed: u32) -> Result<Vec<OpHandle>, EngineError> {
        *self.seed.lock().expect("failed to lock") = seed;

        let randoms = self.randoms.lock().expect("failed to lock");
        randoms
            .values()
            .map(|resource| {
                let context = resource.context;
                let rng = resource.rng.clone();
                let op = OpDesc::new("random_seed", context, move |_| {
                    let device_seed = Self::device_seed(seed, context);
                    *rng.lock().expect("failed to lock") = fastrand::Rng::with_seed(device_seed);
                    Ok(())
                })
                .writes([resource.var]);
                self.engine.submit(op)
            })
            .collect()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let randoms = self.randoms.get_mut().map(std::mem::take).unwrap_or_default();
        for resource in randoms.into_values() {
            if let Err(err) = self
                .engine
                .delete_variable(resource.context, resource.var, || {})
            {
                log::error!("failed to release random resource on {}: {err}", resource.context);
            }
        }
    }
}
