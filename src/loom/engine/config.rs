use std::{num::NonZeroUsize, str::FromStr};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Engine;

pub const ENV_ENGINE_TYPE: &str = "SKEIN_ENGINE_TYPE";
pub const ENV_CPU_WORKERS: &str = "SKEIN_CPU_WORKER_NTHREADS";
pub const ENV_GPU_WORKERS: &str = "SKEIN_GPU_WORKER_NTHREADS";
pub const ENV_COPY_WORKERS: &str = "SKEIN_GPU_COPY_NTHREADS";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EngineKind {
    /// Runs every operation inline at submission.
    #[display("naive")]
    Naive,
    /// Runs operations asynchronously on lane workers.
    #[default]
    #[display("threaded")]
    Threaded,
}

#[derive(Debug, Error)]
#[error("unknown engine type: {0}")]
pub struct ParseEngineKindError(String);

impl FromStr for EngineKind {
    type Err = ParseEngineKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "naive" | "naiveengine" => Ok(Self::Naive),
            "threaded" | "threadedengine" => Ok(Self::Threaded),
            _ => Err(ParseEngineKindError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Workers of the normal lane of each host context.
    pub cpu_workers: usize,
    /// Workers of the normal lane of each accelerator context. Each owns one stream.
    pub gpu_workers: usize,
    /// Workers of each copy lane of each accelerator context. Each owns one stream.
    pub copy_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpu_workers = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            kind: EngineKind::default(),
            cpu_workers,
            gpu_workers: 1,
            copy_workers: 1,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EngineBuilder {
    pub config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EngineKind) -> Self {
        self.config.kind = kind;
        self
    }

    pub fn cpu_workers(mut self, workers: usize) -> Self {
        self.config.cpu_workers = workers.max(1);
        self
    }

    pub fn gpu_workers(mut self, workers: usize) -> Self {
        self.config.gpu_workers = workers.max(1);
        self
    }

    pub fn copy_workers(mut self, workers: usize) -> Self {
        self.config.copy_workers = workers.max(1);
        self
    }

    /// Overrides settings from `SKEIN_*` environment variables. Malformed values are ignored.
    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    log::warn!("ignore malformed {key}={value}");
                    None
                }
            }
        }

        if let Some(kind) = parse(ENV_ENGINE_TYPE, var(ENV_ENGINE_TYPE)) {
            self = self.kind(kind);
        }
        if let Some(workers) = parse(ENV_CPU_WORKERS, var(ENV_CPU_WORKERS)) {
            self = self.cpu_workers(workers);
        }
        if let Some(workers) = parse(ENV_GPU_WORKERS, var(ENV_GPU_WORKERS)) {
            self = self.gpu_workers(workers);
        }
        if let Some(workers) = parse(ENV_COPY_WORKERS, var(ENV_COPY_WORKERS)) {
            self = self.copy_workers(workers);
        }
        self
    }

    #[inline]
    pub fn build(self) -> Engine {
        Engine::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap as HashMap;

    use super::{EngineBuilder, EngineKind};

    #[test]
    fn test_with_vars() {
        let vars: HashMap<&str, &str> = [
            (super::ENV_ENGINE_TYPE, "NaiveEngine"),
            (super::ENV_CPU_WORKERS, "3"),
            (super::ENV_GPU_WORKERS, "0"),
            (super::ENV_COPY_WORKERS, "many"),
        ]
        .into_iter()
        .collect();

        let builder = EngineBuilder::new()
            .copy_workers(2)
            .with_vars(|key| vars.get(key).map(|value| value.to_string()));
        let config = builder.config;

        assert_eq!(config.kind, EngineKind::Naive);
        assert_eq!(config.cpu_workers, 3);
        assert_eq!(config.gpu_workers, 1);
        assert_eq!(config.copy_workers, 2);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde() -> Result<(), Box<dyn std::error::Error>> {
        let config = EngineBuilder::new()
            .kind(EngineKind::Naive)
            .cpu_workers(2)
            .config;
        let json = serde_json::to_string(&config)?;
        let parsed: super::EngineConfig = serde_json::from_str(&json)?;
        assert_eq!(parsed, config);
        Ok(())
    }
}
