//! Runtime configuration shared by the evaluator, optimizer and recommenders.
use std::env;

use serde::{Deserialize, Serialize};

use super::ConfigurationError;

/// Environment variable holding the default recommender thread count.
pub const N_THREADS_ENV: &str = "RECTUNE_N_THREADS";

/// Process-level settings passed explicitly through constructors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Threads handed to each recommender through its `TrialContext`.
    pub n_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig { n_threads: 1 }
    }
}

impl RuntimeConfig {
    /// Build a config with `n_threads` threads (at least one).
    pub fn new(n_threads: usize) -> Self {
        RuntimeConfig {
            n_threads: n_threads.max(1),
        }
    }

    /// Read the thread count from `RECTUNE_N_THREADS`, falling back to one
    /// thread when unset or malformed.
    pub fn from_env() -> Self {
        parse_n_threads(env::var(N_THREADS_ENV).ok().as_deref())
    }
}

fn parse_n_threads(value: Option<&str>) -> RuntimeConfig {
    value
        .and_then(|value| value.trim().parse::<usize>().ok())
        .map(RuntimeConfig::new)
        .unwrap_or_default()
}

/// Build a rayon pool with `n_threads` workers.
pub(crate) fn thread_pool(n_threads: usize) -> Result<rayon::ThreadPool, ConfigurationError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads.max(1))
        .build()
        .map_err(|err| ConfigurationError::ThreadPool(err.to_string()))
}
