use std::{str::FromStr, time::Duration};

use crate::{
    constants::DEFAULT_TIMEOUT_MS,
    core::domain::ExecutionLimits,
    sandbox::{
        SandboxConfig,
        executor::{DEFAULT_CANCEL_GRACE_MS, DEFAULT_IDLE_POOL_SIZE, DEFAULT_WORKER_STACK_BYTES},
        interpreter::InterpreterLimits,
        worker::WorkerConfig,
    },
};

const ENV_PREFIX: &str = "ALGOFLOW_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
}

/// Engine settings. Every field can be overridden with an `ALGOFLOW_*`
/// environment variable named after it, e.g. `ALGOFLOW_TIMEOUT_MS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub timeout_ms: u64,
    pub cancel_grace_ms: u64,
    pub idle_pool_size: usize,
    pub worker_stack_bytes: usize,
    pub max_call_depth: usize,
    pub recycle_per_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            idle_pool_size: DEFAULT_IDLE_POOL_SIZE,
            worker_stack_bytes: DEFAULT_WORKER_STACK_BYTES,
            max_call_depth: InterpreterLimits::default().max_call_depth,
            recycle_per_run: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from defaults overridden by whatever `lookup`
    /// returns for the prefixed keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        override_with(&lookup, "TIMEOUT_MS", "milliseconds", &mut config.timeout_ms)?;
        override_with(&lookup, "CANCEL_GRACE_MS", "milliseconds", &mut config.cancel_grace_ms)?;
        override_with(&lookup, "IDLE_POOL_SIZE", "a worker count", &mut config.idle_pool_size)?;
        override_with(&lookup, "WORKER_STACK_BYTES", "a byte count", &mut config.worker_stack_bytes)?;
        override_with(&lookup, "MAX_CALL_DEPTH", "a call depth", &mut config.max_call_depth)?;
        override_with(&lookup, "RECYCLE_PER_RUN", "true or false", &mut config.recycle_per_run)?;
        tracing::debug!("Engine config: {:?}", config);
        Ok(config)
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            time_ms: self.timeout_ms,
        }
    }

    pub fn sandbox(&self) -> SandboxConfig {
        SandboxConfig {
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            idle_pool_size: self.idle_pool_size,
            recycle_per_run: self.recycle_per_run,
            worker: WorkerConfig {
                stack_bytes: self.worker_stack_bytes,
                limits: InterpreterLimits {
                    max_call_depth: self.max_call_depth,
                    ..InterpreterLimits::default()
                },
            },
        }
    }
}

fn override_with<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    expected: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let key = format!("{ENV_PREFIX}{name}");
    let Some(value) = lookup(&key) else {
        return Ok(());
    };
    *slot = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value,
            expected,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.timeout_ms, 2000);
        assert_eq!(config.cancel_grace_ms, 250);
        assert_eq!(config.idle_pool_size, 2);
        assert_eq!(config.worker_stack_bytes, 1 << 30);
        assert!(!config.recycle_per_run);
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("ALGOFLOW_TIMEOUT_MS", "500"),
            ("ALGOFLOW_RECYCLE_PER_RUN", "true"),
            ("ALGOFLOW_MAX_CALL_DEPTH", " 100 "),
            ("TIMEOUT_MS", "1"),
        ]))
        .unwrap();

        assert_eq!(config.limits().time_ms, 500);
        assert!(config.recycle_per_run);

        let sandbox = config.sandbox();
        assert!(sandbox.recycle_per_run);
        assert_eq!(sandbox.worker.limits.max_call_depth, 100);
        assert_eq!(sandbox.cancel_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_value() {
        let err = EngineConfig::from_lookup(lookup(&[("ALGOFLOW_IDLE_POOL_SIZE", "many")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value 'many' for ALGOFLOW_IDLE_POOL_SIZE: expected a worker count"
        );
    }
}
