//! Runtime configuration.
//!
//! Configuration can come from defaults, the builder, or `WISP_*`
//! environment variables:
//!
//! | Variable                   | Field                     |
//! |----------------------------|---------------------------|
//! | `WISP_MAX_CALL_DEPTH`      | `engine.max_call_depth`   |
//! | `WISP_DEFAULT_TIMEOUT_MS`  | `host.default_timeout`    |
//!
//! Out-of-range environment values are ignored in favour of the default.

use std::time::Duration;

use thiserror::Error;

/// Default engine call depth limit.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 512;

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub engine: EngineConfig,
    pub host: HostConfig,
}

/// Settings of the reference engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Nested calls allowed before trapping with `CallStackExhausted`.
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

/// Settings of the host dispatch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    /// Timeout applied to every execution that does not set its own.
    pub default_timeout: Option<Duration>,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Defaults overridden by `WISP_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_u64("WISP_MAX_CALL_DEPTH") {
            if val > 0 {
                config.engine.max_call_depth = val as usize;
            }
        }

        if let Some(val) = parse_env_u64("WISP_DEFAULT_TIMEOUT_MS") {
            config.host.default_timeout = (val > 0).then(|| Duration::from_millis(val));
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_call_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_call_depth".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.host.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "host.default_timeout".into(),
                message: "must be positive when set".into(),
            });
        }
        Ok(())
    }
}

fn parse_env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(val) => Some(val),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.config.engine.max_call_depth = depth;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.host.default_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
