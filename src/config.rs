//! Relay configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::channel::{ChannelOptions, Instances, PipeName};
use crate::{AppError, Result};

fn default_server_pipe() -> String {
    "ServerPipe".into()
}

fn default_receive_buffer_bytes() -> usize {
    1024
}

fn default_delivery_timeout_seconds() -> u64 {
    30
}

fn default_shutdown_timeout_seconds() -> u64 {
    5
}

fn default_event_capacity() -> usize {
    256
}

/// Relay configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RelayConfig {
    /// Local name of the well-known inbound pipe.
    #[serde(default = "default_server_pipe")]
    pub server_pipe: String,
    /// Size of the single read performed per inbound connection.
    #[serde(default = "default_receive_buffer_bytes")]
    pub receive_buffer_bytes: usize,
    /// Concurrent inbound connections; 0 means unlimited.
    #[serde(default)]
    pub max_instances: usize,
    /// How long a recipient has to connect for a broadcast; 0 waits forever.
    #[serde(default = "default_delivery_timeout_seconds")]
    pub delivery_timeout_seconds: u64,
    /// Grace period for in-flight handlers at shutdown.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    /// Drop a registration whose delivery failed.
    #[serde(default)]
    pub evict_on_delivery_failure: bool,
    /// Buffered events per subscriber before it lags.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_pipe: default_server_pipe(),
            receive_buffer_bytes: default_receive_buffer_bytes(),
            max_instances: 0,
            delivery_timeout_seconds: default_delivery_timeout_seconds(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            evict_on_delivery_failure: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl RelayConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Name of the well-known inbound pipe.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `server_pipe` is not a valid pipe name.
    pub fn server_pipe_name(&self) -> Result<PipeName> {
        PipeName::parse(&self.server_pipe)
            .map_err(|err| AppError::Config(format!("server_pipe invalid: {err}")))
    }

    /// Delivery timeout, `None` when recipients are waited for indefinitely.
    #[must_use]
    pub fn delivery_timeout(&self) -> Option<Duration> {
        (self.delivery_timeout_seconds > 0).then(|| Duration::from_secs(self.delivery_timeout_seconds))
    }

    /// Shutdown grace period.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Options for the well-known inbound pipe.
    #[must_use]
    pub fn inbound_options(&self) -> ChannelOptions {
        ChannelOptions::default()
            .in_buffer_size(self.receive_buffer_bytes)
            .max_instances(Instances::from_config(self.max_instances))
    }

    /// Template for dedicated per-client pipes.
    #[must_use]
    pub fn dedicated_options(&self) -> ChannelOptions {
        ChannelOptions::default()
            .in_buffer_size(self.receive_buffer_bytes)
            .timeout(self.delivery_timeout())
    }

    /// Check values that TOML types alone cannot enforce.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.server_pipe_name()?;

        if self.receive_buffer_bytes < 2 || self.receive_buffer_bytes % 2 != 0 {
            return Err(AppError::Config(
                "receive_buffer_bytes must be an even number of at least 2".into(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(AppError::Config(
                "event_capacity must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
