//! Node configuration types.
//!
//! Layered as defaults, then an optional YAML (or TOML/JSON) file, then
//! `STAMPEDE__*` environment variables, e.g.
//! `STAMPEDE__COALESCING__MAX_IN_FLIGHT=500`.

use crate::error::NodeError;
use crate::observability::LogFormat;
use serde::{Deserialize, Serialize};
use stampede_core::{Blacklist, EngineConfig, Method, StreamAttachPolicy};
use std::net::SocketAddr;
use std::path::Path;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "STAMPEDE";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the Stampede node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Coalescing middleware settings.
    pub coalescing: CoalescingSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            coalescing: CoalescingSettings::default(),
        }
    }
}

/// Settings for the coalescing middleware.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CoalescingSettings {
    /// Master switch.
    pub enabled: bool,
    /// Maximum number of executions shared at once.
    pub max_in_flight: usize,
    /// What a request arriving mid-stream does.
    pub stream_attach: StreamAttachPolicy,
    /// Largest request body buffered for fingerprinting. Larger bodies are
    /// forwarded untouched without coalescing.
    pub max_body_bytes: usize,
    /// Largest response body (with a known length) shared as one value.
    /// Anything else is shared chunk by chunk.
    pub max_buffered_response_bytes: usize,
    /// Routes that are never coalesced.
    pub blacklist: Vec<BlacklistEntry>,
}

impl Default for CoalescingSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            enabled: engine.enabled,
            max_in_flight: engine.max_in_flight,
            stream_attach: engine.stream_attach,
            max_body_bytes: 2 * 1024 * 1024,
            max_buffered_response_bytes: 256 * 1024,
            blacklist: Vec::new(),
        }
    }
}

impl CoalescingSettings {
    /// The engine configuration these settings describe.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            enabled: self.enabled,
            max_in_flight: self.max_in_flight,
            stream_attach: self.stream_attach,
        }
    }

    /// Builds the blacklist from the configured entries.
    pub fn blacklist(&self) -> Blacklist {
        self.blacklist
            .iter()
            .map(|entry| (entry.method.clone(), entry.path.as_str()))
            .collect()
    }
}

/// A `(method, path)` pair exempt from coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BlacklistEntry {
    /// HTTP method, case-insensitive.
    pub method: Method,
    /// Exact request path.
    pub path: String,
}

impl NodeConfig {
    /// Loads configuration from defaults, an optional file, and the
    /// environment, then validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed, a value has
    /// the wrong type, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&NodeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: NodeConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), NodeError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(NodeError::InvalidConfig(format!(
                "log_level must be one of {:?}, got {:?}",
                LOG_LEVELS, self.log_level
            )));
        }

        let coalescing = &self.coalescing;
        if coalescing.max_in_flight == 0 {
            return Err(NodeError::InvalidConfig(
                "coalescing.max_in_flight must be greater than zero".to_string(),
            ));
        }
        if coalescing.max_body_bytes == 0 {
            return Err(NodeError::InvalidConfig(
                "coalescing.max_body_bytes must be greater than zero".to_string(),
            ));
        }
        if let Some(entry) = coalescing
            .blacklist
            .iter()
            .find(|entry| !entry.path.starts_with('/'))
        {
            return Err(NodeError::InvalidConfig(format!(
                "blacklist path must start with '/': {:?}",
                entry.path
            )));
        }

        Ok(())
    }
}
