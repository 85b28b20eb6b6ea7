//! Layered configuration for the dispatcher server and the gateway driver.
//!
//! Values come from built-in defaults, an optional TOML file and
//! `COPROCESS__*` environment variables, in that order.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::DEFAULT_GRPC_MAX_MESSAGE_BYTES;
use crate::hooks::StaticHookConfig;
use crate::shutdown::{ShutdownMode, ShutdownPolicy};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5555";
pub const ENV_PREFIX: &str = "COPROCESS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where hooks send host calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMode {
    /// Resolve the gateway symbols, fall back to in-memory when absent.
    #[default]
    Auto,
    Linked,
    InMemory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_message_bytes: usize,
    pub log_level: String,
    pub host: HostMode,
    pub shutdown_mode: ShutdownMode,
    pub drain_timeout_ms: u64,
    /// How often expired host entries are dropped; zero disables purging.
    pub purge_interval_ms: u64,
    pub hooks: Vec<StaticHookConfig>,
    /// Event handler names whose events are re-emitted through the host.
    pub forward_events: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_message_bytes: DEFAULT_GRPC_MAX_MESSAGE_BYTES,
            log_level: "info".to_string(),
            host: HostMode::Auto,
            shutdown_mode: ShutdownMode::Drain,
            drain_timeout_ms: 30_000,
            purge_interval_ms: 60_000,
            hooks: Vec::new(),
            forward_events: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = load_layered(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn purge_interval(&self) -> Option<Duration> {
        (self.purge_interval_ms > 0).then(|| Duration::from_millis(self.purge_interval_ms))
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            mode: self.shutdown_mode,
            drain_timeout: self.drain_timeout(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_message_bytes must be greater than zero".to_string(),
            ));
        }
        for hook in &self.hooks {
            if hook.name.trim().is_empty() {
                return Err(ConfigError::Invalid("hook name must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Gateway-side coprocess options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoProcessOptions {
    pub enable_coprocess: bool,
    /// e.g. `tcp://127.0.0.1:5555`.
    pub coprocess_grpc_server: String,
    pub grpc_recv_max_size: usize,
    pub grpc_send_max_size: usize,
    pub grpc_authority: String,
    /// Zero disables the per-call timeout.
    pub dispatch_timeout_ms: u64,
}

impl Default for CoProcessOptions {
    fn default() -> Self {
        Self {
            enable_coprocess: false,
            coprocess_grpc_server: String::new(),
            grpc_recv_max_size: DEFAULT_GRPC_MAX_MESSAGE_BYTES,
            grpc_send_max_size: DEFAULT_GRPC_MAX_MESSAGE_BYTES,
            grpc_authority: String::new(),
            dispatch_timeout_ms: 0,
        }
    }
}

impl CoProcessOptions {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_layered(path)
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        (self.dispatch_timeout_ms > 0).then(|| Duration::from_millis(self.dispatch_timeout_ms))
    }
}

fn load_layered<T: for<'de> Deserialize<'de>>(path: Option<&Path>) -> Result<T, ConfigError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }
    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(".toml").tempfile().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn server_config_defaults_without_file() {
        let config = ServerConfig::load(None).expect("load");
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.max_message_bytes, DEFAULT_GRPC_MAX_MESSAGE_BYTES);
        assert_eq!(config.host, HostMode::Auto);
        assert_eq!(config.purge_interval(), Some(Duration::from_secs(60)));
        assert!(config.hooks.is_empty());
    }

    #[test]
    fn server_config_reads_hooks_from_toml() {
        let file = write_toml(
            r#"
listen_addr = "0.0.0.0:6000"
host = "in_memory"
shutdown_mode = "cancel"
purge_interval_ms = 0
forward_events = ["audit"]

[[hooks]]
name = "add_header"
set_headers = { "x-plugin" = "coprocess" }
delete_headers = ["Authorization"]

[[hooks]]
name = "deny"
[hooks.return_overrides]
response_code = 403
response_error = "denied"
"#,
        );
        let config = ServerConfig::load(Some(file.path())).expect("load");
        assert_eq!(config.listen_addr, "0.0.0.0:6000");
        assert_eq!(config.host, HostMode::InMemory);
        assert_eq!(config.shutdown_policy().mode, ShutdownMode::Cancel);
        assert_eq!(config.purge_interval(), None);
        assert_eq!(config.forward_events, vec!["audit".to_string()]);
        assert_eq!(config.hooks.len(), 2);
        assert_eq!(config.hooks[0].name, "add_header");
        assert_eq!(
            config.hooks[0].set_headers.get("x-plugin").map(String::as_str),
            Some("coprocess")
        );
        let overrides = config.hooks[1].return_overrides.as_ref().expect("overrides");
        assert_eq!(overrides.response_code, 403);
        assert_eq!(overrides.response_error, "denied");
    }

    #[test]
    fn server_config_rejects_unnamed_hook() {
        let file = write_toml(
            r#"
[[hooks]]
set_headers = { "x-a" = "1" }
"#,
        );
        let err = ServerConfig::load(Some(file.path())).expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/coprocess.toml")))
            .expect_err("missing");
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn coprocess_options_from_toml() {
        let file = write_toml(
            r#"
enable_coprocess = true
coprocess_grpc_server = "tcp://127.0.0.1:5555"
dispatch_timeout_ms = 250
"#,
        );
        let options = CoProcessOptions::load(Some(file.path())).expect("load");
        assert!(options.enable_coprocess);
        assert_eq!(options.coprocess_grpc_server, "tcp://127.0.0.1:5555");
        assert_eq!(options.dispatch_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(options.grpc_recv_max_size, DEFAULT_GRPC_MAX_MESSAGE_BYTES);
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        assert_eq!(CoProcessOptions::default().dispatch_timeout(), None);
    }
}
