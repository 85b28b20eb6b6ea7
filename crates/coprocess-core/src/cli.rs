use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use coprocess_proto::{HookType, Object};
use serde_json::Value;
use thiserror::Error;

use crate::driver::CallOptions;
use crate::hooks::{EventMessage, HookError};

const DEFAULT_TARGET: &str = "tcp://127.0.0.1:5555";

#[derive(Parser, Debug)]
#[command(name = "coprocessctl", about = "Coprocess dispatcher CLI")]
pub struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the dispatcher gRPC server.
    Serve {
        /// TOML configuration file.
        #[arg(long, env = "COPROCESS_CONFIG")]
        config: Option<PathBuf>,
        /// Listen address, overrides the configuration (e.g. 127.0.0.1:5555).
        #[arg(long)]
        addr: Option<String>,
    },
    /// Send one object to a dispatcher and print the returned object.
    Dispatch {
        /// Dispatcher address (tcp://host:port, http://host:port or host:port).
        #[arg(long, default_value = DEFAULT_TARGET)]
        addr: String,
        /// JSON file holding the object.
        #[arg(long)]
        object: PathBuf,
        /// Overrides the object's hook name.
        #[arg(long)]
        hook_name: Option<String>,
        /// Overrides the object's hook type (pre, post, post_key_auth, custom_key_check, response).
        #[arg(long, value_parser = parse_hook_type)]
        hook_type: Option<HookType>,
        #[command(flatten)]
        call: CallArgs,
    },
    /// Send one event to a dispatcher.
    DispatchEvent {
        /// Dispatcher address (tcp://host:port, http://host:port or host:port).
        #[arg(long, default_value = DEFAULT_TARGET)]
        addr: String,
        /// Event handler name.
        #[arg(long)]
        handler_name: String,
        /// File holding the event message (JSON, or plain text sent as a string).
        #[arg(long)]
        message: Option<PathBuf>,
        #[command(flatten)]
        call: CallArgs,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct CallArgs {
    /// Per-call deadline in milliseconds; 0 disables it.
    #[arg(long, default_value_t = 0)]
    pub timeout_ms: u64,
    /// Request metadata as key=value, repeatable.
    #[arg(long = "metadata", value_parser = parse_metadata)]
    pub metadata: Vec<(String, String)>,
    /// Compress requests with gzip.
    #[arg(long)]
    pub gzip: bool,
}

impl CallArgs {
    pub fn options(&self) -> CallOptions {
        CallOptions {
            timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
            metadata: self.metadata.clone(),
            compression: self.gzip,
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Hook(#[from] HookError),
}

fn read(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Accepts proto names (`CustomKeyCheck`) and snake case (`custom_key_check`).
pub fn parse_hook_type(value: &str) -> Result<HookType, String> {
    if let Some(hook_type) = HookType::from_str_name(value) {
        return Ok(hook_type);
    }
    let wanted = value.replace(['_', '-'], "");
    [
        HookType::Unknown,
        HookType::Pre,
        HookType::Post,
        HookType::PostKeyAuth,
        HookType::CustomKeyCheck,
        HookType::Response,
    ]
    .into_iter()
    .find(|hook_type| hook_type.as_str_name().eq_ignore_ascii_case(&wanted))
    .ok_or_else(|| format!("unknown hook type '{value}'"))
}

pub fn parse_metadata(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.trim().is_empty() => {
            Ok((key.trim().to_ascii_lowercase(), val.to_string()))
        }
        _ => Err(format!("expected key=value, got '{value}'")),
    }
}

pub fn object_from_file(
    path: &Path,
    hook_name: Option<String>,
    hook_type: Option<HookType>,
) -> Result<Object, CliError> {
    let contents = read(path)?;
    let mut object: Object = serde_json::from_slice(&contents).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(hook_name) = hook_name {
        object.hook_name = hook_name;
    }
    if let Some(hook_type) = hook_type {
        object.set_hook_type(hook_type);
    }
    Ok(object)
}

/// Builds the JSON event envelope for `handler_name`.
pub fn event_payload(handler_name: &str, message: Option<&Path>) -> Result<String, CliError> {
    let message = match message {
        Some(path) => {
            let contents = read(path)?;
            serde_json::from_slice(&contents).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&contents).trim_end().to_string())
            })
        }
        None => Value::Null,
    };
    Ok(EventMessage::new(handler_name, message).to_payload()?)
}
