//! Host-call surface available to coprocess hooks.
//!
//! The gateway process exposes four C symbols (`CoProcessLog`, `TykGetData`,
//! `TykStoreData`, `TykTriggerEvent`). [`HostApi`] is the Rust view of that
//! surface; [`LinkedHost`] forwards to the symbols of the running process,
//! [`InMemoryHost`] serves standalone deployments and tests, and
//! [`exports`] provides the symbols themselves for in-process embedding.

pub mod exports;
pub mod ffi;
pub mod memory;

pub use ffi::{HostSymbols, LinkedHost};
pub use memory::{HostEvent, InMemoryHost};

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("{argument} contains an interior NUL byte")]
    InteriorNul { argument: &'static str },
    #[error("host symbol {0} not found in process symbol table")]
    SymbolNotFound(String),
    #[error("host symbol lookup is not supported on this platform")]
    Unsupported,
    #[error("a process host is already installed")]
    AlreadyInstalled,
    #[error("{argument} returned by the host is not valid UTF-8")]
    InvalidUtf8 { argument: &'static str },
}

/// Calls a coprocess can make back into the gateway.
///
/// Implementations forward without buffering or retry.
pub trait HostApi: Send + Sync {
    fn log(&self, message: &str, level: &str) -> Result<(), HostError>;

    fn log_error(&self, message: &str) -> Result<(), HostError> {
        self.log(message, "error")
    }

    /// Returns `None` for missing or expired keys. Values that are not
    /// valid UTF-8 are reported as [`HostError::InvalidUtf8`].
    fn get_data(&self, key: &str) -> Result<Option<String>, HostError>;

    /// Stores `value` under `key`. A `ttl` of zero or less never expires.
    fn store_data(&self, key: &str, value: &str, ttl: i32) -> Result<(), HostError>;

    fn trigger_event(&self, name: &str, payload: &str) -> Result<(), HostError>;

    /// Drops expired entries held by the host and returns how many were
    /// removed. Hosts that keep no local state have nothing to purge.
    fn purge_expired(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Maps the level string a coprocess passes to `CoProcessLog`.
    /// Unknown levels log at info.
    pub fn from_host(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emits a coprocess log line through `tracing`.
pub(crate) fn emit_log(message: &str, level: LogLevel) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "coprocess", "{message}"),
        LogLevel::Info => tracing::info!(target: "coprocess", "{message}"),
        LogLevel::Warning => tracing::warn!(target: "coprocess", "{message}"),
        LogLevel::Error => tracing::error!(target: "coprocess", "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_maps_known_and_unknown_strings() {
        assert_eq!(LogLevel::from_host("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_host("WARNING"), LogLevel::Warning);
        assert_eq!(LogLevel::from_host("warn"), LogLevel::Warning);
        assert_eq!(LogLevel::from_host(" error "), LogLevel::Error);
        assert_eq!(LogLevel::from_host("info"), LogLevel::Info);
        assert_eq!(LogLevel::from_host("verbose"), LogLevel::Info);
        assert_eq!(LogLevel::from_host(""), LogLevel::Info);
    }
}
