//! Gateway-side dispatch drivers.
//!
//! A driver delivers `Object`s and event payloads to a coprocess runtime.
//! The gRPC driver is the only transport implemented here; embedded
//! runtimes register their own [`DriverDispatcher`].

pub mod grpc;
pub mod registry;

pub use grpc::{CallOptions, GrpcDispatcher, dispatch_event_once, dispatch_once};
pub use registry::DriverRegistry;

use std::fmt;
use std::str::FromStr;

use coprocess_proto::Object;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiddlewareDriver {
    #[default]
    Otto,
    Python,
    Lua,
    Grpc,
    Goplugin,
}

pub const SUPPORTED_DRIVERS: [MiddlewareDriver; 3] = [
    MiddlewareDriver::Python,
    MiddlewareDriver::Lua,
    MiddlewareDriver::Grpc,
];

impl MiddlewareDriver {
    pub fn as_str(self) -> &'static str {
        match self {
            MiddlewareDriver::Otto => "otto",
            MiddlewareDriver::Python => "python",
            MiddlewareDriver::Lua => "lua",
            MiddlewareDriver::Grpc => "grpc",
            MiddlewareDriver::Goplugin => "goplugin",
        }
    }

    pub fn is_coprocess(self) -> bool {
        SUPPORTED_DRIVERS.contains(&self)
    }
}

impl fmt::Display for MiddlewareDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MiddlewareDriver {
    type Err = DriverError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "otto" => Ok(MiddlewareDriver::Otto),
            "python" => Ok(MiddlewareDriver::Python),
            "lua" => Ok(MiddlewareDriver::Lua),
            "grpc" => Ok(MiddlewareDriver::Grpc),
            "goplugin" => Ok(MiddlewareDriver::Goplugin),
            other => Err(DriverError::UnknownDriver(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),
    #[error("coprocess is not enabled")]
    Disabled,
    #[error("Unsupported driver '{0}'")]
    Unsupported(MiddlewareDriver),
    #[error("Driver '{0}' isn't loaded")]
    NotLoaded(MiddlewareDriver),
    #[error("Couldn't dispatch request, driver '{0}' isn't available")]
    Unavailable(MiddlewareDriver),
    #[error("invalid coprocess endpoint '{target}': {reason}")]
    InvalidEndpoint { target: String, reason: String },
    #[error("invalid call metadata: {0}")]
    InvalidMetadata(String),
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("dispatch failed: {0}")]
    Rpc(Box<Status>),
}

impl From<Status> for DriverError {
    fn from(status: Status) -> Self {
        DriverError::Rpc(Box::new(status))
    }
}

/// A transport to a coprocess runtime.
#[tonic::async_trait]
pub trait DriverDispatcher: Send + Sync {
    async fn dispatch(&self, object: Object) -> Result<Object, DriverError>;

    async fn dispatch_event(&self, payload: String) -> Result<(), DriverError>;

    /// Reloads middleware bundles. Drivers without reload support ignore it.
    fn reload(&self) {}
}
