//! Gateway-side coprocess middleware.
//!
//! [`CoProcessMiddleware`] turns an HTTP request (and, for response hooks,
//! the upstream response) into an [`Object`](coprocess_proto::Object),
//! hands it to a loaded driver and applies whatever the coprocess changed.

pub mod headers;
mod object;
mod process;

pub use headers::{canonical_header_key, obfuscate_key, sync_headers_and_multivalue_headers};
pub use process::{AUTH_FAILURE_EVENT, RequestOutcome};

use std::sync::Arc;

use coprocess_proto::HookType;
use http::{Method, Uri};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::driver::{DriverError, DriverRegistry, MiddlewareDriver};

/// The slice of an API definition the middleware reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSpec {
    pub org_id: String,
    pub api_id: String,
    pub config_data: Map<String, Value>,
    pub config_data_disabled: bool,
    /// Hash of the custom middleware bundle, empty when none is configured.
    pub bundle_hash: String,
    pub enable_coprocess_auth: bool,
    pub custom_plugin_auth_enabled: bool,
    pub driver: MiddlewareDriver,
}

impl ApiSpec {
    pub fn coprocess_auth_enabled(&self) -> bool {
        self.enable_coprocess_auth || self.custom_plugin_auth_enabled
    }

    pub(crate) fn should_add_config_data(&self) -> bool {
        !self.config_data_disabled && !self.config_data.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("object has no request")]
    MissingRequest,
    #[error("No response object returned by response hook")]
    MissingResponse,
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("invalid method '{0}'")]
    InvalidMethod(String),
    #[error("invalid status code {0}")]
    InvalidStatus(i32),
    #[error("failed to encode config data: {0}")]
    ConfigData(#[from] serde_json::Error),
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Every response hook failure; the response is left untouched.
    #[error("Middleware error")]
    ResponseHook(#[source] Box<MiddlewareError>),
}

/// Request extension: the URL a rewrite middleware resolved for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRewriteTarget(pub Uri);

/// Request extension: the method a transform middleware will apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequestMethod(pub Method);

/// Request extension set by earlier middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    OkAndIgnore,
}

/// Request extension: key id of a session created by a coprocess auth hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey(pub String);

/// One configured coprocess hook in an API's middleware chain.
#[derive(Clone)]
pub struct CoProcessMiddleware {
    hook_type: HookType,
    hook_name: String,
    driver: MiddlewareDriver,
    raw_body_only: bool,
    spec: Arc<ApiSpec>,
    drivers: Arc<DriverRegistry>,
}

impl CoProcessMiddleware {
    pub fn new(
        hook_type: HookType,
        hook_name: impl Into<String>,
        spec: Arc<ApiSpec>,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        Self {
            hook_type,
            hook_name: hook_name.into(),
            driver: spec.driver,
            raw_body_only: false,
            spec,
            drivers,
        }
    }

    /// Keeps bodies out of the `body` string fields; only `raw_body` is sent.
    pub fn raw_body_only(mut self, raw_body_only: bool) -> Self {
        self.raw_body_only = raw_body_only;
        self
    }

    pub fn name(&self) -> &'static str {
        "CoProcessMiddleware"
    }

    pub fn hook_type(&self) -> HookType {
        self.hook_type
    }

    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    /// Whether this middleware can run for its API, logging the reason when not.
    pub fn enabled_for_spec(&self) -> bool {
        match self.drivers.enabled_for(self.driver) {
            Ok(()) => {
                tracing::debug!(target: "coprocess", "Enabling CP middleware.");
                true
            }
            Err(DriverError::Disabled) => {
                tracing::error!(
                    target: "coprocess",
                    "Your API specifies a CP custom middleware, either the gateway wasn't built with CP support or CP is not enabled in your configuration file!"
                );
                false
            }
            Err(err) => {
                tracing::error!(target: "coprocess", "{err}");
                false
            }
        }
    }
}
