//! Hook and event handler registry served by the dispatcher.

pub mod static_hook;

pub use static_hook::{StaticHook, StaticHookConfig, StaticReturnOverrides};

use std::collections::HashMap;
use std::sync::Arc;

use coprocess_proto::Object;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tonic::Status;

use crate::host::{HostApi, HostError};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Failed(String),
    #[error("host call failed: {0}")]
    Host(#[from] HostError),
}

impl From<HookError> for Status {
    fn from(err: HookError) -> Self {
        match err {
            HookError::InvalidInput(message) => Status::invalid_argument(message),
            other => Status::internal(other.to_string()),
        }
    }
}

/// Context handed to every hook invocation.
#[derive(Clone)]
pub struct HookContext {
    host: Arc<dyn HostApi>,
}

impl HookContext {
    pub fn new(host: Arc<dyn HostApi>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &dyn HostApi {
        self.host.as_ref()
    }
}

#[tonic::async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, object: Object, ctx: &HookContext) -> Result<Object, HookError>;
}

#[tonic::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: EventMessage, ctx: &HookContext) -> Result<(), HookError>;
}

/// Adapts a synchronous closure into a [`Hook`].
pub struct FnHook<F>(F);

impl<F> FnHook<F>
where
    F: Fn(Object, &HookContext) -> Result<Object, HookError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[tonic::async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(Object, &HookContext) -> Result<Object, HookError> + Send + Sync,
{
    async fn call(&self, object: Object, ctx: &HookContext) -> Result<Object, HookError> {
        (self.0)(object, ctx)
    }
}

/// Adapts a synchronous closure into an [`EventHandler`].
pub struct FnEventHandler<F>(F);

impl<F> FnEventHandler<F>
where
    F: Fn(EventMessage, &HookContext) -> Result<(), HookError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[tonic::async_trait]
impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(EventMessage, &HookContext) -> Result<(), HookError> + Send + Sync,
{
    async fn handle(&self, event: EventMessage, ctx: &HookContext) -> Result<(), HookError> {
        (self.0)(event, ctx)
    }
}

/// JSON envelope carried in `Event.payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub handler_name: String,
    #[serde(default)]
    pub message: Value,
}

impl EventMessage {
    pub fn new(handler_name: impl Into<String>, message: Value) -> Self {
        Self {
            handler_name: handler_name.into(),
            message,
        }
    }

    pub fn from_payload(payload: &str) -> Result<Self, HookError> {
        serde_json::from_str(payload)
            .map_err(|err| HookError::InvalidInput(format!("invalid event payload: {err}")))
    }

    pub fn to_payload(&self) -> Result<String, HookError> {
        serde_json::to_string(self)
            .map_err(|err| HookError::InvalidInput(format!("invalid event message: {err}")))
    }
}

#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn Hook>>,
    event_handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_hook(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> &mut Self {
        self.hooks.insert(name.into(), hook);
        self
    }

    pub fn register_event_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.event_handlers.insert(name.into(), handler);
        self
    }

    pub fn hook(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.get(name).cloned()
    }

    pub fn event_handler(&self, name: &str) -> Option<Arc<dyn EventHandler>> {
        self.event_handlers.get(name).cloned()
    }

    pub fn has_hooks(&self) -> bool {
        !self.hooks.is_empty()
    }

    pub fn has_event_handlers(&self) -> bool {
        !self.event_handlers.is_empty()
    }

    pub fn hook_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
