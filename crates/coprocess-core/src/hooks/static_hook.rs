use std::collections::HashMap;

use coprocess_proto::{Object, ReturnOverrides};
use serde::{Deserialize, Serialize};

use super::{Hook, HookContext, HookError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticReturnOverrides {
    pub response_code: i32,
    pub response_error: String,
    pub response_body: String,
    pub headers: HashMap<String, String>,
    pub override_error: bool,
}

/// Declarative hook definition loaded from the server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticHookConfig {
    pub name: String,
    pub set_headers: HashMap<String, String>,
    pub delete_headers: Vec<String>,
    pub add_params: HashMap<String, String>,
    pub delete_params: Vec<String>,
    /// Merged into the session metadata by the gateway.
    pub metadata: HashMap<String, String>,
    pub return_overrides: Option<StaticReturnOverrides>,
}

/// Applies a fixed set of request mutations to every object it receives.
#[derive(Debug, Clone)]
pub struct StaticHook {
    config: StaticHookConfig,
}

impl StaticHook {
    pub fn new(config: StaticHookConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn apply(&self, mut object: Object) -> Result<Object, HookError> {
        let config = &self.config;
        let request = object
            .request
            .as_mut()
            .ok_or_else(|| HookError::InvalidInput("object has no request".to_string()))?;

        request.set_headers.extend(
            config
                .set_headers
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        request
            .delete_headers
            .extend(config.delete_headers.iter().cloned());
        request.add_params.extend(
            config
                .add_params
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        request
            .delete_params
            .extend(config.delete_params.iter().cloned());

        if let Some(overrides) = config.return_overrides.as_ref() {
            request.return_overrides = Some(ReturnOverrides {
                response_code: overrides.response_code,
                response_error: overrides.response_error.clone(),
                headers: overrides.headers.clone(),
                override_error: overrides.override_error,
                response_body: overrides.response_body.clone(),
            });
        }

        object.metadata.extend(
            config
                .metadata
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        Ok(object)
    }
}

#[tonic::async_trait]
impl Hook for StaticHook {
    async fn call(&self, object: Object, _ctx: &HookContext) -> Result<Object, HookError> {
        tracing::debug!(target: "coprocess", hook = %self.config.name, "applying static hook");
        self.apply(object)
    }
}
