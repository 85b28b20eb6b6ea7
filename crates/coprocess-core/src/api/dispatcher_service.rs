//! Dispatcher gRPC service implementation.
//!
//! Routes `Dispatch` calls to hooks by `Object.hook_name` and
//! `DispatchEvent` calls to event handlers by the envelope's `handler_name`.

use std::sync::Arc;
use std::time::Instant;

use coprocess_proto::dispatcher_server::{Dispatcher, DispatcherServer};
use coprocess_proto::{Event, EventReply, METHOD_NOT_IMPLEMENTED, Object};
use tonic::{Request, Response, Status};

use crate::hooks::{EventMessage, HookContext, HookRegistry};
use crate::host::{HostApi, InMemoryHost};

pub const DEFAULT_GRPC_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// The Dispatcher service implementation.
///
/// With an empty registry both methods answer `UNIMPLEMENTED`.
pub struct DispatcherService {
    registry: Arc<HookRegistry>,
    context: HookContext,
}

impl DispatcherService {
    pub fn new(registry: HookRegistry, host: Arc<dyn HostApi>) -> Self {
        Self {
            registry: Arc::new(registry),
            context: HookContext::new(host),
        }
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Wraps the service for `tonic::transport::Server::add_service`.
    pub fn into_server(self, max_message_bytes: usize) -> DispatcherServer<Self> {
        DispatcherServer::new(self)
            .max_decoding_message_size(max_message_bytes)
            .max_encoding_message_size(max_message_bytes)
    }
}

impl Default for DispatcherService {
    fn default() -> Self {
        Self::new(HookRegistry::new(), Arc::new(InMemoryHost::new()))
    }
}

fn unimplemented() -> Status {
    Status::unimplemented(METHOD_NOT_IMPLEMENTED)
}

#[tonic::async_trait]
impl Dispatcher for DispatcherService {
    async fn dispatch(&self, request: Request<Object>) -> Result<Response<Object>, Status> {
        if !self.registry.has_hooks() {
            return Err(unimplemented());
        }
        let object = request.into_inner();
        let Some(hook) = self.registry.hook(&object.hook_name) else {
            tracing::warn!(
                target: "coprocess",
                hook = %object.hook_name,
                "no hook registered, returning object unchanged"
            );
            return Ok(Response::new(object));
        };

        let hook_name = object.hook_name.clone();
        let started = Instant::now();
        let result = hook.call(object, &self.context).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(object) => {
                tracing::debug!(target: "coprocess", hook = %hook_name, elapsed_ms, "hook dispatched");
                Ok(Response::new(object))
            }
            Err(err) => {
                tracing::error!(target: "coprocess", hook = %hook_name, error = %err, "hook failed");
                Err(err.into())
            }
        }
    }

    async fn dispatch_event(
        &self,
        request: Request<Event>,
    ) -> Result<Response<EventReply>, Status> {
        if !self.registry.has_event_handlers() {
            return Err(unimplemented());
        }
        let event = EventMessage::from_payload(&request.into_inner().payload)?;
        let Some(handler) = self.registry.event_handler(&event.handler_name) else {
            tracing::warn!(
                target: "coprocess",
                handler = %event.handler_name,
                "no event handler registered"
            );
            return Ok(Response::new(EventReply {}));
        };

        let handler_name = event.handler_name.clone();
        if let Err(err) = handler.handle(event, &self.context).await {
            tracing::error!(target: "coprocess", handler = %handler_name, error = %err, "event handler failed");
            return Err(err.into());
        }
        Ok(Response::new(EventReply {}))
    }
}
