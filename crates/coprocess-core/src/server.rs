//! Dispatcher server bootstrap: host selection, hook registry, listener
//! and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::api::DispatcherService;
use crate::config::{HostMode, ServerConfig};
use crate::hooks::{
    EventMessage, FnEventHandler, HookContext, HookError, HookRegistry, StaticHook,
    StaticHookConfig,
};
use crate::host::{HostApi, HostError, LinkedHost, exports};
use crate::shutdown::{ShutdownMode, ShutdownPolicy, ShutdownState};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Picks the host backing hook calls.
///
/// `Auto` prefers the gateway's symbols and falls back to the process-wide
/// in-memory host, which is also what the exported C symbols use.
pub fn build_host(mode: HostMode) -> Result<Arc<dyn HostApi>, ServerError> {
    match mode {
        HostMode::Linked => Ok(Arc::new(LinkedHost::load()?)),
        HostMode::InMemory => Ok(exports::installed().clone()),
        HostMode::Auto => match LinkedHost::load() {
            Ok(host) => {
                tracing::info!(target: "coprocess", "using gateway host symbols");
                Ok(Arc::new(host))
            }
            Err(err) => {
                tracing::warn!(target: "coprocess", error = %err, "gateway host symbols unavailable, using in-memory host");
                Ok(exports::installed().clone())
            }
        },
    }
}

/// Registers configured static hooks and event forwarders.
pub fn build_registry(hooks: &[StaticHookConfig], forward_events: &[String]) -> HookRegistry {
    let mut registry = HookRegistry::new();
    for config in hooks {
        let hook = StaticHook::new(config.clone());
        registry.register_hook(hook.name().to_string(), Arc::new(hook));
    }
    for name in forward_events {
        registry.register_event_handler(name.clone(), Arc::new(FnEventHandler::new(forward_event)));
    }
    registry
}

fn forward_event(event: EventMessage, ctx: &HookContext) -> Result<(), HookError> {
    let payload = match &event.message {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    ctx.host().trigger_event(&event.handler_name, &payload)?;
    Ok(())
}

pub fn build_service(config: &ServerConfig, host: Arc<dyn HostApi>) -> DispatcherService {
    let registry = build_registry(&config.hooks, &config.forward_events);
    tracing::info!(target: "coprocess", hooks = ?registry.hook_names(), "hook registry loaded");
    DispatcherService::new(registry, host)
}

/// Drops expired host entries every `every` until shutdown begins.
pub fn spawn_purge_task(
    host: Arc<dyn HostApi>,
    every: Duration,
    shutdown: Arc<ShutdownState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = host.purge_expired();
                    if purged > 0 {
                        tracing::debug!(target: "coprocess", purged, "purged expired host entries");
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    })
}

/// Binds `config.listen_addr` and serves until `shutdown` begins.
pub async fn serve(config: &ServerConfig, shutdown: Arc<ShutdownState>) -> Result<(), ServerError> {
    let host = build_host(config.host)?;
    let service = build_service(config, host.clone());
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;
    let purge = config
        .purge_interval()
        .map(|every| spawn_purge_task(host, every, shutdown.clone()));
    let result = serve_with_listener(
        listener,
        service,
        config.max_message_bytes,
        shutdown,
        config.shutdown_policy(),
    )
    .await;
    if let Some(purge) = purge {
        purge.abort();
    }
    result
}

pub async fn serve_with_listener(
    listener: TcpListener,
    service: DispatcherService,
    max_message_bytes: usize,
    shutdown: Arc<ShutdownState>,
    policy: ShutdownPolicy,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(target: "coprocess", %addr, "coprocess dispatcher listening");
    }

    let signal = shutdown.clone();
    let server = Server::builder()
        .add_service(service.into_server(max_message_bytes))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.wait().await
        });
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return Ok(result?),
        _ = shutdown.wait() => {}
    }

    match policy.mode {
        ShutdownMode::Cancel => {
            tracing::info!(target: "coprocess", "shutdown: cancelling in-flight calls");
            Ok(())
        }
        ShutdownMode::Drain => {
            tracing::info!(
                target: "coprocess",
                timeout_ms = policy.drain_timeout.as_millis() as u64,
                "shutdown: draining in-flight calls"
            );
            match tokio::time::timeout(policy.drain_timeout, server).await {
                Ok(result) => Ok(result?),
                Err(_) => {
                    tracing::warn!(target: "coprocess", "drain timeout elapsed, dropping remaining calls");
                    Ok(())
                }
            }
        }
    }
}
