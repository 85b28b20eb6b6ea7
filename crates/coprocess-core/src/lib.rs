//! Coprocess dispatcher core.
//!
//! This crate provides:
//! - the `coprocess.Dispatcher` gRPC servicer and its hook registry
//! - the gateway-side gRPC driver and coprocess middleware lifecycle
//! - the host-call surface (`CoProcessLog`, `TykGetData`, `TykStoreData`,
//!   `TykTriggerEvent`) as both consumer and provider
//! - configuration, logging, graceful shutdown and the `coprocessctl` CLI

pub mod api;
pub mod cli;
pub mod config;
pub mod driver;
pub mod hooks;
pub mod host;
pub mod logging;
pub mod middleware;
pub mod server;
pub mod shutdown;
