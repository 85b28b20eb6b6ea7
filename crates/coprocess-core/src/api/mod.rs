//! gRPC API handlers for the Dispatcher service.
//!
//! This module contains the coprocess-side implementation of the
//! `coprocess.Dispatcher` service as defined in `proto/coprocess/coprocess_object.proto`.

pub mod dispatcher_service;

pub use dispatcher_service::{DEFAULT_GRPC_MAX_MESSAGE_BYTES, DispatcherService};
