//! Coprocess protocol buffer generated code.
//!
//! Client and server stubs for the `coprocess.Dispatcher` service together
//! with the object model exchanged between the gateway and a coprocess.

pub mod coprocess {
    tonic::include_proto!("coprocess");
}

pub use coprocess::*;

/// Fully qualified gRPC service name.
pub const DISPATCHER_SERVICE_NAME: &str = "coprocess.Dispatcher";

/// Status details returned by a servicer that does not implement a method.
pub const METHOD_NOT_IMPLEMENTED: &str = "Method not implemented!";
