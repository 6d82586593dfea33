//! The dynamic call proxy and its gRPC routing.
//!
//! Services are not generated from the IDL at build time. Each discovered
//! service gets a [`CallProxy`](handler::CallProxy), which forwards calls to
//! the worker pool as raw bytes, and a [`ProxyService`](grpc::ProxyService),
//! which routes `/{service}/{method}` requests to it through tonic's codec
//! machinery.
//!
//! ## Structure
//!
//! - [`handler`] - Per-service call proxy (`CallProxy`).
//! - [`grpc`] - Tower service routing HTTP/2 requests to the proxy.

pub mod grpc;
pub mod handler;
