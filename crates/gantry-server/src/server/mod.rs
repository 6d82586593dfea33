//! Server-side components of the gantry gateway.
//!
//! ## Submodules
//!
//! - [`gateway`] - Lifecycle orchestration: worker pool, listeners, drain.
//! - [`service`] - The dynamic call proxy registered once per IDL service.
//! - [`streaming`] - In-order forwarding of streamed messages.
//! - [`pool`] - A [`WorkerPool`](gantry_core::pool::WorkerPool) backed by
//!   child processes.
//! - [`control`] - The administrative `gantry.Control` service.
//! - [`telemetry`] - Logging, tracing and metrics setup.

pub mod config;
pub mod control;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod service;
pub mod streaming;
pub mod telemetry;
