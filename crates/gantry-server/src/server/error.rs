//! Startup failures.
//!
//! Anything that prevents the gateway from serving is reported through
//! [`Error`]. Per-call failures never end up here; they are
//! [`gantry_core::Error`]s converted to `tonic::Status` at the proxy.

use gantry_core::{idl::ParseError, pool::PoolError};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Gateway is already serving")]
    AlreadyServing,

    #[error("Failed to load service definitions: {0}")]
    Idl(#[from] ParseError),

    #[error("Service {name} is reserved by the gateway")]
    ReservedService { name: String },

    #[error("Service {name} is registered more than once")]
    DuplicateService { name: String },

    #[error("Failed to read TLS material {}: {source}", path.display())]
    Tls {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unix domain sockets are not supported on this platform")]
    UnsupportedListener,

    #[error("Worker pool failed: {0}")]
    Pool(#[from] PoolError),

    #[error("Failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}
