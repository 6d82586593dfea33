pub mod envelope;
pub mod error;

pub use error::{Error, Result};

/// Generated bindings for the administrative `gantry.Control` service.
///
/// The proxied data plane never goes through generated code; only the
/// control listener does.
pub mod proto {
    tonic::include_proto!("gantry");

    /// Encoded descriptor set for `proto/gantry.proto`, registered with the
    /// reflection service on the control listener.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("gantry_descriptor");
}
