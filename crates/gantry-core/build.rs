/// Builds the control-protocol bindings for `proto/gantry.proto` using
/// `tonic-prost-build`.
///
/// The proxied data plane has no generated code at all: those services are
/// discovered at runtime from user IDL. Only the administrative `Control`
/// service is compiled here.
///
/// # Files and Paths
///
/// - Proto file: `proto/gantry.proto`
/// - Includes: `proto/`
/// - Descriptor set: `$OUT_DIR/gantry_descriptor.bin` (served through
///   reflection on the control listener)
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("gantry_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/gantry.proto"], &["proto"])
        .unwrap();
}
