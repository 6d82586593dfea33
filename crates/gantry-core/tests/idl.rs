use gantry_core::idl::{self, ParseError, StreamingKind};
use std::path::{Path, PathBuf};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

#[test]
fn discovers_services_across_imports_in_order() {
    let base = fixtures();
    let services = idl::parse_file(base.join("api.proto"), &base).unwrap();

    let names: Vec<_> = services.iter().map(|s| s.full_name()).collect();
    assert_eq!(names, ["pkg.Echo", "shared.Ping", "admin.Admin"]);

    let echo = &services[0];
    let kinds: Vec<_> = echo.methods.iter().map(|m| (m.name.as_str(), m.kind)).collect();
    assert_eq!(
        kinds,
        [
            ("Say", StreamingKind::Unary),
            ("Upload", StreamingKind::ClientStreaming),
            ("Watch", StreamingKind::ServerStreaming),
            ("Chat", StreamingKind::BidiStreaming),
        ]
    );
    assert_eq!(echo.methods[0].input_type, "shared.Message");
}

#[test]
fn import_cycles_terminate() {
    let base = fixtures();
    let services = idl::parse_file(base.join("cycle/a.proto"), &base).unwrap();
    let names: Vec<_> = services.iter().map(|s| s.full_name()).collect();
    assert_eq!(names, ["cycle.A", "cycle.B"]);
}

#[test]
fn missing_import_points_at_the_import_line() {
    let base = fixtures();
    let err = idl::parse_file(base.join("missing.proto"), &base).unwrap_err();
    match err {
        ParseError::MissingImport {
            file, line, import, ..
        } => {
            assert!(file.ends_with("missing.proto"));
            assert_eq!(line, 5);
            assert_eq!(import, "does/not/exist.proto");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn duplicate_service_across_files_is_rejected() {
    let base = fixtures();
    let err = idl::parse_file(base.join("duplicate.proto"), &base).unwrap_err();
    match err {
        ParseError::DuplicateService {
            name,
            file,
            previous,
        } => {
            assert_eq!(name, "shared.Ping");
            assert!(file.ends_with("shared/types.proto"));
            assert!(previous.ends_with("duplicate.proto"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn syntax_error_reports_file_and_line() {
    let base = fixtures();
    let err = idl::parse_file(base.join("broken.proto"), &base).unwrap_err();
    assert!(err.file().ends_with("broken.proto"));
    assert!(matches!(err, ParseError::Syntax { line: 6, .. }), "{err}");
}

#[test]
fn unreadable_root_is_an_io_error() {
    let base = fixtures();
    let err = idl::parse_file(base.join("nope.proto"), &base).unwrap_err();
    assert!(matches!(err, ParseError::Io { .. }));
}
