//! # IDL service discovery
//!
//! Turns protobuf IDL files into [`ServiceDescriptor`]s at startup, without
//! compiling any schema. Only `package`, `import` and `service` declarations
//! matter; message bodies are skipped because payloads are never decoded by
//! the gateway.
//!
//! ## Import resolution
//!
//! Imports are resolved against the base directory and followed
//! transitively. Each file is read once, so diamonds and cycles are safe.
//! Missing `google/protobuf/*` imports are ignored (well-known types are
//! rarely vendored next to user IDL); any other missing import is an error.
//!
//! ## Ordering
//!
//! Services of the root file come first in declaration order, then those of
//! its imports, depth first in import order.

mod descriptor;
mod lexer;
mod parser;

pub use descriptor::{MethodDescriptor, ServiceDescriptor, StreamingKind};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Import prefix of the protobuf well-known types.
const WELL_KNOWN_PREFIX: &str = "google/protobuf/";

/// Failure to turn IDL into service descriptors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{}:{line}: {message}", file.display())]
    Syntax {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Failed to read {}: {source}", file.display())]
    Io {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: import {import:?} not found under {}", file.display(), base_dir.display())]
    MissingImport {
        file: PathBuf,
        line: usize,
        import: String,
        base_dir: PathBuf,
    },

    #[error("Service {name} in {} is already declared in {}", file.display(), previous.display())]
    DuplicateService {
        name: String,
        file: PathBuf,
        previous: PathBuf,
    },
}

impl ParseError {
    /// The file the error points at.
    pub fn file(&self) -> &Path {
        match self {
            ParseError::Syntax { file, .. }
            | ParseError::Io { file, .. }
            | ParseError::MissingImport { file, .. }
            | ParseError::DuplicateService { file, .. } => file,
        }
    }
}

/// Parses a single IDL source without following its imports.
///
/// `file` is only used to label errors.
pub fn parse_str(source: &str, file: impl AsRef<Path>) -> Result<Vec<ServiceDescriptor>, ParseError> {
    let file = file.as_ref();
    let parsed = parser::parse_source(source).map_err(|err| ParseError::Syntax {
        file: file.to_path_buf(),
        line: err.line,
        message: err.message,
    })?;

    let mut seen = HashMap::new();
    for service in &parsed.services {
        check_unique(&mut seen, service, file)?;
    }
    Ok(parsed.services)
}

/// Parses `root` and every file it imports, resolved against `base_dir`.
pub fn parse_file(
    root: impl AsRef<Path>,
    base_dir: impl AsRef<Path>,
) -> Result<Vec<ServiceDescriptor>, ParseError> {
    let mut walk = Walk {
        base_dir: base_dir.as_ref(),
        visited: HashSet::new(),
        declared: HashMap::new(),
        services: Vec::new(),
    };
    walk.visit(root.as_ref())?;
    Ok(walk.services)
}

struct Walk<'a> {
    base_dir: &'a Path,
    visited: HashSet<PathBuf>,
    declared: HashMap<String, PathBuf>,
    services: Vec<ServiceDescriptor>,
}

impl Walk<'_> {
    fn visit(&mut self, file: &Path) -> Result<(), ParseError> {
        let key = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
        if !self.visited.insert(key) {
            return Ok(());
        }

        let source = std::fs::read_to_string(file).map_err(|source| ParseError::Io {
            file: file.to_path_buf(),
            source,
        })?;
        let parsed = parser::parse_source(&source).map_err(|err| ParseError::Syntax {
            file: file.to_path_buf(),
            line: err.line,
            message: err.message,
        })?;

        for service in parsed.services {
            check_unique(&mut self.declared, &service, file)?;
            self.services.push(service);
        }

        for import in parsed.imports {
            let path = self.base_dir.join(&import.path);
            if path.is_file() {
                self.visit(&path)?;
            } else if !import.path.starts_with(WELL_KNOWN_PREFIX) {
                return Err(ParseError::MissingImport {
                    file: file.to_path_buf(),
                    line: import.line,
                    import: import.path,
                    base_dir: self.base_dir.to_path_buf(),
                });
            }
        }

        Ok(())
    }
}

fn check_unique(
    declared: &mut HashMap<String, PathBuf>,
    service: &ServiceDescriptor,
    file: &Path,
) -> Result<(), ParseError> {
    let name = service.full_name();
    if let Some(previous) = declared.get(&name) {
        return Err(ParseError::DuplicateService {
            name,
            file: file.to_path_buf(),
            previous: previous.clone(),
        });
    }
    declared.insert(name, file.to_path_buf());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_services_in_one_file_are_rejected() {
        let err = parse_str(
            "package pkg;\nservice Echo {}\nservice Echo {}\n",
            "echo.proto",
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::DuplicateService { ref name, .. } if name == "pkg.Echo"));
    }

    #[test]
    fn syntax_errors_name_file_and_line() {
        let err = parse_str("syntax = \"proto3\";\nservice {}\n", "broken.proto").unwrap_err();
        assert_eq!(err.file(), Path::new("broken.proto"));
        assert!(err.to_string().starts_with("broken.proto:2:"), "{err}");
    }

    #[test]
    fn same_name_in_different_packages_is_fine() {
        let services = parse_str("service Echo { rpc Say (A) returns (B); }", "a.proto").unwrap();
        assert_eq!(services[0].full_name(), "Echo");
        assert!(services[0].method("Say").is_some());
        assert!(services[0].method("say").is_none());
    }
}
