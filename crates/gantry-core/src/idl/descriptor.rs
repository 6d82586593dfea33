//! Runtime service descriptors produced from IDL.

/// How messages flow in each direction of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamingKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl StreamingKind {
    /// Builds the kind from the `stream` markers on the request and response.
    pub const fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => StreamingKind::Unary,
            (true, false) => StreamingKind::ClientStreaming,
            (false, true) => StreamingKind::ServerStreaming,
            (true, true) => StreamingKind::BidiStreaming,
        }
    }

    pub const fn is_client_streaming(self) -> bool {
        matches!(self, StreamingKind::ClientStreaming | StreamingKind::BidiStreaming)
    }

    pub const fn is_server_streaming(self) -> bool {
        matches!(self, StreamingKind::ServerStreaming | StreamingKind::BidiStreaming)
    }
}

/// One `rpc` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: StreamingKind,
    /// Declared request type, as written. Never resolved.
    pub input_type: String,
    /// Declared response type, as written. Never resolved.
    pub output_type: String,
}

/// One `service` declaration with its methods in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub package: String,
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    /// The service name used on the wire: `package.Service`, or just
    /// `Service` when the file declares no package.
    pub fn full_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|method| method.name == name)
    }
}
