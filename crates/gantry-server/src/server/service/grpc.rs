//! Tower service exposing a [`CallProxy`] over gRPC.
//!
//! This is the hand-written counterpart of the server stub tonic would
//! generate for a service: the same `Grpc` dispatch per method kind, with the
//! method table looked up at runtime and [`PassThroughCodec`] in place of a
//! message codec.

use super::handler::{CallProxy, ResponseStream};
use bytes::Bytes;
use core::{
    convert::Infallible,
    task::{Context, Poll},
};
use gantry_core::{codec::PassThroughCodec, idl::StreamingKind};
use std::sync::Arc;
use tonic::{
    Request, Response, Status, Streaming,
    codegen::{
        Body, BoxFuture, CompressionEncoding, EnabledCompressionEncodings, Service, StdError, http,
    },
    server::{
        ClientStreamingService, Grpc, ServerStreamingService, StreamingService, UnaryService,
    },
};
use tracing::Instrument;

/// Routes `/{service}/{method}` requests to a [`CallProxy`].
#[derive(Clone)]
pub struct ProxyService {
    proxy: Arc<CallProxy>,
    accept_compression_encodings: EnabledCompressionEncodings,
    send_compression_encodings: EnabledCompressionEncodings,
    max_decoding_message_size: Option<usize>,
    max_encoding_message_size: Option<usize>,
}

impl ProxyService {
    pub fn new(proxy: Arc<CallProxy>) -> Self {
        Self {
            proxy,
            accept_compression_encodings: EnabledCompressionEncodings::default(),
            send_compression_encodings: EnabledCompressionEncodings::default(),
            max_decoding_message_size: None,
            max_encoding_message_size: None,
        }
    }

    pub fn proxy(&self) -> &Arc<CallProxy> {
        &self.proxy
    }

    /// The axum route capturing every method of the service.
    pub fn route(&self) -> String {
        format!("/{}/{{*method}}", self.proxy.service())
    }

    /// Enable decompressing requests with the given encoding.
    #[must_use]
    pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
        self.accept_compression_encodings.enable(encoding);
        self
    }

    /// Compress responses with the given encoding, if the client supports it.
    #[must_use]
    pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
        self.send_compression_encodings.enable(encoding);
        self
    }

    #[must_use]
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.max_decoding_message_size = Some(limit);
        self
    }

    #[must_use]
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.max_encoding_message_size = Some(limit);
        self
    }

    fn grpc(&self) -> Grpc<PassThroughCodec> {
        Grpc::new(PassThroughCodec)
            .apply_compression_config(
                self.accept_compression_encodings,
                self.send_compression_encodings,
            )
            .apply_max_message_size_config(
                self.max_decoding_message_size,
                self.max_encoding_message_size,
            )
    }
}

/// Extracts the method name from `/{service}/{method}`.
fn method_name<'a>(path: &'a str, service: &str) -> Option<&'a str> {
    let method = path
        .strip_prefix('/')?
        .strip_prefix(service)?
        .strip_prefix('/')?;
    (!method.is_empty() && !method.contains('/')).then_some(method)
}

impl<B> Service<http::Request<B>> for ProxyService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let service = self.proxy.service();
        let method = method_name(req.uri().path(), service).unwrap_or_default().to_owned();

        let kind = match self.proxy.kind(&method) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::debug!(service, method = %method, "Rejecting unknown method");
                let response = Status::from(err).into_http();
                return Box::pin(async move { Ok(response) });
            }
        };

        let span = tracing::info_span!(
            "call",
            service = %service,
            method = %method,
            kind = ?kind,
        );
        let proxy = Arc::clone(&self.proxy);
        let mut grpc = self.grpc();

        let fut = async move {
            let response = match kind {
                StreamingKind::Unary => grpc.unary(UnaryCall { proxy, method }, req).await,
                StreamingKind::ServerStreaming => {
                    grpc.server_streaming(ServerStreamingCall { proxy, method }, req)
                        .await
                }
                StreamingKind::ClientStreaming => {
                    grpc.client_streaming(ClientStreamingCall { proxy, method }, req)
                        .await
                }
                StreamingKind::BidiStreaming => {
                    grpc.streaming(StreamingCall { proxy, method }, req).await
                }
            };
            Ok(response)
        };
        Box::pin(fut.instrument(span))
    }
}

struct UnaryCall {
    proxy: Arc<CallProxy>,
    method: String,
}

impl UnaryService<Bytes> for UnaryCall {
    type Response = Bytes;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let proxy = Arc::clone(&self.proxy);
        let method = self.method.clone();
        Box::pin(async move { proxy.unary(&method, request).await })
    }
}

struct ServerStreamingCall {
    proxy: Arc<CallProxy>,
    method: String,
}

impl ServerStreamingService<Bytes> for ServerStreamingCall {
    type Response = Bytes;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let proxy = Arc::clone(&self.proxy);
        let method = self.method.clone();
        Box::pin(async move { proxy.server_streaming(&method, request).await })
    }
}

struct ClientStreamingCall {
    proxy: Arc<CallProxy>,
    method: String,
}

impl ClientStreamingService<Bytes> for ClientStreamingCall {
    type Response = Bytes;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let proxy = Arc::clone(&self.proxy);
        let method = self.method.clone();
        Box::pin(async move { proxy.client_streaming(&method, request).await })
    }
}

struct StreamingCall {
    proxy: Arc<CallProxy>,
    method: String,
}

impl StreamingService<Bytes> for StreamingCall {
    type Response = Bytes;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let proxy = Arc::clone(&self.proxy);
        let method = self.method.clone();
        Box::pin(async move { proxy.streaming(&method, request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_name_requires_the_service_prefix() {
        assert_eq!(method_name("/pkg.Echo/Say", "pkg.Echo"), Some("Say"));
        assert_eq!(method_name("/pkg.Echo/", "pkg.Echo"), None);
        assert_eq!(method_name("/pkg.EchoX/Say", "pkg.Echo"), None);
        assert_eq!(method_name("/pkg.Echo/Say/More", "pkg.Echo"), None);
        assert_eq!(method_name("/other.Echo/Say", "pkg.Echo"), None);
    }
}
