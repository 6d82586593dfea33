//! The dynamic call proxy.
//!
//! One [`CallProxy`] exists per discovered service. It knows the service's
//! ordered method list and forwards every call to the shared
//! [`WorkerPool`] as a [`CallEnvelope`], without ever decoding a payload.
//!
//! ## Responsibilities
//!
//! - Reject unknown methods with `UNIMPLEMENTED`.
//! - Reject calls while the gateway is not [`ServiceState::Active`].
//! - Derive each call's deadline, cancellation and metadata.
//! - Race the pool against the call's deadline and cancellation.
//! - Apply the streaming semantics of each method kind.

use crate::server::{
    streaming::coordinator::{CallStream, forward_stream},
    telemetry::{
        decrement_calls_inflight, increment_call_errors, increment_calls,
        increment_calls_inflight, record_call_duration,
    },
};
use bytes::Bytes;
use core::{fmt, pin::Pin};
use futures::{Stream, StreamExt};
use gantry_core::{
    Error,
    envelope::{CallContext, CallEnvelope},
    idl::{MethodDescriptor, ServiceDescriptor, StreamingKind},
    pool::WorkerPool,
};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, metadata::MetadataMap};
use tracing::Instrument;

/// Outbound messages of a streaming response.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// Lifecycle of the proxied services, shared by every [`CallProxy`] of a
/// gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Registered with a server that is not serving yet.
    Registered,
    /// Serving calls.
    Active,
    /// A stop was requested; in-flight calls are finishing.
    Draining,
    /// The server is gone.
    Closed,
}

impl ServiceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ServiceState::Registered => "registered",
            ServiceState::Active => "active",
            ServiceState::Draining => "draining",
            ServiceState::Closed => "closed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records one call's metrics. In-flight accounting ends on drop, so
/// cancelled calls are counted too.
pub(crate) struct CallMetrics {
    start: Instant,
}

impl CallMetrics {
    pub(crate) fn start(service: &str, method: &str) -> Self {
        increment_calls(service, method);
        increment_calls_inflight();
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn fail(&self, status: &Status) {
        increment_call_errors(status.code());
        tracing::debug!(code = ?status.code(), "Call failed: {}", status.message());
    }

    fn finish<T>(&self, result: Result<T, Status>) -> Result<T, Status> {
        if let Err(status) = &result {
            self.fail(status);
        }
        result
    }
}

impl Drop for CallMetrics {
    fn drop(&mut self) {
        decrement_calls_inflight();
        record_call_duration(self.start.elapsed().as_secs_f64() * 1_000.0);
    }
}

/// Forwards the calls of one service to the worker pool.
pub struct CallProxy {
    service: String,
    methods: Vec<MethodDescriptor>,
    kinds: HashMap<String, StreamingKind>,
    pool: Arc<dyn WorkerPool>,
    state: watch::Receiver<ServiceState>,
    calls: CancellationToken,
    stream_buffer_size: usize,
}

impl CallProxy {
    /// Builds the proxy for `descriptor`.
    ///
    /// `calls` is the root of every call's cancellation token; cancelling it
    /// aborts all in-flight calls.
    pub fn new(
        descriptor: ServiceDescriptor,
        pool: Arc<dyn WorkerPool>,
        state: watch::Receiver<ServiceState>,
        calls: CancellationToken,
    ) -> Self {
        let service = descriptor.full_name();
        let kinds = descriptor
            .methods
            .iter()
            .map(|method| (method.name.clone(), method.kind))
            .collect();

        Self {
            service,
            methods: descriptor.methods,
            kinds,
            pool,
            state,
            calls,
            stream_buffer_size: 8,
        }
    }

    pub fn with_stream_buffer_size(mut self, stream_buffer_size: usize) -> Self {
        self.stream_buffer_size = stream_buffer_size.max(1);
        self
    }

    /// Fully-qualified service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Methods in declaration order.
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn kind(&self, method: &str) -> Result<StreamingKind, Error> {
        self.kinds
            .get(method)
            .copied()
            .ok_or_else(|| Error::Unimplemented {
                service: self.service.clone(),
                method: method.to_owned(),
            })
    }

    /// Admits a new call of `method`. Only new calls are gated on the state:
    /// a stream accepted while active keeps running through a drain.
    fn admit(&self, method: &str) -> Result<(), Error> {
        self.kind(method)?;
        match self.state() {
            ServiceState::Active => Ok(()),
            state => Err(Error::Unavailable {
                reason: format!("service {} is {state}", self.service),
            }),
        }
    }

    /// A fresh context for an inbound call.
    pub fn context(&self, metadata: &MetadataMap) -> CallContext {
        CallContext::from_metadata(metadata, self.calls.child_token())
    }

    /// Executes one payload of `method` on the pool.
    ///
    /// Returns as soon as the pool answers, the deadline elapses, or the
    /// context is cancelled. In the latter two cases the pool's execution is
    /// abandoned. The service state is not checked here; callers admit the
    /// call once before its first payload.
    pub async fn execute(
        &self,
        method: &str,
        payload: Bytes,
        context: &CallContext,
    ) -> Result<Bytes, Error> {
        self.kind(method)?;
        if context.is_expired() {
            return Err(Error::DeadlineExceeded);
        }

        let envelope = CallEnvelope::new(self.service.as_str(), method, payload, context.clone());

        tokio::select! {
            biased;
            err = context.done() => Err(err),
            result = self.pool.execute(envelope) => result.map_err(Error::from),
        }
    }

    pub async fn unary(&self, method: &str, request: Request<Bytes>) -> Result<Response<Bytes>, Status> {
        let metrics = CallMetrics::start(&self.service, method);
        if let Err(err) = self.admit(method) {
            return metrics.finish(Err(err.into()));
        }
        let context = self.context(request.metadata());
        let _guard = context.cancellation.clone().drop_guard();

        let result = self.execute(method, request.into_inner(), &context).await;
        metrics.finish(result.map(Response::new).map_err(Status::from))
    }

    /// The single request is executed once; its result is the only message
    /// of the response stream.
    pub async fn server_streaming(
        &self,
        method: &str,
        request: Request<Bytes>,
    ) -> Result<Response<ResponseStream>, Status> {
        let metrics = CallMetrics::start(&self.service, method);
        if let Err(err) = self.admit(method) {
            return metrics.finish(Err(err.into()));
        }
        let context = self.context(request.metadata());
        let _guard = context.cancellation.clone().drop_guard();

        let result = self.execute(method, request.into_inner(), &context).await;
        metrics.finish(
            result
                .map(|payload| {
                    let stream: ResponseStream =
                        Box::pin(futures::stream::once(async move { Ok(payload) }));
                    Response::new(stream)
                })
                .map_err(Status::from),
        )
    }

    /// Every inbound message is executed in order; the response is the result
    /// of the last execution. An empty stream executes one empty payload.
    pub async fn client_streaming<S>(
        &self,
        method: &str,
        request: Request<S>,
    ) -> Result<Response<Bytes>, Status>
    where
        S: Stream<Item = Result<Bytes, Status>> + Send + 'static,
    {
        let metrics = CallMetrics::start(&self.service, method);
        if let Err(err) = self.admit(method) {
            return metrics.finish(Err(err.into()));
        }
        let context = self.context(request.metadata());
        let _guard = context.cancellation.clone().drop_guard();
        let mut inbound = Box::pin(request.into_inner());

        let forward = async {
            let mut last = None;
            while let Some(message) = inbound.next().await {
                let payload = self.execute(method, message?, &context).await?;
                last = Some(payload);
            }
            match last {
                Some(payload) => Ok::<_, Status>(payload),
                None => Ok(self.execute(method, Bytes::new(), &context).await?),
            }
        };

        let result = tokio::select! {
            biased;
            err = context.done() => Err(Status::from(err)),
            result = forward => result,
        };
        metrics.finish(result.map(Response::new))
    }

    /// Every inbound message is executed in order and each result is sent as
    /// soon as it is available. The first failure ends the stream.
    pub async fn streaming<S>(
        self: &Arc<Self>,
        method: &str,
        request: Request<S>,
    ) -> Result<Response<ResponseStream>, Status>
    where
        S: Stream<Item = Result<Bytes, Status>> + Send + 'static,
    {
        let metrics = CallMetrics::start(&self.service, method);
        if let Err(err) = self.admit(method) {
            return metrics.finish(Err(err.into()));
        }

        let context = self.context(request.metadata());
        let guard = context.cancellation.clone().drop_guard();
        let (resp_tx, resp_rx) = mpsc::channel(self.stream_buffer_size);

        let proxy = Arc::clone(self);
        let method = method.to_owned();
        let inbound = request.into_inner();
        let fut = async move {
            if let Err(err) = forward_stream(proxy, method, context, inbound, resp_tx).await {
                metrics.fail(&Status::from(err));
            }
        };
        tokio::spawn(fut.in_current_span());

        let stream: ResponseStream = Box::pin(CallStream::new(resp_rx, guard));
        Ok(Response::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use gantry_core::pool::{PoolError, PoolEvent, WorkerEnv, WorkerError, WorkerResult};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;
    use tokio_stream::wrappers::ReceiverStream;
    use tonic::Code;

    /// Echoes payloads. `hang` never answers, `fail` is an application
    /// error, and the first `unavailable` calls report no capacity.
    #[derive(Default)]
    struct FakePool {
        unavailable: AtomicUsize,
        seen: Mutex<Vec<CallEnvelope>>,
    }

    #[tonic::async_trait]
    impl WorkerPool for FakePool {
        async fn start(&self, _env: WorkerEnv) -> Result<(), PoolError> {
            Ok(())
        }

        async fn execute(&self, envelope: CallEnvelope) -> WorkerResult {
            self.seen.lock().push(envelope.clone());
            if self
                .unavailable
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(WorkerError::unavailable("no free workers"));
            }
            match envelope.payload.as_ref() {
                b"hang" => futures::future::pending().await,
                b"fail" => Err(WorkerError::application("boom")),
                _ => Ok(envelope.payload),
            }
        }

        fn events(&self) -> broadcast::Receiver<PoolEvent> {
            broadcast::channel(1).1
        }

        async fn stop(&self) {}
    }

    fn descriptor() -> ServiceDescriptor {
        gantry_core::idl::parse_str(
            "package pkg;
             service Echo {
               rpc Say (M) returns (M);
               rpc Upload (stream M) returns (M);
               rpc Watch (M) returns (stream M);
               rpc Chat (stream M) returns (stream M);
             }",
            "echo.proto",
        )
        .unwrap()
        .remove(0)
    }

    fn proxy_with(pool: Arc<FakePool>, state: ServiceState) -> (Arc<CallProxy>, watch::Sender<ServiceState>) {
        let (state_tx, state_rx) = watch::channel(state);
        let proxy = CallProxy::new(descriptor(), pool, state_rx, CancellationToken::new());
        (Arc::new(proxy), state_tx)
    }

    fn messages(items: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, Status>> + Send + 'static {
        let items: Vec<_> = items.iter().map(|&item| Ok(Bytes::from_static(item))).collect();
        futures::stream::iter(items)
    }

    #[tokio::test]
    async fn unary_call_is_forwarded_verbatim() {
        let pool = Arc::new(FakePool::default());
        let (proxy, _state) = proxy_with(Arc::clone(&pool), ServiceState::Active);

        let mut request = Request::new(Bytes::from_static(b"hi"));
        request
            .metadata_mut()
            .insert("x-user", "42".parse().unwrap());

        let response = proxy.unary("Say", request).await.unwrap();
        assert_eq!(response.into_inner(), Bytes::from_static(b"hi"));

        let seen = pool.seen.lock();
        let envelope = &seen[0];
        assert_eq!(envelope.service, "pkg.Echo");
        assert_eq!(envelope.method, "Say");
        assert_eq!(envelope.payload, Bytes::from_static(b"hi"));
        assert_eq!(envelope.context.metadata.get("x-user").map(String::as_str), Some("42"));
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let (proxy, _state) = proxy_with(Arc::default(), ServiceState::Active);
        let status = proxy
            .unary("Missing", Request::new(Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn calls_are_rejected_until_active() {
        let (proxy, state) = proxy_with(Arc::default(), ServiceState::Registered);
        let status = proxy
            .unary("Say", Request::new(Bytes::from_static(b"hi")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);

        state.send_replace(ServiceState::Active);
        assert!(proxy.unary("Say", Request::new(Bytes::new())).await.is_ok());

        state.send_replace(ServiceState::Draining);
        let status = proxy.unary("Say", Request::new(Bytes::new())).await.unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn unavailable_worker_then_success() {
        let pool = Arc::new(FakePool::default());
        pool.unavailable.store(1, Ordering::SeqCst);
        let (proxy, _state) = proxy_with(pool, ServiceState::Active);

        let status = proxy
            .unary("Say", Request::new(Bytes::from_static(b"hi")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);

        let response = proxy
            .unary("Say", Request::new(Bytes::from_static(b"hi")))
            .await
            .unwrap();
        assert_eq!(response.into_inner(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn application_errors_are_internal() {
        let (proxy, _state) = proxy_with(Arc::default(), ServiceState::Active);
        let status = proxy
            .unary("Say", Request::new(Bytes::from_static(b"fail")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "boom");
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_hung_worker() {
        let (proxy, _state) = proxy_with(Arc::default(), ServiceState::Active);
        let context = proxy.context(&MetadataMap::new());

        let token = context.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            proxy.execute("Say", Bytes::from_static(b"hang"), &context),
        )
        .await
        .expect("cancellation must be observed promptly");
        assert_eq!(result, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn cancelling_the_call_root_aborts_calls() {
        let (state_tx, state_rx) = watch::channel(ServiceState::Active);
        let calls = CancellationToken::new();
        let proxy = CallProxy::new(descriptor(), Arc::new(FakePool::default()), state_rx, calls.clone());
        let context = proxy.context(&MetadataMap::new());
        calls.cancel();

        let result = proxy.execute("Say", Bytes::from_static(b"hang"), &context).await;
        assert_eq!(result, Err(Error::Cancelled));
        drop(state_tx);
    }

    #[tokio::test]
    async fn deadline_is_taken_from_grpc_timeout() {
        let (proxy, _state) = proxy_with(Arc::default(), ServiceState::Active);
        let mut request = Request::new(Bytes::from_static(b"hang"));
        request
            .metadata_mut()
            .insert("grpc-timeout", "20m".parse().unwrap());

        let status = tokio::time::timeout(Duration::from_secs(1), proxy.unary("Say", request))
            .await
            .expect("deadline must be observed promptly")
            .unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn server_streaming_yields_one_message() {
        let (proxy, _state) = proxy_with(Arc::default(), ServiceState::Active);
        let response = proxy
            .server_streaming("Watch", Request::new(Bytes::from_static(b"tick")))
            .await
            .unwrap();
        let items: Vec<_> = response.into_inner().collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"tick"));
    }

    #[tokio::test]
    async fn client_streaming_returns_last_result() {
        let pool = Arc::new(FakePool::default());
        let (proxy, _state) = proxy_with(Arc::clone(&pool), ServiceState::Active);

        let response = proxy
            .client_streaming("Upload", Request::new(messages(&[b"a", b"b", b"c"])))
            .await
            .unwrap();
        assert_eq!(response.into_inner(), Bytes::from_static(b"c"));

        let order: Vec<_> = pool.seen.lock().iter().map(|e| e.payload.clone()).collect();
        assert_eq!(order, [&b"a"[..], &b"b"[..], &b"c"[..]]);
    }

    #[tokio::test]
    async fn empty_client_stream_executes_once() {
        let pool = Arc::new(FakePool::default());
        let (proxy, _state) = proxy_with(Arc::clone(&pool), ServiceState::Active);

        let response = proxy
            .client_streaming("Upload", Request::new(messages(&[])))
            .await
            .unwrap();
        assert!(response.into_inner().is_empty());
        assert_eq!(pool.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn bidi_preserves_order_and_stops_at_first_failure() {
        let (proxy, _state) = proxy_with(Arc::default(), ServiceState::Active);

        let response = proxy
            .streaming("Chat", Request::new(messages(&[b"1", b"2", b"fail", b"3"])))
            .await
            .unwrap();
        let items: Vec<_> = response.into_inner().collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"1"));
        assert_eq!(items[1].as_ref().unwrap(), &Bytes::from_static(b"2"));
        assert_eq!(items[2].as_ref().unwrap_err().code(), Code::Internal);
    }

    async fn wait_for_seen(pool: &FakePool, count: usize) {
        for _ in 0..200 {
            if pool.seen.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool saw fewer than {count} envelopes");
    }

    #[tokio::test]
    async fn draining_lets_an_accepted_bidi_stream_finish() {
        let (proxy, state) = proxy_with(Arc::default(), ServiceState::Active);
        let (tx, rx) = mpsc::channel(4);

        let response = proxy
            .streaming("Chat", Request::new(ReceiverStream::new(rx)))
            .await
            .unwrap();
        let mut outbound = response.into_inner();

        tx.send(Ok(Bytes::from_static(b"1"))).await.unwrap();
        assert_eq!(outbound.next().await.unwrap().unwrap(), Bytes::from_static(b"1"));

        state.send_replace(ServiceState::Draining);
        tx.send(Ok(Bytes::from_static(b"2"))).await.unwrap();
        assert_eq!(outbound.next().await.unwrap().unwrap(), Bytes::from_static(b"2"));

        drop(tx);
        assert!(outbound.next().await.is_none());

        // New calls are still refused.
        let status = proxy
            .streaming("Chat", Request::new(messages(&[b"3"])))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn draining_lets_an_accepted_client_stream_finish() {
        let pool = Arc::new(FakePool::default());
        let (proxy, state) = proxy_with(Arc::clone(&pool), ServiceState::Active);
        let (tx, rx) = mpsc::channel(4);

        let call = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                proxy
                    .client_streaming("Upload", Request::new(ReceiverStream::new(rx)))
                    .await
            })
        };

        tx.send(Ok(Bytes::from_static(b"a"))).await.unwrap();
        wait_for_seen(&pool, 1).await;

        state.send_replace(ServiceState::Draining);
        tx.send(Ok(Bytes::from_static(b"b"))).await.unwrap();
        drop(tx);

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.into_inner(), Bytes::from_static(b"b"));
        assert_eq!(pool.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn dropping_a_bidi_response_cancels_the_call() {
        let pool = Arc::new(FakePool::default());
        let (proxy, _state) = proxy_with(Arc::clone(&pool), ServiceState::Active);

        let response = proxy
            .streaming("Chat", Request::new(messages(&[b"hang"])))
            .await
            .unwrap();

        // Wait until the hung message reached the pool.
        for _ in 0..100 {
            if !pool.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let context = pool.seen.lock()[0].context.clone();
        assert!(!context.cancellation.is_cancelled());

        drop(response);
        tokio::time::timeout(Duration::from_secs(1), context.cancellation.cancelled())
            .await
            .expect("dropping the response must cancel the call");
    }
}
