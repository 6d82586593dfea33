//! Lifecycle orchestration.
//!
//! A [`Gateway`] owns the worker pool, the data-plane listener and the
//! optional control listener, and keeps them consistent: the pool is started
//! before anything binds, every startup failure stops the pool again, and
//! once the accept loop ends the proxies close before the pool is torn down.
//!
//! ## Startup
//!
//! 1. Prepare the worker environment (`GANTRY_GRPC`, `GANTRY_PROTO`).
//! 2. Subscribe to pool events and start the pool.
//! 3. Build the server: TLS, registered options, grpc-web and CORS layers.
//! 4. Parse the IDL and route one [`CallProxy`] per service, next to the
//!    health service and any registered services.
//! 5. Bind the listeners.
//! 6. Go [`ServiceState::Active`] and accept connections until stopped.
//!
//! ## Shutdown
//!
//! [`Gateway::stop`] flips every proxy to draining, reports `NOT_SERVING`,
//! stops accepting connections and arms a watchdog that cancels whatever is
//! still in flight after `shutdown_timeout`. A fatal pool event triggers the
//! same path.

use crate::server::{
    config::{ListenAddr, ServerConfig},
    control::ControlService,
    error::Error,
    service::{grpc::ProxyService, handler::CallProxy},
    telemetry::increment_pool_events,
};
use axum::response::IntoResponse;
use futures::Stream;
use gantry_core::{
    idl,
    pool::{PoolEvent, WorkerEnv, WorkerPool},
    proto::{FILE_DESCRIPTOR_SET, control_server::ControlServer},
};
use std::{
    collections::HashSet,
    convert::Infallible,
    mem,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::{Mutex as AsyncMutex, broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{
    body::Body,
    codec::CompressionEncoding,
    codegen::http,
    server::NamedService,
    service::{Routes, RoutesBuilder},
    transport::{Identity, Server, ServerTlsConfig, server::Connected},
};
use tonic_health::{ServingStatus, server::HealthReporter};
use tonic_web::GrpcWebLayer;
use tower::{Service, ServiceBuilder};
use tower_http::cors::{Any, CorsLayer};

pub use crate::server::service::handler::ServiceState;

/// Environment flag telling worker processes they serve gRPC calls.
pub const GRPC_ENV: &str = "GANTRY_GRPC";

/// Environment variable carrying the root IDL file to worker processes.
pub const PROTO_ENV: &str = "GANTRY_PROTO";

/// Name of the health service served next to the proxies.
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// A service added through [`Gateway::add_service`], routed at startup.
struct ServiceRegistration {
    name: &'static str,
    register: Box<dyn FnOnce(&mut RoutesBuilder) + Send>,
}

type ServerOption = Box<dyn FnOnce(Server) -> Server + Send>;
type PoolListener = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    sealed: bool,
    services: Vec<ServiceRegistration>,
    options: Vec<ServerOption>,
    listeners: Vec<PoolListener>,
}

/// Handles of a serving gateway, guarded by the start/stop lock.
struct Running {
    shutdown: CancellationToken,
    calls: CancellationToken,
    health: HealthReporter,
    services: Vec<String>,
    stopping: bool,
}

enum Incoming {
    Tcp(TcpListenerStream),
    #[cfg(unix)]
    Unix(tokio_stream::wrappers::UnixListenerStream, PathBuf),
}

/// Everything built during startup that the accept loop needs.
struct Prepared {
    server: Server,
    routes: Routes,
    incoming: Incoming,
    control: Option<JoinHandle<()>>,
}

struct Inner {
    config: ServerConfig,
    pool: Arc<dyn WorkerPool>,
    registry: parking_lot::Mutex<Registry>,
    running: AsyncMutex<Option<Running>>,
    state: watch::Sender<ServiceState>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    control_addr: parking_lot::Mutex<Option<SocketAddr>>,
    services: parking_lot::RwLock<Vec<String>>,
    /// Set by the event task on `PoolFatal`, possibly before serving began.
    pool_failed: AtomicBool,
}

/// Serves the services declared by an IDL file through a worker pool.
///
/// Cheap to clone; every clone controls the same server.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(config: ServerConfig, pool: Arc<dyn WorkerPool>) -> Self {
        let (state, _) = watch::channel(ServiceState::Registered);
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                registry: parking_lot::Mutex::new(Registry::default()),
                running: AsyncMutex::new(None),
                state,
                local_addr: parking_lot::Mutex::new(None),
                control_addr: parking_lot::Mutex::new(None),
                services: parking_lot::RwLock::new(Vec::new()),
                pool_failed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Registers an additional tonic service next to the proxies.
    ///
    /// Its name must not clash with the health service, an IDL service or
    /// another registered service; `serve` fails with
    /// [`Error::DuplicateService`] otherwise.
    ///
    /// Returns `false`, without effect, once serving has begun.
    pub fn add_service<S>(&self, service: S) -> bool
    where
        S: Service<http::Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: IntoResponse,
        S::Future: Send + 'static,
    {
        let mut registry = self.inner.registry.lock();
        if registry.sealed {
            return false;
        }
        registry.services.push(ServiceRegistration {
            name: S::NAME,
            register: Box::new(move |routes| {
                routes.add_service(service);
            }),
        });
        true
    }

    /// Registers a transformation of the server builder, applied after TLS.
    ///
    /// Returns `false`, without effect, once serving has begun.
    pub fn add_option<F>(&self, option: F) -> bool
    where
        F: FnOnce(Server) -> Server + Send + 'static,
    {
        let mut registry = self.inner.registry.lock();
        if registry.sealed {
            return false;
        }
        registry.options.push(Box::new(option));
        true
    }

    /// Registers a pool event listener. Listeners see every event before the
    /// gateway reacts to it.
    ///
    /// Returns `false`, without effect, once serving has begun.
    pub fn add_listener<F>(&self, listener: F) -> bool
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock();
        if registry.sealed {
            return false;
        }
        registry.listeners.push(Arc::new(listener));
        true
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    /// Bound address of the TCP listener, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Bound address of the control listener, once serving.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        *self.inner.control_addr.lock()
    }

    /// Fully-qualified names of the proxied services, in discovery order.
    pub fn services(&self) -> Vec<String> {
        self.inner.services.read().clone()
    }

    /// Starts the pool, binds the listeners and serves until [`stop`] is
    /// called or the pool fails.
    ///
    /// A gateway serves at most once.
    ///
    /// [`stop`]: Gateway::stop
    pub async fn serve(&self) -> Result<(), Error> {
        let mut running = self.inner.running.lock().await;
        let registry = {
            let mut registry = self.inner.registry.lock();
            if registry.sealed || running.is_some() {
                return Err(Error::AlreadyServing);
            }
            registry.sealed = true;
            Registry {
                sealed: true,
                services: mem::take(&mut registry.services),
                options: mem::take(&mut registry.options),
                listeners: registry.listeners.clone(),
            }
        };
        let config = &self.inner.config;

        // 1. Worker environment.
        let env = WorkerEnv::from([
            (GRPC_ENV.to_string(), "true".to_string()),
            (PROTO_ENV.to_string(), config.proto.display().to_string()),
        ]);

        // 2. Pool, with the event subscription taken first so no start event
        // is missed.
        let events = self.inner.pool.events();
        self.inner.pool.start(env).await?;

        let event_stop = CancellationToken::new();
        let event_task = tokio::spawn(forward_events(
            Arc::downgrade(&self.inner),
            events,
            registry.listeners,
            event_stop.clone(),
        ));

        let shutdown = CancellationToken::new();
        let calls = CancellationToken::new();
        let (health, health_service) = tonic_health::server::health_reporter();
        health
            .set_service_status("", ServingStatus::NotServing)
            .await;
        let mut routes = RoutesBuilder::default();
        routes.add_service(health_service);

        // 3-5. Anything failing from here on stops the pool again.
        let prepared = match self
            .prepare(routes, registry.services, registry.options, &health, &calls, &shutdown)
            .await
        {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::error!("Gateway failed to start: {err}");
                drop(running);
                calls.cancel();
                shutdown.cancel();
                self.inner.pool.stop().await;
                event_stop.cancel();
                let _ = event_task.await;
                self.inner.state.send_replace(ServiceState::Closed);
                return Err(err);
            }
        };

        // 6. Active.
        let services = self.services();
        for service in &services {
            health
                .set_service_status(service, ServingStatus::Serving)
                .await;
        }
        health.set_service_status("", ServingStatus::Serving).await;
        self.inner.state.send_replace(ServiceState::Active);
        *running = Some(Running {
            shutdown: shutdown.clone(),
            calls: calls.clone(),
            health,
            services,
            stopping: false,
        });
        drop(running);
        if self.inner.pool_failed.load(Ordering::SeqCst) {
            // The pool failed while starting up; its stop found nothing to stop.
            self.stop().await;
        }

        // 7. Accept.
        let Prepared {
            server,
            routes,
            incoming,
            control,
        } = prepared;
        let result = match incoming {
            Incoming::Tcp(incoming) => accept(server, routes, incoming, shutdown.clone()).await,
            #[cfg(unix)]
            Incoming::Unix(incoming, path) => {
                let result = accept(server, routes, incoming, shutdown.clone()).await;
                // Best effort: the socket file is ours.
                if let Err(_e) = std::fs::remove_file(&path) {
                    tracing::warn!("Failed to remove {}: {_e}", path.display());
                }
                result
            }
        };

        // Clear the running handles first so a late stop is a no-op.
        self.inner.running.lock().await.take();
        self.inner.state.send_replace(ServiceState::Closed);
        calls.cancel();
        shutdown.cancel();
        if let Some(control) = control {
            let _ = control.await;
        }
        self.inner.pool.stop().await;
        event_stop.cancel();
        let _ = event_task.await;

        match &result {
            Ok(()) => tracing::info!("Gateway shut down successfully"),
            Err(_e) => tracing::error!("Gateway stopped with error: {_e}"),
        }
        result.map_err(Error::from)
    }

    /// Steps 3 to 5 of startup.
    async fn prepare(
        &self,
        mut builder: RoutesBuilder,
        registrations: Vec<ServiceRegistration>,
        options: Vec<ServerOption>,
        health: &HealthReporter,
        calls: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<Prepared, Error> {
        let config = &self.inner.config;

        // 3. Server options.
        let mut server = Server::builder();
        if let Some(tls) = &config.tls {
            let cert = read_tls(&tls.cert).await?;
            let key = read_tls(&tls.key).await?;
            server = server.tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))?;
        }
        for option in options {
            server = option(server);
        }

        // 4. Services.
        let descriptors = idl::parse_file(&config.proto, &config.proto_dir)?;
        if let Some(reserved) = descriptors
            .iter()
            .find(|descriptor| descriptor.full_name() == HEALTH_SERVICE)
        {
            return Err(Error::ReservedService {
                name: reserved.full_name(),
            });
        }

        // Routing a name twice panics, so clashes are refused up front.
        let mut taken: HashSet<String> = descriptors
            .iter()
            .map(|descriptor| descriptor.full_name())
            .collect();
        taken.insert(HEALTH_SERVICE.to_string());
        for registration in &registrations {
            if !taken.insert(registration.name.to_string()) {
                return Err(Error::DuplicateService {
                    name: registration.name.to_string(),
                });
            }
        }

        for registration in registrations {
            (registration.register)(&mut builder);
        }
        let mut router: axum::Router = builder.routes().into_axum_router();

        let mut names = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let proxy = CallProxy::new(
                descriptor,
                Arc::clone(&self.inner.pool),
                self.inner.state.subscribe(),
                calls.clone(),
            )
            .with_stream_buffer_size(config.stream_buffer_size);

            tracing::info!(
                service = proxy.service(),
                methods = proxy.methods().len(),
                "Registered service"
            );
            for method in proxy.methods() {
                tracing::debug!(
                    service = proxy.service(),
                    method = %method.name,
                    kind = ?method.kind,
                    input = %method.input_type,
                    output = %method.output_type,
                    "Registered method"
                );
            }
            names.push(proxy.service().to_owned());
            health
                .set_service_status(proxy.service(), ServingStatus::NotServing)
                .await;

            let service = build_proxy_service(Arc::new(proxy), config);
            router = router.route_service(&service.route(), service);
        }
        *self.inner.services.write() = names.clone();
        let routes = Routes::from(router);

        // 5. Listeners.
        let incoming = match &config.listen {
            ListenAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
                    addr: addr.clone(),
                    source,
                })?;
                *self.inner.local_addr.lock() = listener.local_addr().ok();
                Incoming::Tcp(TcpListenerStream::new(listener))
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                let listener =
                    tokio::net::UnixListener::bind(path).map_err(|source| Error::Bind {
                        addr: path.display().to_string(),
                        source,
                    })?;
                Incoming::Unix(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    path.clone(),
                )
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(_) => return Err(Error::UnsupportedListener),
        };

        let control = match config.control_addr {
            Some(addr) => Some(self.spawn_control(addr, names, shutdown.clone()).await?),
            None => None,
        };

        log_startup_info(config);
        Ok(Prepared {
            server,
            routes,
            incoming,
            control,
        })
    }

    /// Binds the control listener and serves `gantry.Control`, health and
    /// reflection on it until `shutdown` fires.
    async fn spawn_control(
        &self,
        addr: SocketAddr,
        services: Vec<String>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, Error> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let bound = listener.local_addr().ok();
        *self.inner.control_addr.lock() = bound;

        let control = ControlService::new(
            Arc::clone(&self.inner.pool),
            self.inner.state.subscribe(),
            services,
        );
        let (health, health_service) = tonic_health::server::health_reporter();
        health.set_serving::<ControlServer<ControlService>>().await;
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()?;

        let router = Server::builder()
            .add_service(health_service)
            .add_service(reflection)
            .add_service(ControlServer::new(control));

        tracing::info!("Control channel listening on {}", bound.unwrap_or(addr));
        Ok(tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            if let Err(_e) = router
                .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                .await
            {
                tracing::error!("Control channel failed: {_e}");
            }
        }))
    }

    /// Stops accepting calls and drains the server. Returns without waiting
    /// for the drain; [`serve`] returns once it completes.
    ///
    /// A no-op when not serving or already stopping.
    ///
    /// [`serve`]: Gateway::serve
    pub async fn stop(&self) {
        let mut running = self.inner.running.lock().await;
        let Some(running) = running.as_mut() else {
            return;
        };
        if running.stopping {
            return;
        }
        running.stopping = true;

        tracing::info!("Stopping gateway");
        self.inner.state.send_replace(ServiceState::Draining);
        running
            .health
            .set_service_status("", ServingStatus::NotServing)
            .await;
        for service in &running.services {
            running
                .health
                .set_service_status(service, ServingStatus::NotServing)
                .await;
        }
        running.shutdown.cancel();

        let calls = running.calls.clone();
        let grace = self.inner.config.shutdown_timeout;
        tokio::spawn(async move {
            tokio::select! {
                () = calls.cancelled() => {}
                () = tokio::time::sleep(grace) => {
                    tracing::warn!("Shutdown timeout elapsed; cancelling in-flight calls");
                    calls.cancel();
                }
            }
        });
    }
}

fn build_proxy_service(proxy: Arc<CallProxy>, config: &ServerConfig) -> ProxyService {
    let mut service = ProxyService::new(proxy)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate);
    if let Some(limit) = config.max_decoding_message_size {
        service = service.max_decoding_message_size(limit);
    }
    if let Some(limit) = config.max_encoding_message_size {
        service = service.max_encoding_message_size(limit);
    }
    service
}

async fn read_tls(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.map_err(|source| Error::Tls {
        path: path.to_path_buf(),
        source,
    })
}

async fn accept<I, IO, IE>(
    server: Server,
    routes: Routes,
    incoming: I,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    server
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_routes(routes)
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
        .await
}

/// Delivers pool events to listeners and stops the gateway on a fatal one.
async fn forward_events(
    gateway: Weak<Inner>,
    mut events: broadcast::Receiver<PoolEvent>,
    listeners: Vec<PoolListener>,
    stop: CancellationToken,
) {
    let deliver = |event: &PoolEvent| {
        increment_pool_events(event.kind.as_str());
        for listener in &listeners {
            listener(event);
        }
    };

    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            () = stop.cancelled() => break,
        };

        match event {
            Ok(event) => {
                deliver(&event);
                if event.is_fatal() {
                    tracing::error!("Worker pool failed, stopping gateway: {}", event.detail);
                    if let Some(inner) = gateway.upgrade() {
                        inner.pool_failed.store(true, Ordering::SeqCst);
                        Gateway { inner }.stop().await;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Dropped {skipped} pool events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }

    // Whatever the pool published while stopping.
    while let Ok(event) = events.try_recv() {
        deliver(&event);
    }
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting gateway on {} with full config: {:#?}",
            config.listen,
            config
        );
    } else {
        tracing::info!(
            "Starting gateway on {} with {} workers",
            config.listen,
            config.pool.num_workers
        );
    }
}
