use bytes::Bytes;
use core::{fmt, hint::black_box, time::Duration};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::{StreamExt, stream::FuturesUnordered};
use gantry_core::{
    codec::PassThroughCodec,
    envelope::CallEnvelope,
    idl,
    pool::{PoolError, PoolEvent, WorkerEnv, WorkerPool, WorkerResult},
};
use gantry_server::{
    Gateway, ListenAddr, PoolConfig, ProcessPool, ServerConfig, ServiceState,
    server::service::handler::CallProxy,
};
use std::{sync::Arc, time::Instant};
use tokio::{
    runtime::{Builder, Runtime},
    sync::{broadcast, watch},
};
use tokio_util::sync::CancellationToken;
use tonic::{
    Request,
    client::Grpc,
    codec::CompressionEncoding,
    codegen::http::uri::PathAndQuery,
    transport::Channel,
};

const WORKER: &str = env!("CARGO_BIN_EXE_gantry-echo-worker");
const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");
const PROTO: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/echo.proto");

#[derive(Clone, Copy, Debug)]
enum Compression {
    None,
    Deflate,
    Gzip,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Deflate => write!(f, "deflate"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl From<Compression> for Option<CompressionEncoding> {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => None,
            Compression::Deflate => Some(CompressionEncoding::Deflate),
            Compression::Gzip => Some(CompressionEncoding::Gzip),
            Compression::Zstd => Some(CompressionEncoding::Zstd),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct GrpcBenchParams {
    payload_size: usize,
    concurrency: usize,
    compression: Compression,
}

/// Answers in-process, so only the proxy itself is measured.
struct InlinePool;

#[tonic::async_trait]
impl WorkerPool for InlinePool {
    async fn start(&self, _env: WorkerEnv) -> Result<(), PoolError> {
        Ok(())
    }

    async fn execute(&self, envelope: CallEnvelope) -> WorkerResult {
        Ok(envelope.payload)
    }

    fn events(&self) -> broadcast::Receiver<PoolEvent> {
        broadcast::channel(1).1
    }

    async fn stop(&self) {}
}

fn proxy_bench(c: &mut Criterion) {
    let rt = runtime();
    let descriptor = idl::parse_file(PROTO, FIXTURES)
        .expect("fixture IDL")
        .remove(0);
    let (_state, state_rx) = watch::channel(ServiceState::Active);
    let proxy = Arc::new(CallProxy::new(
        descriptor,
        Arc::new(InlinePool),
        state_rx,
        CancellationToken::new(),
    ));

    let mut group = c.benchmark_group("proxy/unary");
    for concurrency in [1, 8, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_function(format!("conc/{concurrency}"), |b| {
            b.to_async(&rt).iter(|| {
                let proxy = Arc::clone(&proxy);
                async move {
                    let mut tasks = FuturesUnordered::new();
                    for _ in 0..concurrency {
                        let proxy = Arc::clone(&proxy);
                        tasks.push(async move {
                            proxy
                                .unary("Say", Request::new(Bytes::from_static(b"bench")))
                                .await
                        });
                    }
                    while let Some(res) = tasks.next().await {
                        black_box(res.expect("proxied call"));
                    }
                }
            });
        });
    }
    group.finish();
}

fn grpc_bench(c: &mut Criterion) {
    let rt = runtime();

    let mut config = ServerConfig::new(
        PROTO,
        PoolConfig {
            num_workers: num_cpus::get(),
            ..PoolConfig::new([WORKER])
        },
    );
    config.listen = ListenAddr::Tcp("127.0.0.1:0".to_string());
    let pool: Arc<dyn WorkerPool> = Arc::new(ProcessPool::new(config.pool.clone()));
    let gateway = Gateway::new(config, pool);

    let server = {
        let gateway = gateway.clone();
        rt.spawn(async move { gateway.serve().await })
    };
    let addr = rt.block_on(async {
        let mut state = gateway.subscribe_state();
        state
            .wait_for(|state| *state == ServiceState::Active)
            .await
            .expect("gateway did not start");
        gateway.local_addr().expect("bound address")
    });

    let payload_size_cases = [64, 4 * 1024, 64 * 1024];
    let concurrency_cases = [1, 8, 32];
    let compression_cases = [
        Compression::None,
        Compression::Zstd,
        Compression::Gzip,
        Compression::Deflate,
    ];

    // Generate cartesian product of all param combinations
    let mut cases = Vec::new();
    for &payload_size in &payload_size_cases {
        for &concurrency in &concurrency_cases {
            for &compression in &compression_cases {
                cases.push(GrpcBenchParams {
                    payload_size,
                    concurrency,
                    compression,
                });
            }
        }
    }

    for params in &cases {
        let mut group = c.benchmark_group("grpc/unary");
        group.throughput(Throughput::Bytes(
            (params.payload_size * params.concurrency) as u64,
        ));

        group.bench_function(
            format!(
                "bytes/{}/conc/{}/comp/{}",
                params.payload_size, params.concurrency, params.compression,
            ),
            |b| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let channel = Channel::from_shared(format!("http://{addr}"))
                        .expect("valid uri")
                        .connect()
                        .await
                        .expect("Failed to connect to gateway");

                    let start = Instant::now();

                    for _ in 0..iters {
                        run_grpc_unary_bench(&channel, params).await;
                    }

                    start.elapsed()
                });
            },
        );

        group.finish();
    }

    rt.block_on(async {
        gateway.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(30), server).await;
    });
}

async fn run_grpc_unary_bench(channel: &Channel, params: &GrpcBenchParams) {
    let payload = Bytes::from(vec![0x5a; params.payload_size]);
    let mut tasks = FuturesUnordered::new();

    for _ in 0..params.concurrency {
        let channel = channel.clone();
        let compression = params.compression;
        let payload = payload.clone();

        tasks.push(tokio::spawn(async move {
            let mut client = Grpc::new(channel);
            if let Some(encoding) = compression.into() {
                client = client.accept_compressed(encoding).send_compressed(encoding);
            }

            client.ready().await.expect("channel ready");
            let response = client
                .unary(
                    Request::new(payload),
                    PathAndQuery::from_static("/pkg.Echo/Say"),
                    PassThroughCodec,
                )
                .await
                .expect("unary call failed")
                .into_inner();
            black_box(response);
        }));
    }

    // Wait for all tasks to complete
    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

fn runtime() -> Runtime {
    Builder::new_multi_thread().enable_all().build().unwrap()
}

criterion_group!(grpc_benches, proxy_bench, grpc_bench);
criterion_main!(grpc_benches);
