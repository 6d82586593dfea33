use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use gantry_core::{pool::WorkerEnv, relay::DEFAULT_MAX_FRAME_LENGTH};
use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
};

/// Runtime configuration for the `gantry-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first), with defaults suitable for a single host.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gantry-server",
    version,
    about = "A dynamic gRPC gateway backed by a pool of worker processes"
)]
pub struct CliArgs {
    /// Root IDL file declaring the services to proxy.
    ///
    /// Imports are resolved relative to the directory containing this file.
    ///
    /// Environment variable: `GANTRY_PROTO_PATH`
    #[arg(long, env = "GANTRY_PROTO_PATH")]
    pub proto: PathBuf,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix
    /// socket).
    ///
    /// Example: "0.0.0.0:9001" or "/tmp/gantry.sock"
    ///
    /// Environment variable: `GANTRY_LISTEN`
    #[arg(long, env = "GANTRY_LISTEN", default_value_t = String::from("0.0.0.0:9001"))]
    pub listen: String,

    /// Listen on a Unix socket instead of TCP. If set, `GANTRY_LISTEN` must be
    /// a file path.
    #[arg(short, long, env = "GANTRY_UDS", default_value_t = false)]
    pub uds: bool,

    /// PEM certificate chain. Enables TLS together with `--tls-key`.
    ///
    /// Environment variable: `GANTRY_TLS_CERT`
    #[arg(long, env = "GANTRY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`.
    ///
    /// Environment variable: `GANTRY_TLS_KEY`
    #[arg(long, env = "GANTRY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Address of the control listener (`gantry.Control`, health and
    /// reflection). Disabled when unset.
    ///
    /// Environment variable: `GANTRY_CONTROL_ADDR`
    #[arg(long, env = "GANTRY_CONTROL_ADDR")]
    pub control_addr: Option<SocketAddr>,

    /// Command line of a worker process, split on whitespace. Quoting is
    /// not interpreted; pass arguments containing spaces with `--worker-arg`.
    ///
    /// Example: "php worker.php" or "python -m app.worker"
    ///
    /// Environment variable: `GANTRY_WORKER_COMMAND`
    #[arg(long, env = "GANTRY_WORKER_COMMAND")]
    pub worker_command: String,

    /// Extra worker argument, appended verbatim after `--worker-command`.
    /// Repeat the flag for several arguments.
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Number of worker processes. Defaults to the number of CPUs.
    ///
    /// Environment variable: `GANTRY_NUM_WORKERS`
    #[arg(long, env = "GANTRY_NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Restart a worker after this many calls. Zero disables recycling.
    ///
    /// Environment variable: `GANTRY_MAX_JOBS`
    #[arg(long, env = "GANTRY_MAX_JOBS", default_value_t = 0)]
    pub max_jobs: u64,

    /// How long a call may wait for a free worker, in milliseconds.
    ///
    /// Environment variable: `GANTRY_ALLOCATE_TIMEOUT_MS`
    #[arg(long, env = "GANTRY_ALLOCATE_TIMEOUT_MS", default_value_t = 60_000)]
    pub allocate_timeout_ms: u64,

    /// How long a worker may take to exit after its stdin closes, in
    /// milliseconds, before it is killed.
    ///
    /// Environment variable: `GANTRY_DESTROY_TIMEOUT_MS`
    #[arg(long, env = "GANTRY_DESTROY_TIMEOUT_MS", default_value_t = 60_000)]
    pub destroy_timeout_ms: u64,

    /// Grace period for in-flight calls after a stop, in seconds. Calls still
    /// running afterwards are cancelled.
    ///
    /// Environment variable: `GANTRY_SHUTDOWN_TIMEOUT`
    #[arg(long, env = "GANTRY_SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Extra `KEY=VALUE` environment entries for worker processes.
    ///
    /// Environment variable: `GANTRY_WORKER_ENV` (comma separated)
    #[arg(long = "worker-env", env = "GANTRY_WORKER_ENV", value_delimiter = ',')]
    pub worker_env: Vec<String>,

    /// Largest relay frame exchanged with a worker, in bytes.
    ///
    /// Environment variable: `GANTRY_MAX_FRAME_LENGTH`
    #[arg(long, env = "GANTRY_MAX_FRAME_LENGTH", default_value_t = DEFAULT_MAX_FRAME_LENGTH)]
    pub max_frame_length: usize,

    /// Largest inbound gRPC message, in bytes. `tonic` defaults to 4 MiB.
    ///
    /// Environment variable: `GANTRY_MAX_DECODING_MESSAGE_SIZE`
    #[arg(long, env = "GANTRY_MAX_DECODING_MESSAGE_SIZE")]
    pub max_decoding_message_size: Option<usize>,

    /// Largest outbound gRPC message, in bytes. Unlimited by default.
    ///
    /// Environment variable: `GANTRY_MAX_ENCODING_MESSAGE_SIZE`
    #[arg(long, env = "GANTRY_MAX_ENCODING_MESSAGE_SIZE")]
    pub max_encoding_message_size: Option<usize>,

    /// Capacity of the response buffer of a bidirectional stream.
    ///
    /// Environment variable: `GANTRY_STREAM_BUFFER_SIZE`
    #[arg(long, env = "GANTRY_STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,
}

/// Where the data plane listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `host:port`; port `0` picks a free port.
    Tcp(String),
    Unix(PathBuf),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => f.write_str(addr),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// PEM files for the data-plane listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Settings of the process-backed worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub num_workers: usize,
    /// Zero disables recycling.
    pub max_jobs: u64,
    pub allocate_timeout: Duration,
    pub destroy_timeout: Duration,
    pub env: WorkerEnv,
    pub max_frame_length: usize,
}

impl PoolConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            num_workers: num_cpus::get(),
            max_jobs: 0,
            allocate_timeout: Duration::from_secs(60),
            destroy_timeout: Duration::from_secs(60),
            env: WorkerEnv::new(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root IDL file.
    pub proto: PathBuf,
    /// Base directory for IDL imports.
    pub proto_dir: PathBuf,
    pub listen: ListenAddr,
    pub tls: Option<TlsConfig>,
    pub control_addr: Option<SocketAddr>,
    pub pool: PoolConfig,
    pub shutdown_timeout: Duration,
    pub max_decoding_message_size: Option<usize>,
    pub max_encoding_message_size: Option<usize>,
    pub stream_buffer_size: usize,
}

impl ServerConfig {
    /// Plaintext TCP on `0.0.0.0:9001`, no control listener.
    pub fn new(proto: impl Into<PathBuf>, pool: PoolConfig) -> Self {
        let proto = proto.into();
        let proto_dir = proto_dir(&proto);
        Self {
            proto,
            proto_dir,
            listen: ListenAddr::Tcp("0.0.0.0:9001".to_string()),
            tls: None,
            control_addr: None,
            pool,
            shutdown_timeout: Duration::from_secs(5),
            max_decoding_message_size: None,
            max_encoding_message_size: None,
            stream_buffer_size: 8,
        }
    }
}

fn proto_dir(proto: &Path) -> PathBuf {
    match proto.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn parse_env_entry(entry: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = entry
        .split_once('=')
        .with_context(|| format!("worker env entry {entry:?} is not KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("worker env entry {entry:?} has an empty key");
    }
    Ok((key.to_string(), value.to_string()))
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let command: Vec<String> = args
            .worker_command
            .split_whitespace()
            .map(str::to_string)
            .chain(args.worker_args)
            .collect();
        if command.is_empty() {
            bail!("GANTRY_WORKER_COMMAND must not be empty");
        }

        let num_workers = args.num_workers.unwrap_or_else(num_cpus::get);
        if num_workers == 0 {
            bail!("GANTRY_NUM_WORKERS must be greater than 0");
        }

        if args.max_frame_length == 0 {
            bail!("GANTRY_MAX_FRAME_LENGTH must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("GANTRY_STREAM_BUFFER_SIZE must be greater than 0");
        }

        let tls = match (args.tls_cert, args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
            (None, None) => None,
            _ => bail!("GANTRY_TLS_CERT and GANTRY_TLS_KEY must be set together"),
        };

        let listen = if args.uds {
            if !cfg!(unix) {
                bail!("Unix domain sockets are not supported on this platform");
            }
            ListenAddr::Unix(PathBuf::from(args.listen))
        } else {
            ListenAddr::Tcp(args.listen)
        };

        let env = args
            .worker_env
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| parse_env_entry(entry))
            .collect::<anyhow::Result<WorkerEnv>>()?;

        let pool = PoolConfig {
            command,
            num_workers,
            max_jobs: args.max_jobs,
            allocate_timeout: Duration::from_millis(args.allocate_timeout_ms),
            destroy_timeout: Duration::from_millis(args.destroy_timeout_ms),
            env,
            max_frame_length: args.max_frame_length,
        };

        Ok(Self {
            proto_dir: proto_dir(&args.proto),
            proto: args.proto,
            listen,
            tls,
            control_addr: args.control_addr,
            pool,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            max_decoding_message_size: args.max_decoding_message_size,
            max_encoding_message_size: args.max_encoding_message_size,
            stream_buffer_size: args.stream_buffer_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec![
            "gantry-server",
            "--proto",
            "protos/api.proto",
            "--worker-command",
            "php  worker.php",
        ];
        argv.extend_from_slice(extra);
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_plaintext_tcp() {
        let config = parse(&["--num-workers", "3"]).unwrap();
        assert_eq!(config.listen, ListenAddr::Tcp("0.0.0.0:9001".to_string()));
        assert_eq!(config.proto_dir, PathBuf::from("protos"));
        assert_eq!(config.pool.command, ["php", "worker.php"]);
        assert_eq!(config.pool.num_workers, 3);
        assert!(config.tls.is_none());
        assert!(config.control_addr.is_none());
    }

    #[test]
    fn worker_args_are_kept_verbatim() {
        let config = parse(&[
            "--worker-arg",
            "--config=/srv/my app/worker.ini",
            "--worker-arg",
            "two words",
        ])
        .unwrap();
        assert_eq!(
            config.pool.command,
            ["php", "worker.php", "--config=/srv/my app/worker.ini", "two words"]
        );
    }

    #[test]
    fn worker_env_entries_are_parsed() {
        let config = parse(&["--worker-env", "APP_ENV=prod,EMPTY="]).unwrap();
        assert_eq!(config.pool.env.get("APP_ENV").map(String::as_str), Some("prod"));
        assert_eq!(config.pool.env.get("EMPTY").map(String::as_str), Some(""));

        assert!(parse(&["--worker-env", "NOVALUE"]).is_err());
        assert!(parse(&["--worker-env", "=x"]).is_err());
    }

    #[test]
    fn tls_requires_both_files() {
        assert!(parse(&["--tls-cert", "cert.pem"]).is_err());
        let config = parse(&["--tls-cert", "cert.pem", "--tls-key", "key.pem"]).unwrap();
        assert_eq!(
            config.tls,
            Some(TlsConfig {
                cert: PathBuf::from("cert.pem"),
                key: PathBuf::from("key.pem"),
            })
        );
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(parse(&["--num-workers", "0"]).is_err());
    }

    #[test]
    fn bare_file_name_resolves_imports_from_cwd() {
        let config = ServerConfig::new("api.proto", PoolConfig::new(["worker"]));
        assert_eq!(config.proto_dir, PathBuf::from("."));
    }
}
