//! Reference worker for the gantry relay protocol.
//!
//! Answers every request with its own payload. Request metadata changes the
//! behavior, which the integration tests rely on:
//!
//! - `x-echo-delay-ms: N` sleeps `N` milliseconds before answering.
//! - `x-echo-fail: KIND` fails with the given failure kind.
//! - `x-echo-env: NAME` answers with the value of environment variable `NAME`.
//! - `x-echo-exit` exits without answering.
//!
//! Logs go to stderr; stdout belongs to the relay.

use bytes::Bytes;
use core::time::Duration;
use gantry_core::{
    pool::{FailureKind, WorkerError},
    relay::{DEFAULT_MAX_FRAME_LENGTH, Relay, RequestHeader},
};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_env("GANTRY_ECHO_LOG"))
        .init();

    let mut relay = Relay::new(tokio::io::stdin(), tokio::io::stdout(), DEFAULT_MAX_FRAME_LENGTH);
    tracing::debug!(pid = std::process::id(), "Echo worker ready");

    while let Some((header, payload)) = relay.next_request().await? {
        if header.metadata.contains_key("x-echo-exit") {
            tracing::debug!(request = header.id, "Exiting on request");
            std::process::exit(3);
        }

        let result = handle(&header, payload).await;
        relay.respond(header.id, &result).await?;
    }

    tracing::debug!("Relay closed, exiting");
    Ok(())
}

async fn handle(header: &RequestHeader, payload: Bytes) -> Result<Bytes, WorkerError> {
    let delay = header
        .metadata
        .get("x-echo-delay-ms")
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis);
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    if let Some(kind) = header.metadata.get("x-echo-fail") {
        return Err(WorkerError::new(
            FailureKind::from(kind.as_str()),
            format!("{}/{} failed on request", header.service, header.method),
        ));
    }

    if let Some(name) = header.metadata.get("x-echo-env") {
        return Ok(std::env::var(name).map(Bytes::from).unwrap_or_default());
    }

    Ok(payload)
}
