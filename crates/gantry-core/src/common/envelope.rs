//! # Call envelopes
//!
//! A [`CallEnvelope`] is the unit of work handed to a worker pool: the
//! service and method identity, the raw request payload exactly as it arrived
//! on the wire, and the [`CallContext`] (deadline, cancellation and request
//! metadata) the pool must honor while executing it.
//!
//! Envelopes are built per inbound call, or per inbound message for streaming
//! calls, and are never shared between calls.

use crate::Error;
use bytes::Bytes;
use core::time::Duration;
use std::collections::BTreeMap;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tonic::metadata::{KeyAndValueRef, MetadataMap};

/// Request header carrying the client's deadline.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Transport headers that never reach workers, next to every `grpc-` header.
const TRANSPORT_HEADERS: [&str; 9] = [
    "te",
    "content-type",
    "user-agent",
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// ASCII request metadata forwarded to workers.
pub type Metadata = BTreeMap<String, String>;

/// Deadline, cancellation and metadata for one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
    pub metadata: Metadata,
}

impl CallContext {
    /// A context with no deadline and no metadata.
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancellation,
            metadata: Metadata::new(),
        }
    }

    /// Builds a context from inbound gRPC metadata.
    ///
    /// The deadline is taken from `grpc-timeout`; every ASCII application
    /// entry is copied into the metadata mapping. Binary (`-bin`) entries,
    /// reserved `grpc-` headers and HTTP transport headers are dropped.
    pub fn from_metadata(metadata: &MetadataMap, cancellation: CancellationToken) -> Self {
        let deadline = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|timeout| Instant::now() + timeout);

        let metadata = metadata
            .iter()
            .filter_map(|entry| match entry {
                KeyAndValueRef::Ascii(key, _) if is_transport_header(key.as_str()) => None,
                KeyAndValueRef::Ascii(key, value) => value
                    .to_str()
                    .ok()
                    .map(|value| (key.as_str().to_owned(), value.to_owned())),
                KeyAndValueRef::Binary(..) => None,
            })
            .collect();

        Self {
            deadline,
            cancellation,
            metadata,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Same deadline and metadata, with a child cancellation token.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves
    /// the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancellation: self.cancellation.child_token(),
            metadata: self.metadata.clone(),
        }
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| deadline <= Instant::now())
    }

    /// Resolves once the call is cancelled or its deadline elapses, returning
    /// the matching error.
    ///
    /// Cancellation wins when both have happened.
    pub async fn done(&self) -> Error {
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => core::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Error::Cancelled,
            () = deadline => Error::DeadlineExceeded,
        }
    }
}

/// One unit of work for the worker pool.
#[derive(Debug, Clone)]
pub struct CallEnvelope {
    pub service: String,
    pub method: String,
    pub payload: Bytes,
    pub context: CallContext,
}

impl CallEnvelope {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        payload: Bytes,
        context: CallContext,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            payload,
            context,
        }
    }
}

fn is_transport_header(key: &str) -> bool {
    key.starts_with("grpc-") || TRANSPORT_HEADERS.contains(&key)
}

/// Parses a `grpc-timeout` header value (`1-8 digits` followed by one of
/// `H`, `M`, `S`, `m`, `u`, `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
        return None;
    }

    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let timeout = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };

    Some(timeout)
}
