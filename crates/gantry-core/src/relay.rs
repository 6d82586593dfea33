//! # Worker relay protocol
//!
//! Framed request/response protocol spoken between a process-backed pool and
//! its worker processes over the worker's stdin/stdout.
//!
//! Every frame is length-delimited (4-byte big-endian length prefix). A
//! message is always two frames:
//!
//! 1. a JSON header ([`RequestHeader`] or [`ResponseHeader`]),
//! 2. the raw payload, possibly empty.
//!
//! The payload is never inspected. Response headers echo the request `id`;
//! a mismatch means the worker is out of sync and must be restarted.
//!
//! [`Relay`] implements both sides so that worker implementations written in
//! Rust (and the tests) share one codec with the pool.

use crate::{
    envelope::{CallEnvelope, Metadata},
    pool::{FailureKind, WorkerError},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Header frame preceding every request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub id: u64,
    pub service: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    /// Milliseconds left before the caller's deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RequestHeader {
    pub fn for_envelope(id: u64, envelope: &CallEnvelope) -> Self {
        Self {
            id,
            service: envelope.service.clone(),
            method: envelope.method.clone(),
            metadata: envelope.context.metadata.clone(),
            timeout_ms: envelope
                .context
                .remaining()
                .map(|left| u64::try_from(left.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

/// Failure reported by a worker instead of a response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFault {
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl From<ResponseFault> for WorkerError {
    fn from(fault: ResponseFault) -> Self {
        WorkerError::new(FailureKind::from(fault.kind.as_str()), fault.message)
    }
}

impl From<&WorkerError> for ResponseFault {
    fn from(err: &WorkerError) -> Self {
        Self {
            kind: err.kind.as_str().to_owned(),
            message: err.message.clone(),
        }
    }
}

/// Header frame preceding every response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseFault>,
}

/// Errors on a relay pipe. Any of these leaves the pipe unusable.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed relay header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("Relay closed by peer")]
    Closed,

    #[error("Relay closed between header and payload")]
    MissingPayload,

    #[error("Response id {actual} does not match request id {expected}")]
    IdMismatch { expected: u64, actual: u64 },
}

/// A bidirectional framed pipe.
///
/// `R` is the side this end reads from and `W` the side it writes to: for the
/// pool that is the child's stdout and stdin; for a worker its own stdin and
/// stdout.
#[derive(Debug)]
pub struct Relay<R, W> {
    reader: FramedRead<R, LengthDelimitedCodec>,
    writer: FramedWrite<W, LengthDelimitedCodec>,
}

impl<R, W> Relay<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, max_frame_length: usize) -> Self {
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec()
        };

        Self {
            reader: FramedRead::new(reader, codec()),
            writer: FramedWrite::new(writer, codec()),
        }
    }

    /// Pool side: sends one request and waits for its response.
    ///
    /// The outer `Result` reports pipe failures; the inner one carries a
    /// failure reported by the worker itself.
    pub async fn call(
        &mut self,
        header: &RequestHeader,
        payload: Bytes,
    ) -> Result<Result<Bytes, WorkerError>, RelayError> {
        self.send(header, payload).await?;

        let (response, payload) = match self.recv::<ResponseHeader>().await? {
            Some(message) => message,
            None => return Err(RelayError::Closed),
        };

        if response.id != header.id {
            return Err(RelayError::IdMismatch {
                expected: header.id,
                actual: response.id,
            });
        }

        Ok(match response.error {
            Some(fault) => Err(fault.into()),
            None => Ok(payload),
        })
    }

    /// Worker side: waits for the next request. `None` means the pool closed
    /// the pipe and the worker should exit.
    pub async fn next_request(&mut self) -> Result<Option<(RequestHeader, Bytes)>, RelayError> {
        self.recv().await
    }

    /// Worker side: answers request `id`.
    pub async fn respond(&mut self, id: u64, result: &Result<Bytes, WorkerError>) -> Result<(), RelayError> {
        match result {
            Ok(payload) => {
                self.send(&ResponseHeader { id, error: None }, payload.clone())
                    .await
            }
            Err(err) => {
                let header = ResponseHeader {
                    id,
                    error: Some(err.into()),
                };
                self.send(&header, Bytes::new()).await
            }
        }
    }

    async fn send<H: Serialize>(&mut self, header: &H, payload: Bytes) -> Result<(), RelayError> {
        let header = serde_json::to_vec(header)?;
        self.writer.feed(Bytes::from(header)).await?;
        self.writer.feed(payload).await?;
        SinkExt::<Bytes>::flush(&mut self.writer).await?;
        Ok(())
    }

    async fn recv<H>(&mut self) -> Result<Option<(H, Bytes)>, RelayError>
    where
        H: for<'de> Deserialize<'de>,
    {
        let header = match self.reader.next().await {
            Some(frame) => frame?,
            None => return Ok(None),
        };
        let header = serde_json::from_slice(&header)?;

        let payload = match self.reader.next().await {
            Some(frame) => frame?.freeze(),
            None => return Err(RelayError::MissingPayload),
        };

        Ok(Some((header, payload)))
    }

    /// Splits the relay back into its reader and writer.
    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    type Pipe = Relay<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pipe() -> (Pipe, Pipe) {
        let (pool_io, worker_io) = duplex(64 * 1024);
        let (pool_read, pool_write) = split(pool_io);
        let (worker_read, worker_write) = split(worker_io);
        (
            Relay::new(pool_read, pool_write, DEFAULT_MAX_FRAME_LENGTH),
            Relay::new(worker_read, worker_write, DEFAULT_MAX_FRAME_LENGTH),
        )
    }

    fn header(id: u64) -> RequestHeader {
        RequestHeader {
            id,
            service: "pkg.Echo".to_string(),
            method: "Say".to_string(),
            metadata: Metadata::from([("x-user".to_string(), "42".to_string())]),
            timeout_ms: Some(500),
        }
    }

    #[tokio::test]
    async fn worker_sees_request_and_pool_sees_payload() {
        let (mut pool, mut worker) = pipe();

        let worker = tokio::spawn(async move {
            let (request, payload) = worker.next_request().await.unwrap().unwrap();
            assert_eq!(request, header(7));
            worker.respond(request.id, &Ok(payload)).await.unwrap();
        });

        let reply = pool
            .call(&header(7), Bytes::from_static(b"\x0a\x02hi"))
            .await
            .unwrap();
        assert_eq!(reply, Ok(Bytes::from_static(b"\x0a\x02hi")));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_faults_become_worker_errors() {
        let (mut pool, mut worker) = pipe();

        tokio::spawn(async move {
            let (request, _) = worker.next_request().await.unwrap().unwrap();
            let fault = WorkerError::new(FailureKind::MalformedEnvelope, "bad payload");
            worker.respond(request.id, &Err(fault)).await.unwrap();
        });

        let reply = pool.call(&header(1), Bytes::new()).await.unwrap();
        let err = reply.unwrap_err();
        assert_eq!(err.kind, FailureKind::MalformedEnvelope);
        assert_eq!(err.message, "bad payload");
    }

    #[tokio::test]
    async fn stale_response_is_a_protocol_error() {
        let (mut pool, mut worker) = pipe();

        tokio::spawn(async move {
            let (request, payload) = worker.next_request().await.unwrap().unwrap();
            worker.respond(request.id + 1, &Ok(payload)).await.unwrap();
        });

        let err = pool.call(&header(3), Bytes::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::IdMismatch {
                expected: 3,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn closed_worker_is_reported() {
        let (mut pool, worker) = pipe();
        drop(worker);

        let err = pool.call(&header(1), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::Closed | RelayError::Io(_)));
    }
}
