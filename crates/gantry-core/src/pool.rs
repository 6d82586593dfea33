//! # Worker pool contract
//!
//! The gateway never executes business logic itself. Every call is packaged
//! into a [`CallEnvelope`] and handed to a [`WorkerPool`], which owns a
//! bounded set of worker processes and returns either the raw response bytes
//! or a [`WorkerError`].
//!
//! Pools also publish [`PoolEvent`]s describing worker lifecycle changes. The
//! gateway forwards them to registered listeners and stops serving on
//! [`PoolEventKind::PoolFatal`].
//!
//! ## Contract
//!
//! - [`WorkerPool::start`] runs once before any call is dispatched.
//! - [`WorkerPool::execute`] must honor the envelope's cancellation token and
//!   deadline. A result produced for an abandoned envelope must never be
//!   returned to a different caller.
//! - [`WorkerPool::stop`] refuses new envelopes before it tears workers down.

use crate::envelope::CallEnvelope;
use bytes::Bytes;
use core::fmt;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Environment variables passed to every worker process.
pub type WorkerEnv = BTreeMap<String, String>;

/// The outcome of one envelope execution.
pub type WorkerResult = Result<Bytes, WorkerError>;

/// Why a worker could not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No worker capacity, or the worker process died.
    WorkerUnavailable,
    /// The worker ran the call and reported an application error.
    Application,
    /// The worker rejected the envelope itself.
    MalformedEnvelope,
    /// The envelope was cancelled before a result was produced.
    Cancelled,
    /// The envelope's deadline elapsed before a result was produced.
    DeadlineExceeded,
    /// A kind this gateway does not know about.
    Unknown(String),
}

impl FailureKind {
    pub fn as_str(&self) -> &str {
        match self {
            FailureKind::WorkerUnavailable => "unavailable",
            FailureKind::Application => "application",
            FailureKind::MalformedEnvelope => "malformed",
            FailureKind::Cancelled => "cancelled",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
            FailureKind::Unknown(name) => name,
        }
    }
}

impl From<&str> for FailureKind {
    fn from(name: &str) -> Self {
        match name {
            "unavailable" => FailureKind::WorkerUnavailable,
            "application" => FailureKind::Application,
            "malformed" => FailureKind::MalformedEnvelope,
            "cancelled" => FailureKind::Cancelled,
            "deadline_exceeded" => FailureKind::DeadlineExceeded,
            other => FailureKind::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed envelope execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WorkerError {
    pub kind: FailureKind,
    pub message: String,
}

impl WorkerError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::WorkerUnavailable, message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message)
    }
}

impl From<crate::Error> for WorkerError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Cancelled => Self::new(FailureKind::Cancelled, "call cancelled"),
            crate::Error::DeadlineExceeded => {
                Self::new(FailureKind::DeadlineExceeded, "deadline exceeded")
            }
            other => Self::application(other.to_string()),
        }
    }
}

/// Errors starting or stopping a pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is already running")]
    AlreadyStarted,

    #[error("Failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pool is not running")]
    NotRunning,
}

/// What happened to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEventKind {
    WorkerStarted,
    WorkerStopped,
    WorkerCrashed,
    /// The pool cannot recover. The gateway stops serving.
    PoolFatal,
}

impl PoolEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            PoolEventKind::WorkerStarted => "worker_started",
            PoolEventKind::WorkerStopped => "worker_stopped",
            PoolEventKind::WorkerCrashed => "worker_crashed",
            PoolEventKind::PoolFatal => "pool_fatal",
        }
    }
}

impl fmt::Display for PoolEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous lifecycle notification published by a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub worker_id: Option<usize>,
    pub detail: String,
}

impl PoolEvent {
    pub fn new(kind: PoolEventKind, worker_id: Option<usize>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            worker_id,
            detail: detail.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == PoolEventKind::PoolFatal
    }
}

/// Lifecycle state of a single worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Working,
    Restarting,
    Stopped,
}

impl WorkerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkerState::Ready => "ready",
            WorkerState::Working => "working",
            WorkerState::Restarting => "restarting",
            WorkerState::Stopped => "stopped",
        }
    }
}

/// Snapshot of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: usize,
    pub pid: Option<u32>,
    pub jobs: u64,
    pub state: WorkerState,
}

/// A supervised set of workers that execute envelopes.
#[tonic::async_trait]
pub trait WorkerPool: Send + Sync + 'static {
    /// Starts every worker with `env` added to its environment.
    async fn start(&self, env: WorkerEnv) -> Result<(), PoolError>;

    /// Executes one envelope, honoring its cancellation and deadline.
    async fn execute(&self, envelope: CallEnvelope) -> WorkerResult;

    /// Subscribes to lifecycle events. Subscribe before [`start`] to observe
    /// the initial `WorkerStarted` events.
    ///
    /// [`start`]: WorkerPool::start
    fn events(&self) -> broadcast::Receiver<PoolEvent>;

    /// Refuses new envelopes and tears every worker down.
    async fn stop(&self);

    /// Per-worker snapshot. Pools without observable workers return nothing.
    fn workers(&self) -> Vec<WorkerInfo> {
        Vec::new()
    }

    /// Restarts every worker.
    async fn reset(&self) -> Result<(), PoolError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_names_are_stable() {
        for kind in [
            FailureKind::WorkerUnavailable,
            FailureKind::Application,
            FailureKind::MalformedEnvelope,
            FailureKind::Cancelled,
            FailureKind::DeadlineExceeded,
        ] {
            assert_eq!(FailureKind::from(kind.as_str()), kind);
        }
        assert_eq!(
            FailureKind::from("teapot"),
            FailureKind::Unknown("teapot".to_string())
        );
    }

    #[test]
    fn only_pool_fatal_is_fatal() {
        assert!(PoolEvent::new(PoolEventKind::PoolFatal, None, "gone").is_fatal());
        assert!(!PoolEvent::new(PoolEventKind::WorkerCrashed, Some(1), "exit 255").is_fatal());
    }
}
