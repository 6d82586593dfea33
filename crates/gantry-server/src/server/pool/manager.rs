//! A [`WorkerPool`] backed by child processes.
//!
//! [`ProcessPool`] runs `num_workers` copies of the configured worker command
//! and talks to each of them over the relay protocol on its stdin/stdout.
//!
//! Dispatch is two-staged: a caller first acquires one of `num_workers`
//! semaphore permits (waiting at most `allocate_timeout`), then pushes its
//! job onto a queue shared by all idle workers. The permit travels with the
//! job and is released once the worker is ready for more work, so the queue
//! never holds more jobs than there are workers.
//!
//! Shutdown refuses new work first, signals every worker through a shared
//! [`CancellationToken`], then waits for each worker task with a bounded
//! timeout.

use super::worker::{WorkerProcess, WorkerSlot, worker_loop};
use crate::server::config::PoolConfig;
use gantry_core::{
    envelope::CallEnvelope,
    pool::{
        PoolError, PoolEvent, PoolEventKind, WorkerEnv, WorkerError, WorkerInfo, WorkerPool,
        WorkerResult, WorkerState,
    },
};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{
    sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore, broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Capacity of the pool event channel. Slow subscribers lag rather than block
/// workers.
const EVENT_CAPACITY: usize = 64;

/// One queued envelope and the channel its result goes back on.
pub(crate) struct Job {
    pub(crate) envelope: CallEnvelope,
    pub(crate) permit: OwnedSemaphorePermit,
    pub(crate) response: oneshot::Sender<WorkerResult>,
}

struct Running {
    jobs: mpsc::Sender<Job>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    reset: watch::Sender<u64>,
    handles: Vec<JoinHandle<()>>,
}

/// State shared between the pool handle and its worker tasks.
pub(crate) struct Shared {
    pub(crate) config: PoolConfig,
    events: broadcast::Sender<PoolEvent>,
    running: Mutex<Option<Running>>,
    workers: RwLock<Vec<WorkerInfo>>,
    next_request_id: AtomicU64,
    fatal: AtomicBool,
}

impl Shared {
    pub(crate) fn emit(&self, kind: PoolEventKind, worker_id: Option<usize>, detail: impl Into<String>) {
        let event = PoolEvent::new(kind, worker_id, detail);
        tracing::debug!(kind = %event.kind, worker = ?event.worker_id, "{}", event.detail);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn update_worker(&self, id: usize, update: impl FnOnce(&mut WorkerInfo)) {
        if let Some(info) = self.workers.write().get_mut(id) {
            update(info);
        }
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stops dispatching for good and publishes [`PoolEventKind::PoolFatal`].
    pub(crate) fn mark_fatal(&self, detail: String) {
        if self.fatal.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!("Worker pool is no longer usable: {detail}");
        if let Some(running) = self.running.lock().as_ref() {
            running.permits.close();
            running.shutdown.cancel();
        }
        self.emit(PoolEventKind::PoolFatal, None, detail);
    }
}

/// Supervises a fixed number of worker processes.
#[derive(Clone)]
pub struct ProcessPool {
    shared: Arc<Shared>,
}

impl ProcessPool {
    pub fn new(config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                events,
                running: Mutex::new(None),
                workers: RwLock::new(Vec::new()),
                next_request_id: AtomicU64::new(1),
                fatal: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Handles needed to dispatch a job, or why there are none.
    fn dispatch_handles(&self) -> Result<(mpsc::Sender<Job>, Arc<Semaphore>), WorkerError> {
        if self.shared.fatal.load(Ordering::Acquire) {
            return Err(WorkerError::unavailable("worker pool failed"));
        }
        match self.shared.running.lock().as_ref() {
            Some(running) if !running.shutdown.is_cancelled() => {
                Ok((running.jobs.clone(), Arc::clone(&running.permits)))
            }
            _ => Err(WorkerError::unavailable("worker pool is not running")),
        }
    }
}

#[tonic::async_trait]
impl WorkerPool for ProcessPool {
    async fn start(&self, env: WorkerEnv) -> Result<(), PoolError> {
        if self.shared.running.lock().is_some() {
            return Err(PoolError::AlreadyStarted);
        }

        let config = &self.shared.config;
        let mut processes = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            match WorkerProcess::spawn(&config.command, &config.env, &env, config.max_frame_length)
            {
                Ok(process) => processes.push(process),
                Err(source) => {
                    for process in processes {
                        process.kill().await;
                    }
                    return Err(PoolError::Spawn { worker_id, source });
                }
            }
        }

        let (jobs_tx, jobs_rx) = mpsc::channel(config.num_workers.max(1));
        let jobs_rx = Arc::new(AsyncMutex::new(jobs_rx));
        let permits = Arc::new(Semaphore::new(config.num_workers));
        let shutdown = CancellationToken::new();
        let (reset_tx, _) = watch::channel(0_u64);
        let env = Arc::new(env);

        *self.shared.workers.write() = processes
            .iter()
            .enumerate()
            .map(|(id, process)| WorkerInfo {
                id,
                pid: process.pid(),
                jobs: 0,
                state: WorkerState::Ready,
            })
            .collect();
        self.shared.fatal.store(false, Ordering::Release);

        let mut handles = Vec::with_capacity(processes.len());
        for (id, process) in processes.into_iter().enumerate() {
            self.shared.emit(
                PoolEventKind::WorkerStarted,
                Some(id),
                format!("pid {}", process.pid().unwrap_or_default()),
            );
            let slot = WorkerSlot {
                id,
                shared: Arc::clone(&self.shared),
                jobs: Arc::clone(&jobs_rx),
                shutdown: shutdown.clone(),
                reset: reset_tx.subscribe(),
                env: Arc::clone(&env),
            };
            handles.push(tokio::spawn(worker_loop(slot, process)));
        }

        let raced = {
            let mut running = self.shared.running.lock();
            if running.is_some() {
                true
            } else {
                *running = Some(Running {
                    jobs: jobs_tx,
                    permits,
                    shutdown: shutdown.clone(),
                    reset: reset_tx,
                    handles,
                });
                false
            }
        };
        if raced {
            shutdown.cancel();
            return Err(PoolError::AlreadyStarted);
        }

        tracing::info!(
            workers = config.num_workers,
            command = ?config.command,
            "Worker pool started"
        );
        Ok(())
    }

    async fn execute(&self, envelope: CallEnvelope) -> WorkerResult {
        let (jobs, permits) = self.dispatch_handles()?;
        let context = envelope.context.clone();
        let allocate_timeout = self.shared.config.allocate_timeout;

        let permit = tokio::select! {
            biased;
            err = context.done() => return Err(err.into()),
            permit = timeout(allocate_timeout, permits.acquire_owned()) => match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_closed)) => return Err(WorkerError::unavailable("worker pool is shutting down")),
                Err(_elapsed) => return Err(WorkerError::unavailable("no free workers")),
            },
        };

        let (response, result) = oneshot::channel();
        jobs.send(Job {
            envelope,
            permit,
            response,
        })
        .await
        .map_err(|_| WorkerError::unavailable("worker pool is shutting down"))?;

        tokio::select! {
            biased;
            err = context.done() => Err(err.into()),
            result = result => result
                .unwrap_or_else(|_| Err(WorkerError::unavailable("worker dropped the call"))),
        }
    }

    fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    async fn stop(&self) {
        let Some(running) = self.shared.running.lock().take() else {
            return;
        };

        tracing::info!("Stopping worker pool");
        running.permits.close();
        running.shutdown.cancel();
        drop(running.jobs);

        // Workers wait up to `destroy_timeout` for their process; allow that
        // plus a margin before giving up on the task.
        let grace = self.shared.config.destroy_timeout * 2;
        let waits = running.handles.into_iter().enumerate().map(|(_id, mut handle)| async move {
            match timeout(grace, &mut handle).await {
                Ok(Ok(())) => {
                    tracing::trace!("Worker {_id} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    tracing::error!("Worker {_id} task failed: {_e}");
                }
                Err(_) => {
                    tracing::warn!("Worker {_id} shutdown timed out");
                    handle.abort();
                }
            }
        });
        futures::future::join_all(waits).await;

        tracing::info!("Worker pool shutdown complete");
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.shared.workers.read().clone()
    }

    async fn reset(&self) -> Result<(), PoolError> {
        match self.shared.running.lock().as_ref() {
            Some(running) if !running.shutdown.is_cancelled() => {
                running.reset.send_modify(|generation| *generation += 1);
                tracing::info!("Worker reset requested");
                Ok(())
            }
            _ => Err(PoolError::NotRunning),
        }
    }
}
