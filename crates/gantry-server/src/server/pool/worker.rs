use super::manager::{Job, Shared};
use core::time::Duration;
use gantry_core::{
    envelope::CallEnvelope,
    pool::{PoolEventKind, WorkerEnv, WorkerError, WorkerResult, WorkerState},
    relay::{Relay, RelayError, RequestHeader},
};
use std::{
    io,
    process::{ExitStatus, Stdio},
    sync::Arc,
};
use tokio::{
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{Mutex, mpsc, watch},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Consecutive failed spawns after which the pool gives up.
const MAX_RESPAWN_ATTEMPTS: u32 = 3;

/// Back-off unit between respawn attempts; attempt `n` waits `n` units.
const RESPAWN_BACKOFF: Duration = Duration::from_millis(100);

/// A live worker process and the relay over its stdin/stdout.
pub(crate) struct WorkerProcess {
    child: Child,
    relay: Relay<ChildStdout, ChildStdin>,
}

impl WorkerProcess {
    /// Spawns `command` with `config_env` and then `env` applied on top of the
    /// inherited environment. Stderr is inherited so worker logs reach the
    /// gateway's output.
    pub(crate) fn spawn(
        command: &[String],
        config_env: &WorkerEnv,
        env: &WorkerEnv,
        max_frame_length: usize,
    ) -> io::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty worker command"))?;

        let mut child = Command::new(program)
            .args(args)
            .envs(config_env)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;

        Ok(Self {
            child,
            relay: Relay::new(stdout, stdin, max_frame_length),
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn call(
        &mut self,
        header: &RequestHeader,
        payload: bytes::Bytes,
    ) -> Result<WorkerResult, RelayError> {
        self.relay.call(header, payload).await
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Closes the worker's stdin and waits up to `grace` for it to exit before
    /// killing it.
    pub(crate) async fn terminate(self, grace: Duration) -> String {
        let Self { mut child, relay } = self;
        drop(relay);

        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(err)) => format!("wait failed: {err}"),
            Err(_) => {
                let _ = child.kill().await;
                "killed after destroy timeout".to_string()
            }
        }
    }

    pub(crate) async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

/// Everything one worker slot needs, apart from its current process.
pub(crate) struct WorkerSlot {
    pub(crate) id: usize,
    pub(crate) shared: Arc<Shared>,
    pub(crate) jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) reset: watch::Receiver<u64>,
    pub(crate) env: Arc<WorkerEnv>,
}

enum Idle {
    Shutdown,
    Reset,
    Exited(io::Result<ExitStatus>),
    Job(Job),
}

enum Outcome {
    Done(Result<WorkerResult, RelayError>),
    Abandoned(String),
    Shutdown,
}

async fn next_job(jobs: &Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    jobs.lock().await.recv().await
}

/// Runs one worker slot until the pool stops or becomes fatal.
///
/// The slot pulls jobs from the shared queue one at a time. Its process is
/// replaced whenever it crashes, is recycled after `max_jobs`, is reset, or
/// is still running a call its caller abandoned.
pub(crate) async fn worker_loop(mut slot: WorkerSlot, process: WorkerProcess) {
    let id = slot.id;
    tracing::debug!(worker = id, pid = ?process.pid(), "Worker started");

    if let Some(process) = slot.run(process).await {
        let status = process
            .terminate(slot.shared.config.destroy_timeout)
            .await;
        slot.shared
            .emit(PoolEventKind::WorkerStopped, Some(id), status);
    }

    slot.shared.update_worker(id, |info| {
        info.state = WorkerState::Stopped;
        info.pid = None;
    });
    tracing::debug!(worker = id, "Worker stopped");
}

impl WorkerSlot {
    /// Returns the live process on a clean exit, `None` when it is already
    /// gone.
    async fn run(&mut self, mut process: WorkerProcess) -> Option<WorkerProcess> {
        let max_jobs = self.shared.config.max_jobs;
        let mut completed = 0_u64;

        loop {
            let idle = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => Idle::Shutdown,
                changed = self.reset.changed() => match changed {
                    Ok(()) => Idle::Reset,
                    Err(_) => Idle::Shutdown,
                },
                status = process.wait() => Idle::Exited(status),
                job = next_job(&self.jobs) => job.map_or(Idle::Shutdown, Idle::Job),
            };

            let job = match idle {
                Idle::Shutdown => return Some(process),
                Idle::Reset => {
                    self.reset.borrow_and_update();
                    process = self.restart(process, "reset requested").await?;
                    completed = 0;
                    continue;
                }
                Idle::Exited(status) => {
                    let detail = match status {
                        Ok(status) => format!("exited while idle: {status}"),
                        Err(err) => format!("lost while idle: {err}"),
                    };
                    tracing::warn!(worker = self.id, "{detail}");
                    self.shared
                        .emit(PoolEventKind::WorkerCrashed, Some(self.id), detail);
                    process = self.respawn().await?;
                    completed = 0;
                    continue;
                }
                Idle::Job(job) => job,
            };

            let Job {
                envelope,
                permit,
                mut response,
            } = job;

            // Abandoned while queued: nothing was sent to the process.
            if response.is_closed() || envelope.context.cancellation.is_cancelled() {
                continue;
            }
            if envelope.context.is_expired() {
                let _ = response.send(Err(gantry_core::Error::DeadlineExceeded.into()));
                continue;
            }

            self.shared
                .update_worker(self.id, |info| info.state = WorkerState::Working);
            let header = RequestHeader::for_envelope(self.shared.next_request_id(), &envelope);
            let CallEnvelope {
                payload, context, ..
            } = envelope;

            let outcome = tokio::select! {
                biased;
                err = context.done() => Outcome::Abandoned(err.to_string()),
                () = response.closed() => Outcome::Abandoned("caller went away".to_string()),
                () = self.shutdown.cancelled() => Outcome::Shutdown,
                result = process.call(&header, payload) => Outcome::Done(result),
            };

            match outcome {
                Outcome::Done(Ok(result)) => {
                    completed += 1;
                    self.shared.update_worker(self.id, |info| {
                        info.jobs += 1;
                        info.state = WorkerState::Ready;
                    });
                    let _ = response.send(result);

                    if max_jobs > 0 && completed >= max_jobs {
                        let reason = format!("recycled after {completed} jobs");
                        process = self.restart(process, &reason).await?;
                        completed = 0;
                    }
                }
                Outcome::Done(Err(err)) => {
                    tracing::warn!(worker = self.id, request = header.id, "Relay failed: {err}");
                    let _ = response.send(Err(WorkerError::unavailable(format!(
                        "worker {} failed: {err}",
                        self.id
                    ))));
                    self.shared
                        .emit(PoolEventKind::WorkerCrashed, Some(self.id), err.to_string());
                    process.kill().await;
                    process = self.respawn().await?;
                    completed = 0;
                }
                Outcome::Abandoned(reason) => {
                    // The late result must never reach another caller.
                    tracing::debug!(worker = self.id, request = header.id, "Killing worker: {reason}");
                    let _ = response.send(Err(WorkerError::unavailable(reason.clone())));
                    process.kill().await;
                    self.shared.emit(
                        PoolEventKind::WorkerStopped,
                        Some(self.id),
                        format!("killed after abandoned call: {reason}"),
                    );
                    process = self.respawn().await?;
                    completed = 0;
                }
                Outcome::Shutdown => {
                    let _ = response.send(Err(WorkerError::unavailable("worker pool stopped")));
                    process.kill().await;
                    self.shared.emit(
                        PoolEventKind::WorkerStopped,
                        Some(self.id),
                        "killed during shutdown",
                    );
                    return None;
                }
            }

            drop(permit);
        }
    }

    /// Gracefully replaces the process.
    async fn restart(&self, process: WorkerProcess, reason: &str) -> Option<WorkerProcess> {
        self.shared
            .update_worker(self.id, |info| info.state = WorkerState::Restarting);
        let status = process.terminate(self.shared.config.destroy_timeout).await;
        self.shared.emit(
            PoolEventKind::WorkerStopped,
            Some(self.id),
            format!("{reason} ({status})"),
        );
        self.respawn().await
    }

    /// Spawns a replacement process. After [`MAX_RESPAWN_ATTEMPTS`] failures
    /// in a row the whole pool is marked fatal.
    async fn respawn(&self) -> Option<WorkerProcess> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        self.shared
            .update_worker(self.id, |info| info.state = WorkerState::Restarting);

        let config = &self.shared.config;
        let mut last_error = None;
        for attempt in 1..=MAX_RESPAWN_ATTEMPTS {
            match WorkerProcess::spawn(
                &config.command,
                &config.env,
                &self.env,
                config.max_frame_length,
            ) {
                Ok(process) => {
                    let pid = process.pid();
                    self.shared.update_worker(self.id, |info| {
                        info.pid = pid;
                        info.state = WorkerState::Ready;
                    });
                    self.shared.emit(
                        PoolEventKind::WorkerStarted,
                        Some(self.id),
                        format!("pid {}", pid.unwrap_or_default()),
                    );
                    return Some(process);
                }
                Err(err) => {
                    tracing::warn!(worker = self.id, attempt, "Failed to respawn worker: {err}");
                    last_error = Some(err);
                    if attempt < MAX_RESPAWN_ATTEMPTS {
                        sleep(RESPAWN_BACKOFF * attempt).await;
                    }
                }
            }
        }

        let detail = match last_error {
            Some(err) => format!("worker {} could not be respawned: {err}", self.id),
            None => format!("worker {} could not be respawned", self.id),
        };
        self.shared.mark_fatal(detail);
        None
    }
}
