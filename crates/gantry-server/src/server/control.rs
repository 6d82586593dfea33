//! The `gantry.Control` administrative service.
//!
//! Served on the control listener only, never on the data plane.

use crate::server::service::handler::ServiceState;
use gantry_core::{
    pool::{PoolError, WorkerPool},
    proto::{
        ResetRequest, ResetResponse, StatusRequest, StatusResponse, Worker, WorkersRequest,
        WorkersResponse, control_server::Control,
    },
};
use std::sync::Arc;
use tokio::sync::watch;
use tonic::{Request, Response, Status};

pub struct ControlService {
    pool: Arc<dyn WorkerPool>,
    state: watch::Receiver<ServiceState>,
    services: Vec<String>,
}

impl ControlService {
    pub fn new(
        pool: Arc<dyn WorkerPool>,
        state: watch::Receiver<ServiceState>,
        services: Vec<String>,
    ) -> Self {
        Self {
            pool,
            state,
            services,
        }
    }
}

#[tonic::async_trait]
impl Control for ControlService {
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let state = *self.state.borrow();
        Ok(Response::new(StatusResponse {
            serving: state == ServiceState::Active,
            state: state.as_str().to_string(),
            services: self.services.clone(),
        }))
    }

    async fn workers(
        &self,
        _request: Request<WorkersRequest>,
    ) -> Result<Response<WorkersResponse>, Status> {
        let workers = self
            .pool
            .workers()
            .into_iter()
            .map(|info| Worker {
                id: u32::try_from(info.id).unwrap_or(u32::MAX),
                pid: info.pid.unwrap_or_default(),
                jobs: info.jobs,
                state: info.state.as_str().to_string(),
            })
            .collect();
        Ok(Response::new(WorkersResponse { workers }))
    }

    async fn reset(&self, _request: Request<ResetRequest>) -> Result<Response<ResetResponse>, Status> {
        match self.pool.reset().await {
            Ok(()) => Ok(Response::new(ResetResponse {})),
            Err(err @ PoolError::NotRunning) => Err(Status::failed_precondition(err.to_string())),
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{
        envelope::CallEnvelope,
        pool::{PoolEvent, WorkerEnv, WorkerInfo, WorkerResult, WorkerState},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;
    use tonic::Code;

    #[derive(Default)]
    struct Snapshot {
        resets: AtomicUsize,
    }

    #[tonic::async_trait]
    impl WorkerPool for Snapshot {
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

        fn workers(&self) -> Vec<WorkerInfo> {
            vec![
                WorkerInfo {
                    id: 0,
                    pid: Some(42),
                    jobs: 7,
                    state: WorkerState::Ready,
                },
                WorkerInfo {
                    id: 1,
                    pid: None,
                    jobs: 0,
                    state: WorkerState::Restarting,
                },
            ]
        }

        async fn reset(&self) -> Result<(), PoolError> {
            if self.resets.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                Err(PoolError::NotRunning)
            }
        }
    }

    fn service(state: ServiceState) -> ControlService {
        let (_tx, rx) = watch::channel(state);
        ControlService::new(
            Arc::new(Snapshot::default()),
            rx,
            vec!["pkg.Echo".to_string()],
        )
    }

    #[tokio::test]
    async fn status_reports_state_and_services() {
        let response = service(ServiceState::Active)
            .status(Request::new(StatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(response.serving);
        assert_eq!(response.state, "active");
        assert_eq!(response.services, ["pkg.Echo"]);

        let response = service(ServiceState::Draining)
            .status(Request::new(StatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.serving);
        assert_eq!(response.state, "draining");
    }

    #[tokio::test]
    async fn workers_are_listed() {
        let workers = service(ServiceState::Active)
            .workers(Request::new(WorkersRequest {}))
            .await
            .unwrap()
            .into_inner()
            .workers;
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].pid, 42);
        assert_eq!(workers[0].jobs, 7);
        assert_eq!(workers[0].state, "ready");
        assert_eq!(workers[1].pid, 0);
        assert_eq!(workers[1].state, "restarting");
    }

    #[tokio::test]
    async fn reset_on_a_stopped_pool_is_a_failed_precondition() {
        let control = service(ServiceState::Active);
        assert!(control.reset(Request::new(ResetRequest {})).await.is_ok());
        let status = control
            .reset(Request::new(ResetRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }
}
