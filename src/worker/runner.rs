use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{ExecutionError, GatewayError, WorkerError};
use crate::job::JobRecord;
use crate::queue::{DeliveryHandle, Dequeued, QueueGateway, QueueNames};
use crate::status::{JobStatus, StatusReport};
use crate::worker::executor::{OutputBuffer, ProcessSupervisor, OUTPUT_LIMIT};
use crate::worker::heartbeat::HeartbeatEmitter;
use crate::worker::params::ParameterFile;

/// Pause before retrying after a dequeue error the gateway could not hide.
const DEQUEUE_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Reason recorded on a FAILED report when a run is cut short by shutdown.
pub const ABORTED_MESSAGE: &str = "aborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Preparing,
    Running,
    Reporting,
    Ack,
    Reject,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Fetching => "fetching",
            WorkerState::Preparing => "preparing",
            WorkerState::Running => "running",
            WorkerState::Reporting => "reporting",
            WorkerState::Ack => "ack",
            WorkerState::Reject => "reject",
        };
        f.write_str(name)
    }
}

/// Everything the loop needs to know about this worker, fixed at startup.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub instance_id: String,
    pub queues: QueueNames,
    pub heartbeat_interval: Duration,
    pub preworker_sleep: Duration,
    pub postworker_sleep: Duration,
    pub scratch_dir: PathBuf,
    /// Stop cleanly after this many jobs reach a terminal decision.
    pub max_runs: Option<u64>,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig, instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        Self {
            queues: QueueNames::from_config(config, &instance_id),
            instance_id,
            heartbeat_interval: config.heartbeat_interval,
            preworker_sleep: config.preworker_sleep,
            postworker_sleep: config.postworker_sleep,
            scratch_dir: config.scratch_dir.clone(),
            max_runs: None,
        }
    }

    pub fn with_max_runs(mut self, max_runs: Option<u64>) -> Self {
        self.max_runs = max_runs;
        self
    }
}

/// Counters returned when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Jobs that reached ack or reject-with-requeue.
    pub jobs_run: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Jobs handed back to the broker before a workflow attempt started.
    pub requeued: u64,
    /// Undecodable messages dropped.
    pub poison: u64,
    /// Whether a running job was killed by shutdown.
    pub aborted: bool,
}

enum Outcome {
    Finished(JobStatus),
    Requeued,
    Aborted,
}

/// Pulls jobs one at a time and drives each to a terminal report.
///
/// For every message:
///
/// 1. **Idle**: optional pre-worker sleep
/// 2. **Fetching**: wait on both bound queues; undecodable messages are
///    rejected without requeue and fetching continues
/// 3. **Preparing**: write the parameter file; if that fails the message is
///    requeued for another worker
/// 4. **Running**: heartbeat armed, workflow process supervised
/// 5. **Reporting**: heartbeat stopped, one SUCCESS or FAILED report
/// 6. **Ack**: message acknowledged, parameter file removed
/// 7. optional post-worker sleep
///
/// No job-level failure escapes [`Worker::run`]; only failing to bind the
/// queues does.
pub struct Worker {
    settings: WorkerSettings,
    gateway: Arc<dyn QueueGateway>,
    supervisor: Arc<dyn ProcessSupervisor>,
    heartbeat: HeartbeatEmitter,
    state_tx: watch::Sender<WorkerState>,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        gateway: Arc<dyn QueueGateway>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        Self {
            heartbeat: HeartbeatEmitter::new(settings.heartbeat_interval),
            settings,
            gateway,
            supervisor,
            state_tx,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: WorkerState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Worker state change");
        }
    }

    /// Run until `shutdown` fires, the broker closes, or `max_runs` is hit.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerSummary, WorkerError> {
        let bound = self.gateway.bind_queues(&self.settings.queues).await?;
        tracing::info!(
            instance_id = %self.settings.instance_id,
            shared = %bound.shared,
            instance = %bound.instance,
            max_runs = ?self.settings.max_runs,
            "Worker started"
        );

        let mut summary = WorkerSummary::default();
        loop {
            if let Some(max) = self.settings.max_runs {
                if summary.jobs_run >= max {
                    tracing::info!(max_runs = max, "Run limit reached");
                    break;
                }
            }

            self.transition(WorkerState::Idle);
            if !pause(self.settings.preworker_sleep, &shutdown).await {
                break;
            }

            self.transition(WorkerState::Fetching);
            let Some((job, handle)) = self.fetch(&shutdown, &mut summary).await else {
                break;
            };

            let outcome = self.process(job, handle, &shutdown).await;
            summary.jobs_run += 1;
            match outcome {
                Outcome::Finished(JobStatus::Success) => summary.succeeded += 1,
                Outcome::Finished(_) => summary.failed += 1,
                Outcome::Requeued => summary.requeued += 1,
                Outcome::Aborted => {
                    summary.failed += 1;
                    summary.aborted = true;
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            self.transition(WorkerState::Idle);
            if !pause(self.settings.postworker_sleep, &shutdown).await {
                break;
            }
        }

        self.transition(WorkerState::Idle);
        tracing::info!(
            jobs_run = summary.jobs_run,
            succeeded = summary.succeeded,
            failed = summary.failed,
            requeued = summary.requeued,
            poison = summary.poison,
            "Worker stopped"
        );
        Ok(summary)
    }

    /// Next decodable job, or `None` once the worker should stop.
    async fn fetch(
        &self,
        shutdown: &CancellationToken,
        summary: &mut WorkerSummary,
    ) -> Option<(JobRecord, DeliveryHandle)> {
        loop {
            let dequeued = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                result = self.gateway.dequeue() => result,
            };

            let Dequeued { handle, job } = match dequeued {
                Ok(dequeued) => dequeued,
                Err(GatewayError::Closed) => {
                    tracing::info!("Queue gateway closed");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dequeue failed");
                    if !pause(DEQUEUE_RETRY_PAUSE, shutdown).await {
                        return None;
                    }
                    continue;
                }
            };

            match job {
                Ok(job) => {
                    tracing::info!(
                        job_uuid = %job.uuid(),
                        workflow = ?job.workflow_name,
                        version = ?job.workflow_version,
                        queue = %handle.queue,
                        "Received job"
                    );
                    return Some((job, handle));
                }
                Err(e) => {
                    tracing::warn!(queue = %handle.queue, error = %e, "Dropping poison message");
                    summary.poison += 1;
                    self.reject(handle, false).await;
                }
            }
        }
    }

    async fn process(
        &self,
        job: JobRecord,
        handle: DeliveryHandle,
        shutdown: &CancellationToken,
    ) -> Outcome {
        self.transition(WorkerState::Preparing);
        let params = match ParameterFile::prepare(&self.settings.scratch_dir, &job).await {
            Ok(params) => params,
            Err(e) => {
                tracing::error!(job_uuid = %job.uuid(), error = %e, "Cannot prepare job, requeueing");
                self.transition(WorkerState::Reject);
                self.reject(handle, true).await;
                return Outcome::Requeued;
            }
        };

        if shutdown.is_cancelled() {
            tracing::info!(job_uuid = %job.uuid(), "Shutdown before start, requeueing");
            self.transition(WorkerState::Reject);
            self.reject(handle, true).await;
            return Outcome::Requeued;
        }

        let (report, outcome) = match job.workflow_path.as_deref() {
            Some(workflow_path) => {
                self.execute(&job, Path::new(workflow_path), &params, shutdown)
                    .await
            }
            None => {
                self.transition(WorkerState::Reporting);
                tracing::warn!(job_uuid = %job.uuid(), "Job has no workflow_path");
                (
                    StatusReport::failed(
                        &job,
                        &self.settings.instance_id,
                        None,
                        "job has no workflow_path",
                    ),
                    Outcome::Finished(JobStatus::Failed),
                )
            }
        };

        self.publish(&report).await;
        drop(params);

        self.transition(WorkerState::Ack);
        self.ack(handle).await;
        outcome
    }

    /// Run the workflow with the heartbeat going, and build the terminal
    /// report. The heartbeat is fully stopped before this returns.
    async fn execute(
        &self,
        job: &JobRecord,
        workflow_path: &Path,
        params: &ParameterFile,
        shutdown: &CancellationToken,
    ) -> (StatusReport, Outcome) {
        self.transition(WorkerState::Running);
        let heartbeat = self.heartbeat.arm(
            self.gateway.clone(),
            job.clone(),
            self.settings.instance_id.clone(),
        );

        let result = self
            .supervisor
            .run(workflow_path, params.path(), shutdown)
            .await;

        let beats = heartbeat.stop().await;
        self.transition(WorkerState::Reporting);
        let instance_id = &self.settings.instance_id;

        match result {
            Ok(_) => {
                tracing::info!(job_uuid = %job.uuid(), heartbeats = beats, "Job succeeded");
                (
                    StatusReport::success(job, instance_id),
                    Outcome::Finished(JobStatus::Success),
                )
            }
            Err(ExecutionError::Aborted { .. }) => {
                tracing::warn!(job_uuid = %job.uuid(), "Job aborted by shutdown");
                (
                    StatusReport::failed(job, instance_id, None, ABORTED_MESSAGE),
                    Outcome::Aborted,
                )
            }
            Err(e) => {
                tracing::warn!(
                    job_uuid = %job.uuid(),
                    exit_code = ?e.exit_code(),
                    error = %e,
                    "Job failed"
                );
                (
                    StatusReport::failed(job, instance_id, e.exit_code(), diagnostic(&e)),
                    Outcome::Finished(JobStatus::Failed),
                )
            }
        }
    }

    async fn publish(&self, report: &StatusReport) {
        if let Err(e) = self.gateway.publish_status(report).await {
            tracing::error!(
                job_uuid = %report.job_uuid,
                status = %report.status,
                error = %e,
                "Failed to publish status report"
            );
        }
    }

    async fn ack(&self, handle: DeliveryHandle) {
        let tag = handle.tag;
        if let Err(e) = self.gateway.ack(handle).await {
            tracing::error!(tag, error = %e, "Failed to ack message");
        }
    }

    async fn reject(&self, handle: DeliveryHandle, requeue: bool) {
        let tag = handle.tag;
        if let Err(e) = self.gateway.reject(handle, requeue).await {
            tracing::error!(tag, requeue, error = %e, "Failed to reject message");
        }
    }
}

/// Failure text for a report: the error, followed by whatever the process
/// printed, bounded.
fn diagnostic(error: &ExecutionError) -> String {
    let mut buffer = OutputBuffer::new(OUTPUT_LIMIT);
    buffer.push(&error.to_string());
    if let Some(output) = error.output().filter(|o| !o.is_empty()) {
        buffer.push("\n");
        buffer.push(output);
    }
    buffer.render()
}

/// Sleep unless shutdown fires first. Returns false if it did.
async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !shutdown.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
