use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::job::JobRecord;
use crate::queue::QueueGateway;
use crate::status::StatusReport;

/// Periodic RUNNING reports for the job currently executing.
///
/// Heartbeats go out through the gateway only; the emitter never touches
/// worker state. Delivery is best-effort: a failed publish is logged and the
/// next tick tries again.
pub struct HeartbeatEmitter {
    interval: Duration,
}

impl HeartbeatEmitter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start emitting for `job`. The first report goes out immediately.
    pub fn arm(
        &self,
        gateway: Arc<dyn QueueGateway>,
        job: JobRecord,
        instance_id: String,
    ) -> HeartbeatHandle {
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sent: u64 = 0;

            loop {
                tokio::select! {
                    biased;
                    _ = task_stop.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let elapsed = started.elapsed().as_secs_f64();
                let report = StatusReport::running(&job, &instance_id, elapsed);
                // Not raced against `stop`: a publish in progress completes.
                match gateway.publish_status(&report).await {
                    Ok(()) => {
                        sent += 1;
                        tracing::debug!(
                            job_uuid = %job.uuid(),
                            elapsed_secs = elapsed,
                            "Heartbeat sent"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_uuid = %job.uuid(),
                            error = %e,
                            "Heartbeat publish failed"
                        );
                    }
                }
            }
            sent
        });

        HeartbeatHandle {
            stop: stop.drop_guard(),
            task,
        }
    }
}

/// Running heartbeat task. Dropping the handle also stops the task, but
/// without waiting for it.
pub struct HeartbeatHandle {
    stop: DropGuard,
    task: JoinHandle<u64>,
}

impl HeartbeatHandle {
    /// Stop the emitter and wait for it to finish. Once this returns no
    /// further RUNNING report for the job can be published. Returns the
    /// number of heartbeats delivered.
    pub async fn stop(self) -> u64 {
        let Self { stop, task } = self;
        drop(stop);
        match task.await {
            Ok(sent) => sent,
            Err(e) => {
                tracing::error!(error = %e, "Heartbeat task failed");
                0
            }
        }
    }
}
