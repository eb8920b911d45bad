//! Worker execution engine.
//!
//! Turns queue messages into workflow runs on this machine:
//! - **Parameter files**: a job's arguments written as `key=value` lines
//! - **Execution**: the workflow engine launched as a child process
//! - **Heartbeat**: RUNNING reports while the process is alive
//! - **Worker loop**: dequeue, run, report, ack; one job at a time
//!
//! # Components
//!
//! - [`ParameterFile`]: scoped parameter file, removed on drop
//! - [`ProcessSupervisor`] / [`WorkflowExecutor`]: runs and waits on the engine
//! - [`HeartbeatEmitter`]: periodic liveness publishing
//! - [`Worker`]: the state machine tying them to a [`QueueGateway`](crate::queue::QueueGateway)
//!
//! # Execution Flow
//!
//! 1. [`Worker::run`] binds the shared and per-instance queues
//! 2. A job record is dequeued and its parameter file materialized
//! 3. [`WorkflowExecutor`] runs `<engine> <workflow_path> <parameter_file>`
//!    while the heartbeat publishes RUNNING
//! 4. The heartbeat stops, SUCCESS or FAILED is published, the message acked

pub mod executor;
pub mod heartbeat;
pub mod params;
pub mod runner;

pub use executor::{ExecutionResult, ProcessSupervisor, WorkflowExecutor};
pub use heartbeat::{HeartbeatEmitter, HeartbeatHandle};
pub use params::ParameterFile;
pub use runner::{Worker, WorkerSettings, WorkerState, WorkerSummary, ABORTED_MESSAGE};
