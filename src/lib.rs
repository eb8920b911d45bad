pub mod backoff;
pub mod config;
pub mod error;
pub mod job;
pub mod queue;
pub mod shutdown;
pub mod status;
pub mod worker;
