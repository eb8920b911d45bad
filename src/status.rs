use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Message published on the results queue describing where a job stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_uuid: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
}

impl StatusReport {
    fn base(job: &JobRecord, instance_id: &str, status: JobStatus) -> Self {
        Self {
            job_uuid: job.uuid().to_string(),
            status,
            exit_code: None,
            message: None,
            timestamp: Utc::now(),
            instance_id: Some(instance_id.to_string()),
            workflow_name: job.workflow_name.clone(),
            elapsed_secs: None,
        }
    }

    /// Heartbeat for a job that is still executing.
    pub fn running(job: &JobRecord, instance_id: &str, elapsed_secs: f64) -> Self {
        Self {
            elapsed_secs: Some(elapsed_secs),
            ..Self::base(job, instance_id, JobStatus::Running)
        }
    }

    pub fn success(job: &JobRecord, instance_id: &str) -> Self {
        Self {
            exit_code: Some(0),
            ..Self::base(job, instance_id, JobStatus::Success)
        }
    }

    pub fn failed(
        job: &JobRecord,
        instance_id: &str,
        exit_code: Option<i32>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            exit_code,
            message: Some(message.into()),
            ..Self::base(job, instance_id, JobStatus::Failed)
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
