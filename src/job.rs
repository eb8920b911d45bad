use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// One unit of work as produced by the dispatcher.
///
/// The wire form is a JSON object. Absent fields are omitted rather than sent
/// as `null`, and `state` never leaves the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "JobRecordWire")]
pub struct JobRecord {
    #[serde(rename = "job_uuid")]
    uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_hash: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, String>,
    #[serde(skip)]
    pub state: Option<String>,
}

/// Lenient input shape: every field may be missing or `null`.
#[derive(Deserialize)]
struct JobRecordWire {
    job_uuid: Option<String>,
    workflow_name: Option<String>,
    workflow_version: Option<String>,
    workflow_path: Option<String>,
    job_hash: Option<String>,
    arguments: Option<BTreeMap<String, String>>,
}

impl TryFrom<JobRecordWire> for JobRecord {
    type Error = JobError;

    fn try_from(wire: JobRecordWire) -> Result<Self, Self::Error> {
        let uuid = match wire.job_uuid {
            Some(uuid) if uuid.trim().is_empty() => {
                return Err(JobError::Malformed("job_uuid is empty".to_string()))
            }
            Some(uuid) => uuid,
            None => new_job_uuid(),
        };
        Ok(Self {
            uuid,
            workflow_name: wire.workflow_name,
            workflow_version: wire.workflow_version,
            workflow_path: wire.workflow_path,
            job_hash: wire.job_hash,
            arguments: wire.arguments.unwrap_or_default(),
            state: None,
        })
    }
}

fn new_job_uuid() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            uuid: new_job_uuid(),
            workflow_name: None,
            workflow_version: None,
            workflow_path: None,
            job_hash: None,
            arguments: BTreeMap::new(),
            state: None,
        }
    }
}

impl PartialEq for JobRecord {
    // `state` is a local annotation and does not take part in identity.
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
            && self.workflow_name == other.workflow_name
            && self.workflow_version == other.workflow_version
            && self.workflow_path == other.workflow_path
            && self.job_hash == other.job_hash
            && self.arguments == other.arguments
    }
}

impl Eq for JobRecord {}

impl JobRecord {
    pub fn new(
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
        job_hash: impl Into<String>,
        arguments: BTreeMap<String, String>,
    ) -> Self {
        Self {
            workflow_name: Some(workflow_name.into()),
            workflow_version: Some(workflow_version.into()),
            job_hash: Some(job_hash.into()),
            arguments,
            ..Default::default()
        }
    }

    /// Build a record with a caller-chosen identifier. Returns `None` for an
    /// empty id, which could never be correlated with a status report.
    pub fn with_uuid(uuid: impl Into<String>) -> Option<Self> {
        let uuid = uuid.into();
        if uuid.trim().is_empty() {
            return None;
        }
        Some(Self {
            uuid,
            ..Default::default()
        })
    }

    pub fn with_workflow_path(mut self, path: impl Into<String>) -> Self {
        self.workflow_path = Some(path.into());
        self
    }

    pub fn with_workflow(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.workflow_name = Some(name.into());
        self.workflow_version = Some(version.into());
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, JobError> {
        serde_json::from_slice(bytes).map_err(|e| JobError::Malformed(e.to_string()))
    }
}
