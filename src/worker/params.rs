use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::WorkerError;
use crate::job::JobRecord;

/// On-disk `key=value` parameter file for one workflow attempt.
///
/// The file is removed when the guard is dropped, so every exit path of the
/// attempt cleans up after itself.
#[derive(Debug)]
pub struct ParameterFile {
    path: PathBuf,
}

impl ParameterFile {
    /// Write `job.arguments` into a freshly named file under `scratch_dir`.
    ///
    /// Lines are sorted by key. The file is synced to disk before returning.
    pub fn materialize(scratch_dir: &Path, job: &JobRecord) -> Result<Self, WorkerError> {
        fs::create_dir_all(scratch_dir).map_err(|e| {
            WorkerError::Infrastructure(format!(
                "cannot create scratch directory {}: {}",
                scratch_dir.display(),
                e
            ))
        })?;

        let path = scratch_dir.join(file_name(job));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                WorkerError::Infrastructure(format!("cannot create {}: {}", path.display(), e))
            })?;
        // Owned by the guard from here on, so a failed write still cleans up.
        let guard = Self { path };

        let mut contents = String::new();
        for (key, value) in &job.arguments {
            contents.push_str(key);
            contents.push('=');
            contents.push_str(value);
            contents.push('\n');
        }
        file.write_all(contents.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                WorkerError::Infrastructure(format!("cannot write {}: {}", guard.path.display(), e))
            })?;

        tracing::debug!(
            job_uuid = %job.uuid(),
            path = %guard.path.display(),
            entries = job.arguments.len(),
            "Materialized parameter file"
        );
        Ok(guard)
    }

    /// Runs [`materialize`](Self::materialize) on the blocking pool.
    pub async fn prepare(scratch_dir: &Path, job: &JobRecord) -> Result<Self, WorkerError> {
        let scratch_dir = scratch_dir.to_path_buf();
        let job = job.clone();
        tokio::task::spawn_blocking(move || Self::materialize(&scratch_dir, &job))
            .await
            .map_err(|e| {
                WorkerError::Infrastructure(format!("parameter file task failed: {}", e))
            })?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ParameterFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed parameter file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove parameter file"
            ),
        }
    }
}

fn file_name(job: &JobRecord) -> String {
    let prefix: String = job
        .workflow_name
        .as_deref()
        .unwrap_or("job")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}_{}.ini", prefix, Uuid::new_v4().simple())
}
