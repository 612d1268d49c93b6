// src/core/transfer.rs — Run the copy for a KeyInstalled session

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use walkdir::WalkDir;

use crate::core::jobs::{job_spec, run_job, JobRun};
use crate::core::session::{LogStream, SessionEvent, SessionId, SessionState};
use crate::core::store::SessionStore;
use crate::infra::errors::{BrokerError, ErrorRecord, FailureKind};
use crate::runner::{JobKind, JobRunner};

/// Executes the transfer job under a time limit and records the result.
pub struct TransferRunner {
    store: Arc<SessionStore>,
    runner: Arc<dyn JobRunner>,
    timeout: Duration,
}

impl TransferRunner {
    pub fn new(store: Arc<SessionStore>, runner: Arc<dyn JobRunner>, timeout: Duration) -> Self {
        Self {
            store,
            runner,
            timeout,
        }
    }

    /// Move the session into Transferring, copy, then record Succeeded or Failed.
    ///
    /// Only a session in KeyInstalled can start; anything else is rejected
    /// with `InvalidTransition` and no job runs.
    pub async fn run(&self, id: &SessionId) -> Result<SessionState, BrokerError> {
        self.store.transition(id, SessionEvent::StartTransfer)?;

        let (spec, cancel) = match job_spec(&self.store, id, JobKind::Transfer) {
            Ok(v) => v,
            Err(e) => return self.fail(id, BrokerError::TransferFailed(e.to_string())),
        };

        let sources = spec.source_paths.clone();
        match tokio::task::spawn_blocking(move || expected_size(&sources)).await {
            Ok(bytes) => self.store.set_expected_size(id, bytes)?,
            Err(e) => tracing::debug!("[{}] size scan failed: {}", id.short(), e),
        }

        tracing::info!("[{}] transfer started ({} source path(s))", id.short(), spec.source_paths.len());
        let run = run_job(
            &self.store,
            self.runner.as_ref(),
            id,
            LogStream::Transfer,
            &spec,
            &cancel,
            self.timeout,
        )
        .await;

        self.record(id, run)
    }

    fn record(&self, id: &SessionId, run: JobRun) -> Result<SessionState, BrokerError> {
        if run.succeeded() {
            tracing::info!("[{}] transfer completed", id.short());
            return self.store.transition(id, SessionEvent::Succeed);
        }

        let err = if run.timed_out {
            BrokerError::TransferTimeout {
                secs: self.timeout.as_secs(),
            }
        } else if run.was_cancelled() {
            BrokerError::Cancelled
        } else {
            match &run.result {
                Ok(outcome) => BrokerError::TransferFailed(outcome.summary()),
                Err(e) => BrokerError::TransferFailed(format!("could not run: {e}")),
            }
        };
        self.fail(id, err)
    }

    fn fail(&self, id: &SessionId, err: BrokerError) -> Result<SessionState, BrokerError> {
        tracing::warn!("[{}] {}", id.short(), err);
        let record = err
            .to_record()
            .unwrap_or_else(|| ErrorRecord::new(FailureKind::TransferFailed, err.to_string()));
        self.store.transition(id, SessionEvent::Fail(record))
    }
}

/// Total size in bytes of regular files under `paths`. Unreadable entries are skipped.
pub fn expected_size(paths: &[String]) -> u64 {
    paths
        .iter()
        .flat_map(|p| WalkDir::new(Path::new(p)).follow_links(false))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_size_walks_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("clips");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.mp4"), vec![0u8; 100]).unwrap();
        std::fs::write(nested.join("b.mp4"), vec![0u8; 23]).unwrap();
        let single = tmp.path().join("notes.txt");
        std::fs::write(&single, b"hello").unwrap();

        let paths = vec![
            nested.to_string_lossy().to_string(),
            single.to_string_lossy().to_string(),
        ];
        assert_eq!(expected_size(&paths), 128);
    }

    #[test]
    fn test_expected_size_missing_path_is_zero() {
        assert_eq!(expected_size(&["/definitely/not/here".to_string()]), 0);
    }
}
