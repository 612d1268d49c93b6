// src/core/jobs.rs — Run one external job against a session
//
// Output lines go through a single forwarding task, so they land in the
// session log in exactly the order the runner emitted them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::session::{LogStream, SessionId};
use crate::core::store::SessionStore;
use crate::infra::errors::BrokerError;
use crate::runner::{JobKind, JobOutcome, JobRunner, JobSpec, JobStatus};

pub(crate) struct JobRun {
    pub result: Result<JobOutcome, BrokerError>,
    /// The time limit fired and the job was asked to stop.
    pub timed_out: bool,
}

impl JobRun {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(o) if o.succeeded())
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(&self.result, Ok(o) if o.status == JobStatus::Cancelled)
    }

    /// One-line description of a failed run.
    pub fn describe(&self, kind: JobKind, limit: Duration) -> String {
        if self.timed_out {
            return format!("{} timed out after {}s", kind.as_str(), limit.as_secs());
        }
        match &self.result {
            Ok(outcome) => format!("{} {}", kind.as_str(), outcome.summary()),
            Err(e) => format!("{} could not run: {e}", kind.as_str()),
        }
    }
}

/// Build the job description for `kind` from the session's current record.
pub(crate) fn job_spec(
    store: &SessionStore,
    id: &SessionId,
    kind: JobKind,
) -> Result<(JobSpec, CancellationToken), BrokerError> {
    store.inspect(id, |s| -> Result<(JobSpec, CancellationToken), BrokerError> {
        let target = s
            .receiver
            .clone()
            .ok_or_else(|| BrokerError::Job("no receiver recorded for session".into()))?;
        let keypair = s
            .keypair
            .as_ref()
            .ok_or_else(|| BrokerError::Job("session key is no longer available".into()))?;
        let spec = JobSpec {
            kind,
            target,
            source_paths: s.source_paths.clone(),
            destination_path: s.destination_path.clone(),
            public_key: s.public_key.clone(),
            private_key_path: Some(keypair.private_key_path().to_path_buf()),
            work_dir: keypair.dir().to_path_buf(),
        };
        Ok((spec, s.cancel.clone()))
    })?
}

/// Run `spec`, appending its output to `stream`, bounded by `limit`.
///
/// Cancelling `cancel` (or hitting the limit) asks the runner to terminate
/// the job; the runner's own outcome is still awaited.
pub(crate) async fn run_job(
    store: &Arc<SessionStore>,
    runner: &dyn JobRunner,
    id: &SessionId,
    stream: LogStream,
    spec: &JobSpec,
    cancel: &CancellationToken,
    limit: Duration,
) -> JobRun {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let forward_store = store.clone();
    let forward_id = id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if forward_store.append_log(&forward_id, stream, line).is_err() {
                break;
            }
        }
    });

    let job_cancel = cancel.child_token();
    let mut timed_out = false;
    let result = {
        let job = runner.run(spec, tx, job_cancel.clone());
        tokio::pin!(job);
        match tokio::time::timeout(limit, &mut job).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("[{}] {} exceeded {}s, terminating", id.short(), spec.kind.as_str(), limit.as_secs());
                timed_out = true;
                job_cancel.cancel();
                job.await
            }
        }
    };

    // The sender went away with the job future; drain what is left.
    if let Err(e) = forwarder.await {
        tracing::error!("[{}] log forwarder failed: {}", id.short(), e);
    }

    JobRun { result, timed_out }
}
