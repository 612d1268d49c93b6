// src/runner/mod.rs — External job runner seam
//
// The core never shells out directly. It hands a declarative `JobSpec` to a
// `JobRunner`, receives output lines on a channel in emission order, and
// gets a typed `JobOutcome` back. Early termination is requested through the
// cancellation token; a runner must return `JobStatus::Cancelled` promptly
// once it fires.

pub mod ansible;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::session::Receiver;
use crate::infra::errors::BrokerError;

pub use ansible::AnsibleRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    InstallKey,
    Transfer,
    RevokeKey,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::InstallKey => "install-key",
            JobKind::Transfer => "transfer",
            JobKind::RevokeKey => "revoke-key",
        }
    }
}

/// Everything a runner needs to perform one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub target: Receiver,
    pub source_paths: Vec<String>,
    pub destination_path: String,
    pub public_key: String,
    /// Private half of the session key. `None` once local material is gone.
    pub private_key_path: Option<PathBuf>,
    /// Scratch directory the runner may use for job files.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    Failed { exit_code: Option<i32> },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Last non-empty output line, for error summaries.
    pub last_line: Option<String>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// Human-readable one-liner for a failed outcome.
    pub fn summary(&self) -> String {
        let head = match self.status {
            JobStatus::Succeeded => "completed".to_string(),
            JobStatus::Failed {
                exit_code: Some(code),
            } => format!("exited with status {code}"),
            JobStatus::Failed { exit_code: None } => "terminated by signal".to_string(),
            JobStatus::Cancelled => "cancelled".to_string(),
        };
        match &self.last_line {
            Some(line) => format!("{head}: {}", crate::util::excerpt(line, 200)),
            None => head,
        }
    }
}

/// The automation tool that performs privileged operations on our behalf.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Run `job` to completion, forwarding each output line to `output`.
    ///
    /// `Err` means the job could not be run at all (spawn or IO failure);
    /// a job that ran and failed is `Ok` with `JobStatus::Failed`.
    async fn run(
        &self,
        job: &JobSpec,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_includes_last_line() {
        let outcome = JobOutcome {
            status: JobStatus::Failed { exit_code: Some(2) },
            last_line: Some("fatal: [receiver]: UNREACHABLE!".into()),
        };
        assert_eq!(
            outcome.summary(),
            "exited with status 2: fatal: [receiver]: UNREACHABLE!"
        );
        assert!(!outcome.succeeded());
    }

    #[test]
    fn test_summary_without_output() {
        let outcome = JobOutcome {
            status: JobStatus::Failed { exit_code: None },
            last_line: None,
        };
        assert_eq!(outcome.summary(), "terminated by signal");
    }

    #[test]
    fn test_job_kind_names() {
        assert_eq!(JobKind::InstallKey.as_str(), "install-key");
        assert_eq!(
            serde_json::to_string(&JobKind::RevokeKey).unwrap(),
            "\"revoke-key\""
        );
    }
}
