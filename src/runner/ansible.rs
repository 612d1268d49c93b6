// src/runner/ansible.rs — JobRunner backed by ansible-playbook
//
// Each job gets its own directory holding an inventory and a YAML vars
// file. stdout and stderr are merged into one pipe, read line by line on a
// blocking thread and forwarded in emission order. Cancellation kills the
// child process.

use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{JobKind, JobOutcome, JobRunner, JobSpec, JobStatus};
use crate::infra::config::RunnerConfig;
use crate::infra::errors::BrokerError;

pub struct AnsibleRunner {
    program: String,
    playbooks_dir: PathBuf,
    bootstrap_identity: Option<PathBuf>,
    host_key_checking: bool,
}

/// Extra vars handed to every playbook.
#[derive(Debug, Serialize)]
struct JobVars<'a> {
    source_paths: &'a [String],
    destination_path: &'a str,
    receiver_user: &'a str,
    public_key: &'a str,
}

impl AnsibleRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            program: config.program.clone(),
            playbooks_dir: config.playbooks_dir.clone(),
            bootstrap_identity: config.bootstrap_identity.clone(),
            host_key_checking: config.host_key_checking,
        }
    }

    pub fn playbook(&self, kind: JobKind) -> PathBuf {
        let file = match kind {
            JobKind::InstallKey => "install_key.yml",
            JobKind::Transfer => "transfer.yml",
            JobKind::RevokeKey => "revoke_key.yml",
        };
        self.playbooks_dir.join(file)
    }

    /// Identity ssh should use for this job.
    ///
    /// Installing the key has to reach the receiver some other way; once the
    /// key is trusted, transfer and revoke authenticate with it.
    fn identity<'a>(&'a self, job: &'a JobSpec) -> Result<Option<&'a Path>, BrokerError> {
        match job.kind {
            JobKind::InstallKey => Ok(self.bootstrap_identity.as_deref()),
            JobKind::Transfer | JobKind::RevokeKey => job
                .private_key_path
                .as_deref()
                .map(Some)
                .ok_or_else(|| BrokerError::Job("session key is no longer available".into())),
        }
    }

    async fn prepare(&self, job: &JobSpec) -> Result<(PathBuf, PathBuf, PathBuf), BrokerError> {
        let job_dir = job.work_dir.join(format!(
            "{}-{}",
            job.kind.as_str(),
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&job_dir).await?;

        let inventory = job_dir.join("inventory.ini");
        tokio::fs::write(&inventory, render_inventory(job, self.identity(job)?)).await?;

        let vars = job_dir.join("vars.yml");
        tokio::fs::write(&vars, render_vars(job)?).await?;

        Ok((job_dir, inventory, vars))
    }
}

/// INI inventory with a single `receiver` host in group `target`.
fn render_inventory(job: &JobSpec, identity: Option<&Path>) -> String {
    let mut line = format!(
        "receiver ansible_host={} ansible_user={}",
        job.target.host, job.target.user
    );
    if let Some(port) = job.target.port {
        line.push_str(&format!(" ansible_port={port}"));
    }
    if let Some(key) = identity {
        line.push_str(&format!(" ansible_ssh_private_key_file=\"{}\"", key.display()));
    }
    format!("[target]\n{line}\n")
}

fn render_vars(job: &JobSpec) -> Result<String, BrokerError> {
    let vars = JobVars {
        source_paths: &job.source_paths,
        destination_path: &job.destination_path,
        receiver_user: &job.target.user,
        public_key: &job.public_key,
    };
    serde_yml::to_string(&vars).map_err(|e| BrokerError::Job(format!("failed to write vars: {e}")))
}

#[async_trait]
impl JobRunner for AnsibleRunner {
    fn name(&self) -> &str {
        "ansible"
    }

    async fn run(
        &self,
        job: &JobSpec,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, BrokerError> {
        let (job_dir, inventory, vars) = self.prepare(job).await?;
        let result = self.execute(job, &inventory, &vars, output, cancel).await;

        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            tracing::debug!("Could not remove job dir {:?}: {}", job_dir, e);
        }
        result
    }
}

impl AnsibleRunner {
    async fn execute(
        &self,
        job: &JobSpec,
        inventory: &Path,
        vars: &Path,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, BrokerError> {
        let playbook = self.playbook(job.kind);
        tracing::debug!("Running: {} {:?} for {}", self.program, playbook, job.kind.as_str());

        // stdout and stderr share one pipe so lines keep their emission order.
        let (reader, writer) = std::io::pipe()?;
        let mut command = Command::new(&self.program);
        command
            .arg("-i")
            .arg(inventory)
            .arg(&playbook)
            .arg("--extra-vars")
            .arg(format!("@{}", vars.display()))
            .env("ANSIBLE_NOCOLOR", "1")
            .env(
                "ANSIBLE_HOST_KEY_CHECKING",
                if self.host_key_checking { "True" } else { "False" },
            )
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);
        let spawned = command.spawn();
        // Our copies of the write end must close or the pipe never reaches EOF.
        drop(command);
        let mut child =
            spawned.map_err(|e| BrokerError::Job(format!("failed to start {}: {e}", self.program)))?;

        let (line_tx, mut lines) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || pump_lines(reader, line_tx));
        let mut last_line = None;
        let mut cancelled = false;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                line = lines.recv() => line,
            };
            let Some(line) = line else { break };
            tracing::trace!("{}> {}", job.kind.as_str(), line);
            if !line.trim().is_empty() {
                last_line = Some(line.clone());
            }
            let _ = output.send(line);
        }

        let status = if cancelled {
            stop(&mut child).await;
            JobStatus::Cancelled
        } else {
            tokio::select! {
                exit = child.wait() => {
                    let exit = exit?;
                    if exit.success() {
                        JobStatus::Succeeded
                    } else {
                        JobStatus::Failed { exit_code: exit.code() }
                    }
                }
                _ = cancel.cancelled() => {
                    stop(&mut child).await;
                    JobStatus::Cancelled
                }
            }
        };

        Ok(JobOutcome { status, last_line })
    }
}

/// Forward each line of `reader` until EOF.
///
/// Bytes that are not UTF-8, such as Latin-1 file names from rsync, are
/// replaced rather than ending the stream.
fn pump_lines(reader: impl Read, lines: mpsc::UnboundedSender<String>) {
    let mut reader = std::io::BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                // Keep draining after the receiver is gone so the child never
                // blocks on a full pipe.
                let _ = lines.send(line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("Job output stream closed: {}", e);
                break;
            }
        }
    }
}

/// Kill the child and reap it.
async fn stop(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Job already exited: {}", e);
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Receiver;

    fn job(kind: JobKind, work_dir: &Path) -> JobSpec {
        JobSpec {
            kind,
            target: Receiver {
                host: "10.0.0.7".into(),
                user: "ubuntu".into(),
                port: Some(2222),
            },
            source_paths: vec!["/data/a.mp4".into(), "/data/b".into()],
            destination_path: "/remote/videos".into(),
            public_key: "ssh-ed25519 AAAAC3Nz handoff-ephemeral".into(),
            private_key_path: Some(work_dir.join("id_ed25519")),
            work_dir: work_dir.to_path_buf(),
        }
    }

    fn runner_with(program: &str) -> AnsibleRunner {
        AnsibleRunner::new(&RunnerConfig {
            program: program.into(),
            ..RunnerConfig::default()
        })
    }

    #[test]
    fn test_render_inventory() {
        let spec = job(JobKind::Transfer, Path::new("/tmp/s1"));
        let inv = render_inventory(&spec, Some(Path::new("/tmp/s1/id_ed25519")));
        assert_eq!(
            inv,
            "[target]\nreceiver ansible_host=10.0.0.7 ansible_user=ubuntu ansible_port=2222 \
             ansible_ssh_private_key_file=\"/tmp/s1/id_ed25519\"\n"
        );
    }

    #[test]
    fn test_render_inventory_without_identity() {
        let mut spec = job(JobKind::InstallKey, Path::new("/tmp/s1"));
        spec.target.port = None;
        let inv = render_inventory(&spec, None);
        assert_eq!(inv, "[target]\nreceiver ansible_host=10.0.0.7 ansible_user=ubuntu\n");
    }

    #[test]
    fn test_render_vars() {
        let spec = job(JobKind::Transfer, Path::new("/tmp/s1"));
        let yaml = render_vars(&spec).unwrap();
        let parsed: serde_json::Value = serde_yml::from_str(&yaml).unwrap();
        assert_eq!(parsed["source_paths"][1], "/data/b");
        assert_eq!(parsed["destination_path"], "/remote/videos");
        assert_eq!(parsed["receiver_user"], "ubuntu");
        assert_eq!(parsed["public_key"], "ssh-ed25519 AAAAC3Nz handoff-ephemeral");
    }

    #[test]
    fn test_transfer_requires_session_key() {
        let runner = runner_with("ansible-playbook");
        let mut spec = job(JobKind::RevokeKey, Path::new("/tmp/s1"));
        spec.private_key_path = None;
        assert!(matches!(runner.identity(&spec), Err(BrokerError::Job(_))));

        let install = job(JobKind::InstallKey, Path::new("/tmp/s1"));
        assert_eq!(runner.identity(&install).unwrap(), None);
    }

    #[test]
    fn test_playbook_paths() {
        let runner = runner_with("ansible-playbook");
        assert_eq!(
            runner.playbook(JobKind::RevokeKey),
            PathBuf::from("playbooks/revoke_key.yml")
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_job_error() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with("/nonexistent/ansible-playbook");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = runner
            .run(&job(JobKind::Transfer, tmp.path()), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Job(_)));
        // Job directory is removed even on failure.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    fn fake_playbook(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ansible");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_output_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let program = fake_playbook(
            bin.path(),
            "echo 'PLAY [target]'\necho 'TASK [copy]'\necho 'oops' >&2\nexit 3",
        );
        let runner = runner_with(program.to_str().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = runner
            .run(&job(JobKind::Transfer, tmp.path()), tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, JobStatus::Failed { exit_code: Some(3) });
        assert_eq!(outcome.last_line.as_deref(), Some("oops"));
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["PLAY [target]", "TASK [copy]", "oops"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        // Latin-1 file name, then enough output to fill a pipe nobody drains.
        let program = fake_playbook(
            bin.path(),
            "echo before\nprintf 'caf\\351.mp4\\n'\necho after\n\
             i=0\nwhile [ $i -lt 4000 ]; do echo \"sent $i of 4000 chunks to receiver\"; i=$((i+1)); done\n\
             exit 0",
        );
        let runner = runner_with(program.to_str().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            runner.run(&job(JobKind::Transfer, tmp.path()), tx, CancellationToken::new()),
        )
        .await
        .expect("job wedged on its output pipe")
        .unwrap();

        assert_eq!(outcome.status, JobStatus::Succeeded);
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines[..3], ["before", "caf\u{FFFD}.mp4", "after"]);
        assert_eq!(lines.len(), 4003);
        assert_eq!(lines.last().map(String::as_str), Some("sent 3999 of 4000 chunks to receiver"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_job() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let program = fake_playbook(bin.path(), "echo started\nexec sleep 30");
        let runner = runner_with(program.to_str().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = runner
            .run(&job(JobKind::Transfer, tmp.path()), tx, cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(rx.recv().await.as_deref(), Some("started"));
    }
}
