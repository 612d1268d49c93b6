// src/core/broker.rs — Entry point for the presentation layer
//
// The API and CLI talk only to `Broker`; none of them touch the store
// directly. The broker wires the store, minter, consent gateway, transfer
// runner and cleanup supervisor together and owns the background tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::core::cleanup::CleanupSupervisor;
use crate::core::clock::Clock;
use crate::core::consent::ConsentGateway;
use crate::core::keys::KeyMinter;
use crate::core::session::{Receiver, SessionEvent, SessionId, SessionStatus};
use crate::core::store::SessionStore;
use crate::core::transfer::TransferRunner;
use crate::infra::config::Config;
use crate::infra::errors::{BrokerError, ErrorRecord, FailureKind};
use crate::runner::JobRunner;

/// Knobs the broker needs, extracted from `Config`.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub consent_window: chrono::Duration,
    pub retention: chrono::Duration,
    pub transfer_timeout: Duration,
    pub install_timeout: Duration,
    pub revoke_timeout: Duration,
    pub key_job_attempts: u32,
    pub work_dir: PathBuf,
    pub public_url: String,
}

impl BrokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            consent_window: config.session.consent_window(),
            retention: config.session.retention(),
            transfer_timeout: config.transfer.timeout(),
            install_timeout: config.runner.install_timeout(),
            revoke_timeout: config.runner.revoke_timeout(),
            key_job_attempts: config.runner.attempts(),
            work_dir: config.runner.work_dir(),
            public_url: config.server.public_url.clone(),
        }
    }
}

/// Result of creating a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_id: String,
    pub share_link: String,
    pub public_key: String,
    pub fingerprint: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// What a receiver supplies when opening the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Overrides the destination chosen by the sender.
    #[serde(default)]
    pub destination_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

pub struct Broker {
    store: Arc<SessionStore>,
    minter: Arc<KeyMinter>,
    consent: ConsentGateway,
    transfer: Arc<TransferRunner>,
    public_url: String,
    _cleanup_task: JoinHandle<()>,
}

impl Broker {
    /// Build the broker and start the cleanup supervisor. Must run inside a tokio runtime.
    pub fn start(settings: BrokerSettings, runner: Arc<dyn JobRunner>, clock: Arc<dyn Clock>) -> Self {
        let (store, outcomes) = SessionStore::new(clock, settings.consent_window, settings.retention);
        let store = Arc::new(store);
        let minter = Arc::new(KeyMinter::new(settings.work_dir.clone()));

        let consent = ConsentGateway::new(
            store.clone(),
            runner.clone(),
            settings.install_timeout,
            settings.key_job_attempts,
        );
        let transfer = Arc::new(TransferRunner::new(
            store.clone(),
            runner.clone(),
            settings.transfer_timeout,
        ));
        let cleanup = Arc::new(CleanupSupervisor::new(
            store.clone(),
            runner.clone(),
            minter.clone(),
            settings.revoke_timeout,
            settings.key_job_attempts,
        ));
        let cleanup_task = cleanup.clone().spawn(outcomes);

        tracing::info!(
            "Broker started (runner: {}, work dir: {})",
            runner.name(),
            settings.work_dir.display()
        );

        Self {
            store,
            minter,
            consent,
            transfer,
            public_url: settings.public_url.trim_end_matches('/').to_string(),
            _cleanup_task: cleanup_task,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn share_link(&self, id: &SessionId) -> String {
        format!("{}/api/v1/sessions/{}/accept", self.public_url, id.as_str())
    }

    pub fn create_session(
        &self,
        source_paths: Vec<String>,
        destination_path: String,
    ) -> Result<CreatedSession, BrokerError> {
        let (id, status) = self.store.create(source_paths, destination_path, &self.minter)?;
        Ok(CreatedSession {
            share_link: self.share_link(&id),
            session_id: id.as_str().to_string(),
            public_key: status.public_key,
            fingerprint: status.fingerprint,
            expires_at: status.expires_at,
        })
    }

    pub fn status(&self, id: &SessionId) -> Result<SessionStatus, BrokerError> {
        self.store.status(id)
    }

    /// Consent, install the key, then start the transfer in the background.
    ///
    /// Returns once the key is installed; the transfer's progress is visible
    /// through `status`.
    pub async fn accept(&self, id: &SessionId, request: AcceptRequest) -> Result<SessionStatus, BrokerError> {
        let receiver = Receiver {
            host: request.host,
            user: request.user,
            port: request.port,
        };
        self.consent.accept(id, receiver, request.destination_path).await?;
        self.spawn_transfer(id.clone());
        self.store.status(id)
    }

    fn spawn_transfer(&self, id: SessionId) -> JoinHandle<()> {
        let transfer = self.transfer.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let task_id = id.clone();
            let task = tokio::spawn(async move { transfer.run(&task_id).await });
            match task.await {
                Ok(Ok(state)) => tracing::debug!("[{}] transfer finished in {:?}", id.short(), state),
                Ok(Err(e)) => tracing::warn!("[{}] transfer not run: {}", id.short(), e),
                Err(e) => {
                    tracing::error!("[{}] transfer task crashed: {}", id.short(), e);
                    let record =
                        ErrorRecord::new(FailureKind::TransferFailed, format!("transfer task crashed: {e}"));
                    if let Err(e) = store.transition(&id, SessionEvent::Fail(record)) {
                        tracing::debug!("[{}] crash not recorded: {}", id.short(), e);
                    }
                }
            }
        })
    }

    /// Stop a session that has a key installed.
    ///
    /// A running transfer is terminated and recorded as Cancelled by the
    /// transfer runner. A session that has not started yet fails here.
    pub fn abort(&self, id: &SessionId) -> Result<SessionStatus, BrokerError> {
        self.store.abort(id)?;
        self.store.status(id)
    }

    /// Expire overdue sessions and forget retired ones.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            expired: self.store.expire_overdue().len(),
            evicted: self.store.evict_retired(),
        };
        if report != SweepReport::default() {
            tracing::info!("Sweep: {} expired, {} evicted", report.expired, report.evicted);
        }
        report
    }

    /// Run `sweep` every `interval` until the task is dropped.
    pub fn run_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}
