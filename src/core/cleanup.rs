// src/core/cleanup.rs — Credential teardown after every outcome
//
// Listens on the store's outcome channel. Each retired session gets one
// cleanup pass: revoke the key on the receiver (best effort), destroy the
// local key material (always), then mark the session CleanedUp.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::jobs::{job_spec, run_job};
use crate::core::keys::KeyMinter;
use crate::core::session::{LogStream, SessionEvent, SessionId, SessionState};
use crate::core::store::SessionStore;
use crate::infra::errors::BrokerError;
use crate::runner::{JobKind, JobRunner};

pub struct CleanupSupervisor {
    store: Arc<SessionStore>,
    runner: Arc<dyn JobRunner>,
    minter: Arc<KeyMinter>,
    timeout: Duration,
    attempts: u32,
}

impl CleanupSupervisor {
    pub fn new(
        store: Arc<SessionStore>,
        runner: Arc<dyn JobRunner>,
        minter: Arc<KeyMinter>,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            store,
            runner,
            minter,
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Consume outcome notifications until the channel closes.
    pub fn spawn(self: Arc<Self>, mut outcomes: mpsc::UnboundedReceiver<SessionId>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(id) = outcomes.recv().await {
                let supervisor = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = supervisor.cleanup(&id).await {
                        tracing::error!("[{}] cleanup failed: {}", id.short(), e);
                    }
                });
            }
            tracing::debug!("cleanup supervisor stopped");
        })
    }

    /// Tear down one retired session. Ends in CleanedUp even if remote revocation fails.
    pub async fn cleanup(&self, id: &SessionId) -> Result<SessionState, BrokerError> {
        let had_receiver = self.store.inspect(id, |s| s.receiver.is_some())?;

        let warning = if had_receiver {
            self.revoke_remote(id).await
        } else {
            self.store.append_log(
                id,
                LogStream::Cleanup,
                "no receiver accepted; nothing to revoke remotely".to_string(),
            )?;
            None
        };

        if self.store.revoke_key(id, &self.minter)? {
            self.store
                .append_log(id, LogStream::Cleanup, "local key material destroyed".to_string())?;
        }

        let state = self.store.transition(id, SessionEvent::Cleanup { warning })?;
        tracing::info!("[{}] cleaned up", id.short());
        Ok(state)
    }

    /// Remove the session key from the receiver. Returns a warning on failure.
    async fn revoke_remote(&self, id: &SessionId) -> Option<String> {
        let spec = match job_spec(&self.store, id, JobKind::RevokeKey) {
            Ok((spec, _)) => spec,
            Err(e) => return Some(self.warn(id, format!("revoke-key skipped: {e}"))),
        };

        // The session token may already be cancelled (expiry, abort); revocation must still run.
        let cancel = CancellationToken::new();
        let mut reason = String::new();
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                let _ = self.store.append_log(
                    id,
                    LogStream::Cleanup,
                    format!("retrying revoke-key (attempt {attempt}/{})", self.attempts),
                );
            }
            let run = run_job(
                &self.store,
                self.runner.as_ref(),
                id,
                LogStream::Cleanup,
                &spec,
                &cancel,
                self.timeout,
            )
            .await;
            if run.succeeded() {
                return None;
            }
            reason = run.describe(JobKind::RevokeKey, self.timeout);
        }
        let err = BrokerError::CleanupFailed(format!("key may remain authorized on receiver: {reason}"));
        Some(self.warn(id, err.to_string()))
    }

    fn warn(&self, id: &SessionId, message: String) -> String {
        tracing::warn!("[{}] {}", id.short(), message);
        let _ = self
            .store
            .append_log(id, LogStream::Cleanup, format!("WARNING: {message}"));
        message
    }
}
