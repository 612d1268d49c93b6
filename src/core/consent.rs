// src/core/consent.rs — Receiver consent and key installation
//
// Consent claims the session (Created -> AwaitingConsent) before any remote
// work, so two receivers racing on one link cannot both proceed. The session
// only advances to KeyInstalled after the install job succeeds; any failure
// lands it in Failed with KeyInstallFailed and no transfer is attempted.

use std::sync::Arc;
use std::time::Duration;

use crate::core::jobs::{job_spec, run_job};
use crate::core::session::{validate_path, LogStream, Receiver, SessionEvent, SessionId};
use crate::core::store::SessionStore;
use crate::infra::errors::{BrokerError, ErrorRecord, FailureKind};
use crate::runner::{JobKind, JobRunner};

pub struct ConsentGateway {
    store: Arc<SessionStore>,
    runner: Arc<dyn JobRunner>,
    timeout: Duration,
    attempts: u32,
}

impl ConsentGateway {
    pub fn new(
        store: Arc<SessionStore>,
        runner: Arc<dyn JobRunner>,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            store,
            runner,
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Accept `id` on behalf of `receiver` and install the session key there.
    pub async fn accept(
        &self,
        id: &SessionId,
        receiver: Receiver,
        destination_path: Option<String>,
    ) -> Result<(), BrokerError> {
        receiver.validate()?;
        if let Some(dest) = &destination_path {
            validate_path("destination", dest)?;
        }

        self.store.transition(
            id,
            SessionEvent::Consent {
                receiver,
                destination_path,
            },
        )?;

        match self.install(id).await {
            Ok(()) => {
                self.store.transition(id, SessionEvent::KeyInstalled)?;
                Ok(())
            }
            Err(BrokerError::KeyInstallFailed(reason)) => {
                tracing::warn!("[{}] key install failed: {}", id.short(), reason);
                let record = ErrorRecord::new(FailureKind::KeyInstallFailed, reason.clone());
                // Expiry may have won the race; either way the session is retired.
                if let Err(e) = self.store.transition(id, SessionEvent::Fail(record)) {
                    tracing::debug!("[{}] not marking failed: {}", id.short(), e);
                }
                Err(BrokerError::KeyInstallFailed(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Run install-key, repeating on failure. Installing the same key twice is harmless.
    async fn install(&self, id: &SessionId) -> Result<(), BrokerError> {
        let (spec, cancel) =
            job_spec(&self.store, id, JobKind::InstallKey).map_err(|e| match e {
                BrokerError::Job(msg) => BrokerError::KeyInstallFailed(msg),
                other => other,
            })?;

        let mut reason = String::new();
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                self.store.append_log(
                    id,
                    LogStream::Install,
                    format!("retrying install-key (attempt {attempt}/{})", self.attempts),
                )?;
            }

            let run = run_job(
                &self.store,
                self.runner.as_ref(),
                id,
                LogStream::Install,
                &spec,
                &cancel,
                self.timeout,
            )
            .await;

            if run.succeeded() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                // Session expired underneath us; the store already retired it.
                return Err(BrokerError::SessionExpired);
            }
            reason = run.describe(JobKind::InstallKey, self.timeout);
        }
        Err(BrokerError::KeyInstallFailed(reason))
    }
}
