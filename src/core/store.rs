// src/core/store.rs — In-memory session table with per-session locking
//
// The outer map lock is held only long enough to find a session's slot.
// All transitions and log appends for one session serialize on that
// session's own mutex, so different sessions never block each other.
// Entering an outcome state (Succeeded, Failed, Expired) publishes the
// session id on the outcome channel; the CleanupSupervisor listens there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::core::clock::Clock;
use crate::core::keys::KeyMinter;
use crate::core::session::{
    validate_request, LogStream, Session, SessionEvent, SessionId, SessionState, SessionStatus,
};
use crate::infra::errors::{BrokerError, ErrorRecord, FailureKind};

type Slot = Arc<Mutex<Session>>;

pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Slot>>,
    clock: Arc<dyn Clock>,
    consent_window: chrono::Duration,
    retention: chrono::Duration,
    outcomes: mpsc::UnboundedSender<SessionId>,
}

fn lock(slot: &Slot) -> MutexGuard<'_, Session> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionStore {
    /// Build a store and the receiving end of its outcome channel.
    pub fn new(
        clock: Arc<dyn Clock>,
        consent_window: chrono::Duration,
        retention: chrono::Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SessionId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
            consent_window,
            retention,
            outcomes: tx,
        };
        (store, rx)
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Validate, mint a keypair and register a new session in `Created`.
    pub fn create(
        &self,
        source_paths: Vec<String>,
        destination_path: String,
        minter: &KeyMinter,
    ) -> Result<(SessionId, SessionStatus), BrokerError> {
        validate_request(&source_paths, &destination_path)?;

        let id = SessionId::generate()?;
        let keypair = minter.mint()?;
        let session = Session::new(
            id.clone(),
            source_paths,
            destination_path,
            keypair,
            self.clock.now(),
            self.consent_window,
        );
        let status = session.status();

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(Mutex::new(session)));

        tracing::info!("[{}] session created", id.short());
        Ok((id, status))
    }

    fn slot(&self, id: &SessionId) -> Result<Slot, BrokerError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(BrokerError::UnknownSession)
    }

    /// Apply one event. A second caller racing on the same event sees `InvalidTransition`.
    pub fn transition(&self, id: &SessionId, event: SessionEvent) -> Result<SessionState, BrokerError> {
        let slot = self.slot(id)?;
        let mut session = lock(&slot);
        let now = self.clock.now();
        self.expire_if_overdue(&mut session, now);

        let event_name = event.name();
        match session.apply(event, now) {
            Ok(next) => {
                tracing::info!("[{}] {} -> {:?}", id.short(), event_name, next);
                if next.is_outcome() {
                    self.publish_outcome(id);
                }
                Ok(next)
            }
            Err(BrokerError::InvalidTransition { .. })
                if session.outcome == Some(SessionState::Expired) =>
            {
                tracing::debug!("[{}] {} rejected: session expired", id.short(), event_name);
                Err(BrokerError::SessionExpired)
            }
            Err(e) => {
                tracing::debug!("[{}] {} rejected: {}", id.short(), event_name, e);
                Err(e)
            }
        }
    }

    fn expire_if_overdue(&self, session: &mut Session, now: chrono::DateTime<chrono::Utc>) {
        if !session.is_overdue(now) {
            return;
        }
        if session.apply(SessionEvent::Timeout, now).is_ok() {
            tracing::info!("[{}] consent window elapsed -> Expired", session.id.short());
            self.publish_outcome(&session.id);
        }
    }

    fn publish_outcome(&self, id: &SessionId) {
        if self.outcomes.send(id.clone()).is_err() {
            tracing::warn!("[{}] no cleanup supervisor listening", id.short());
        }
    }

    /// Abort a session that has consent, deciding under its lock.
    ///
    /// A session waiting to start fails as Cancelled here. A running
    /// transfer only has its token cancelled; the transfer runner records
    /// the outcome once the job stops. Returns the state abort found.
    pub fn abort(&self, id: &SessionId) -> Result<SessionState, BrokerError> {
        let slot = self.slot(id)?;
        let mut session = lock(&slot);
        let now = self.clock.now();
        self.expire_if_overdue(&mut session, now);

        let found = session.state;
        match found {
            SessionState::KeyInstalled => {
                let record = ErrorRecord::new(FailureKind::Cancelled, "aborted before transfer started");
                session.apply(SessionEvent::Fail(record), now)?;
                session.cancel.cancel();
                tracing::info!("[{}] abort -> Failed", id.short());
                self.publish_outcome(id);
            }
            SessionState::Transferring => {
                session.cancel.cancel();
                tracing::info!("[{}] abort requested, terminating transfer", id.short());
            }
            _ if session.outcome == Some(SessionState::Expired) => {
                return Err(BrokerError::SessionExpired);
            }
            other => {
                return Err(BrokerError::InvalidTransition {
                    from: other,
                    event: "abort",
                })
            }
        }
        Ok(found)
    }

    /// Snapshot for the presentation layer. Expires the session first if it is overdue.
    pub fn status(&self, id: &SessionId) -> Result<SessionStatus, BrokerError> {
        let slot = self.slot(id)?;
        let mut session = lock(&slot);
        self.expire_if_overdue(&mut session, self.clock.now());
        Ok(session.status())
    }

    /// Read from a session under its lock.
    pub fn inspect<T>(&self, id: &SessionId, f: impl FnOnce(&Session) -> T) -> Result<T, BrokerError> {
        let slot = self.slot(id)?;
        let session = lock(&slot);
        Ok(f(&session))
    }

    pub fn append_log(&self, id: &SessionId, stream: LogStream, line: String) -> Result<(), BrokerError> {
        let slot = self.slot(id)?;
        lock(&slot).append_log(stream, line);
        Ok(())
    }

    pub fn set_expected_size(&self, id: &SessionId, bytes: u64) -> Result<(), BrokerError> {
        let slot = self.slot(id)?;
        lock(&slot).expected_size_bytes = Some(bytes);
        Ok(())
    }

    /// Drop local key material. Safe to call any number of times.
    pub fn revoke_key(&self, id: &SessionId, minter: &KeyMinter) -> Result<bool, BrokerError> {
        let slot = self.slot(id)?;
        let mut session = lock(&slot);
        Ok(minter.revoke(&mut session.keypair))
    }

    /// Expire every session whose consent window has elapsed.
    pub fn expire_overdue(&self) -> Vec<SessionId> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for slot in self.slots() {
            let mut session = lock(&slot);
            if session.is_overdue(now) {
                self.expire_if_overdue(&mut session, now);
                expired.push(session.id.clone());
            }
        }
        expired
    }

    /// Forget cleaned-up sessions older than the retention window.
    pub fn evict_retired(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|id, slot| {
            let session = lock(slot);
            let retired = session.state == SessionState::CleanedUp
                && session.cleaned_up_at.is_some_and(|t| t <= cutoff);
            if retired {
                tracing::debug!("[{}] evicted after retention window", id.short());
            }
            !retired
        });
        before - sessions.len()
    }

    fn slots(&self) -> Vec<Slot> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::session::Receiver;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _tmp: tempfile::TempDir,
        clock: Arc<ManualClock>,
        store: Arc<SessionStore>,
        outcomes: mpsc::UnboundedReceiver<SessionId>,
        minter: KeyMinter,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let (store, outcomes) =
            SessionStore::new(clock.clone(), Duration::minutes(15), Duration::hours(1));
        let minter = KeyMinter::new(tmp.path());
        Fixture {
            _tmp: tmp,
            clock,
            store: Arc::new(store),
            outcomes,
            minter,
        }
    }

    fn consent() -> SessionEvent {
        SessionEvent::Consent {
            receiver: Receiver {
                host: "receiver.local".into(),
                user: "ubuntu".into(),
                port: Some(22),
            },
            destination_path: None,
        }
    }

    fn create(f: &Fixture) -> SessionId {
        f.store
            .create(vec!["/data/a.mp4".into()], "/remote/videos".into(), &f.minter)
            .unwrap()
            .0
    }

    #[test]
    fn test_create_rejects_bad_paths_without_minting() {
        let f = fixture();
        let err = f
            .store
            .create(vec!["data/a.mp4".into()], "/remote".into(), &f.minter)
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequest(_)));
        assert!(f.store.is_empty());
        assert_eq!(std::fs::read_dir(f.minter.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_create_holds_one_key() {
        let f = fixture();
        let id = create(&f);
        let status = f.store.status(&id).unwrap();
        assert_eq!(status.state, SessionState::Created);
        assert!(status.key_present);
        assert!(status.public_key.starts_with("ssh-ed25519 "));
        assert_eq!(status.expires_at - status.created_at, Duration::minutes(15));
    }

    #[test]
    fn test_unknown_session() {
        let f = fixture();
        let ghost = SessionId::from("nope");
        assert!(matches!(f.store.status(&ghost), Err(BrokerError::UnknownSession)));
        assert!(matches!(
            f.store.transition(&ghost, SessionEvent::KeyInstalled),
            Err(BrokerError::UnknownSession)
        ));
    }

    #[test]
    fn test_double_consent_rejected() {
        let f = fixture();
        let id = create(&f);
        assert_eq!(
            f.store.transition(&id, consent()).unwrap(),
            SessionState::AwaitingConsent
        );
        assert!(matches!(
            f.store.transition(&id, consent()),
            Err(BrokerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_concurrent_same_event_exactly_once() {
        for _ in 0..20 {
            let f = fixture();
            let id = create(&f);
            f.store.transition(&id, consent()).unwrap();
            f.store.transition(&id, SessionEvent::KeyInstalled).unwrap();

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let store = f.store.clone();
                    let id = id.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        store.transition(&id, SessionEvent::StartTransfer)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let ok = results.iter().filter(|r| r.is_ok()).count();
            let rejected = results
                .iter()
                .filter(|r| matches!(r, Err(BrokerError::InvalidTransition { .. })))
                .count();
            assert_eq!((ok, rejected), (1, 1));
        }
    }

    #[test]
    fn test_outcome_published_once() {
        let mut f = fixture();
        let id = create(&f);
        f.store.transition(&id, consent()).unwrap();
        f.store
            .transition(
                &id,
                SessionEvent::Fail(ErrorRecord::new(FailureKind::KeyInstallFailed, "unreachable")),
            )
            .unwrap();

        assert_eq!(f.outcomes.try_recv().unwrap(), id);
        assert!(f.outcomes.try_recv().is_err());
    }

    #[test]
    fn test_abort_decides_under_lock() {
        let mut f = fixture();
        let id = create(&f);
        assert!(matches!(
            f.store.abort(&id),
            Err(BrokerError::InvalidTransition { from: SessionState::Created, .. })
        ));

        f.store.transition(&id, consent()).unwrap();
        f.store.transition(&id, SessionEvent::KeyInstalled).unwrap();
        assert_eq!(f.store.abort(&id).unwrap(), SessionState::KeyInstalled);

        let status = f.store.status(&id).unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.last_error.unwrap().kind, FailureKind::Cancelled);
        assert!(f.store.inspect(&id, |s| s.cancel.is_cancelled()).unwrap());
        assert_eq!(f.outcomes.try_recv().unwrap(), id);
        // The queued transfer can no longer start.
        assert!(matches!(
            f.store.transition(&id, SessionEvent::StartTransfer),
            Err(BrokerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_abort_running_transfer_only_cancels() {
        let mut f = fixture();
        let id = create(&f);
        f.store.transition(&id, consent()).unwrap();
        f.store.transition(&id, SessionEvent::KeyInstalled).unwrap();
        f.store.transition(&id, SessionEvent::StartTransfer).unwrap();

        assert_eq!(f.store.abort(&id).unwrap(), SessionState::Transferring);
        assert_eq!(f.store.status(&id).unwrap().state, SessionState::Transferring);
        assert!(f.store.inspect(&id, |s| s.cancel.is_cancelled()).unwrap());
        assert!(f.outcomes.try_recv().is_err());
    }

    #[test]
    fn test_lazy_expiry_on_status_and_consent() {
        let mut f = fixture();
        let id = create(&f);
        f.clock.advance(Duration::minutes(16));

        assert!(matches!(
            f.store.transition(&id, consent()),
            Err(BrokerError::SessionExpired)
        ));
        let status = f.store.status(&id).unwrap();
        assert_eq!(status.state, SessionState::Expired);
        assert_eq!(f.outcomes.try_recv().unwrap(), id);
    }

    #[test]
    fn test_sweep_expires_and_evicts() {
        let mut f = fixture();
        let stale = create(&f);
        f.clock.advance(Duration::minutes(10));
        let fresh = create(&f);
        f.clock.advance(Duration::minutes(6));

        assert_eq!(f.store.expire_overdue(), vec![stale.clone()]);
        assert_eq!(f.outcomes.try_recv().unwrap(), stale);
        assert_eq!(f.store.status(&fresh).unwrap().state, SessionState::Created);

        f.store.revoke_key(&stale, &f.minter).unwrap();
        f.store
            .transition(&stale, SessionEvent::Cleanup { warning: None })
            .unwrap();

        // Still queryable inside the retention window.
        f.clock.advance(Duration::minutes(59));
        assert_eq!(f.store.evict_retired(), 0);
        assert_eq!(f.store.status(&stale).unwrap().state, SessionState::CleanedUp);

        f.clock.advance(Duration::minutes(2));
        assert_eq!(f.store.evict_retired(), 1);
        assert!(matches!(f.store.status(&stale), Err(BrokerError::UnknownSession)));
    }

    #[test]
    fn test_logs_append_in_order() {
        let f = fixture();
        let id = create(&f);
        for i in 0..5 {
            f.store
                .append_log(&id, LogStream::Transfer, format!("line {i}"))
                .unwrap();
            let log = f.store.status(&id).unwrap().transfer_log;
            assert_eq!(log.len(), i + 1);
            assert_eq!(log[i], format!("line {i}"));
        }
        let status = f.store.status(&id).unwrap();
        assert!(status.install_log.is_empty());
        assert!(status.cleanup_log.is_empty());
    }

    #[test]
    fn test_revoke_key_idempotent() {
        let f = fixture();
        let id = create(&f);
        assert!(f.store.revoke_key(&id, &f.minter).unwrap());
        assert!(!f.store.revoke_key(&id, &f.minter).unwrap());
        assert!(!f.store.status(&id).unwrap().key_present);
    }
}
