// src/core/session.rs — Session record and its state machine
//
// `Session::apply` is the only place a state changes. Callers hold the
// per-session lock from `SessionStore` while applying, which is what makes a
// transition exactly-once.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::keys::Keypair;
use crate::infra::errors::{BrokerError, ErrorRecord};

/// Bytes of entropy in a session id.
const ID_BYTES: usize = 32;

/// Opaque, unguessable session token. Doubles as the capability in the share link.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Result<Self, BrokerError> {
        let mut bytes = [0u8; ID_BYTES];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| anyhow::anyhow!("OS random source unavailable: {e}"))?;
        Ok(Self(URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix safe to put in logs.
    pub fn short(&self) -> &str {
        crate::util::truncate_str(&self.0, 8)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({}…)", self.short())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    AwaitingConsent,
    KeyInstalled,
    Transferring,
    Succeeded,
    Failed,
    CleanedUp,
    Expired,
}

impl SessionState {
    /// A terminal outcome that still needs cleanup.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Expired
        )
    }

    /// States in which the session's keypair must exist.
    pub fn holds_key(&self) -> bool {
        matches!(
            self,
            SessionState::Created
                | SessionState::AwaitingConsent
                | SessionState::KeyInstalled
                | SessionState::Transferring
        )
    }

    /// States the consent window applies to.
    pub fn can_expire(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::AwaitingConsent)
    }
}

/// Where the receiver can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receiver {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Receiver {
    /// Host and user end up in an inventory file, so only plain names pass.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let host_ok = !self.host.is_empty()
            && self
                .host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'))
            && !self.host.starts_with('-');
        if !host_ok {
            return Err(BrokerError::InvalidRequest(format!(
                "invalid receiver host '{}'",
                self.host
            )));
        }

        let user_ok = !self.user.is_empty()
            && self
                .user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            && !self.user.starts_with('-');
        if !user_ok {
            return Err(BrokerError::InvalidRequest(format!(
                "invalid receiver user '{}'",
                self.user
            )));
        }

        if self.port == Some(0) {
            return Err(BrokerError::InvalidRequest("receiver port cannot be 0".into()));
        }
        Ok(())
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Consent {
        receiver: Receiver,
        destination_path: Option<String>,
    },
    KeyInstalled,
    StartTransfer,
    Succeed,
    Fail(ErrorRecord),
    Timeout,
    Cleanup { warning: Option<String> },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Consent { .. } => "consent",
            SessionEvent::KeyInstalled => "keyInstalled",
            SessionEvent::StartTransfer => "startTransfer",
            SessionEvent::Succeed => "succeed",
            SessionEvent::Fail(_) => "fail",
            SessionEvent::Timeout => "timeout",
            SessionEvent::Cleanup { .. } => "cleanup",
        }
    }
}

/// The transition table. `None` means the event is illegal from `from`.
pub fn next_state(from: SessionState, event: &SessionEvent) -> Option<SessionState> {
    use SessionState::*;
    match (from, event) {
        (Created, SessionEvent::Consent { .. }) => Some(AwaitingConsent),
        (AwaitingConsent, SessionEvent::KeyInstalled) => Some(KeyInstalled),
        (KeyInstalled, SessionEvent::StartTransfer) => Some(Transferring),
        (Transferring, SessionEvent::Succeed) => Some(Succeeded),
        (AwaitingConsent | KeyInstalled | Transferring, SessionEvent::Fail(_)) => Some(Failed),
        (Created | AwaitingConsent, SessionEvent::Timeout) => Some(Expired),
        (Succeeded | Failed | Expired, SessionEvent::Cleanup { .. }) => Some(CleanedUp),
        _ => None,
    }
}

/// Validate a create request. Runs before anything is minted or stored.
pub fn validate_request(source_paths: &[String], destination_path: &str) -> Result<(), BrokerError> {
    if source_paths.is_empty() {
        return Err(BrokerError::InvalidRequest(
            "at least one source path is required".into(),
        ));
    }
    for path in source_paths {
        validate_path("source", path)?;
    }
    validate_path("destination", destination_path)
}

pub(crate) fn validate_path(role: &str, path: &str) -> Result<(), BrokerError> {
    if path.trim().is_empty() {
        return Err(BrokerError::InvalidRequest(format!("{role} path is empty")));
    }
    if path.contains(['\0', '\n', '\r']) {
        return Err(BrokerError::InvalidRequest(format!(
            "{role} path contains control characters"
        )));
    }
    if !Path::new(path).is_absolute() {
        return Err(BrokerError::InvalidRequest(format!(
            "{role} path '{path}' is not absolute"
        )));
    }
    Ok(())
}

/// Which append-only log a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Install,
    Transfer,
    Cleanup,
}

pub struct Session {
    pub id: SessionId,
    pub source_paths: Vec<String>,
    pub destination_path: String,
    pub state: SessionState,
    pub keypair: Option<Keypair>,
    pub public_key: String,
    pub fingerprint: String,
    pub receiver: Option<Receiver>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cleaned_up_at: Option<DateTime<Utc>>,
    /// The outcome state that preceded `CleanedUp`.
    pub outcome: Option<SessionState>,
    pub expected_size_bytes: Option<u64>,
    transfer_log: Vec<String>,
    install_log: Vec<String>,
    cleanup_log: Vec<String>,
    pub last_error: Option<ErrorRecord>,
    pub cleanup_warning: Option<String>,
    /// Cancelled on abort and on expiry; jobs for this session watch it.
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(
        id: SessionId,
        source_paths: Vec<String>,
        destination_path: String,
        keypair: Keypair,
        created_at: DateTime<Utc>,
        consent_window: chrono::Duration,
    ) -> Self {
        Self {
            id,
            source_paths,
            destination_path,
            state: SessionState::Created,
            public_key: keypair.public_key().to_string(),
            fingerprint: keypair.fingerprint().to_string(),
            keypair: Some(keypair),
            receiver: None,
            created_at,
            expires_at: created_at + consent_window,
            started_at: None,
            finished_at: None,
            cleaned_up_at: None,
            outcome: None,
            expected_size_bytes: None,
            transfer_log: Vec::new(),
            install_log: Vec::new(),
            cleanup_log: Vec::new(),
            last_error: None,
            cleanup_warning: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Apply `event` at time `now`, or reject it without touching the session.
    pub fn apply(&mut self, event: SessionEvent, now: DateTime<Utc>) -> Result<SessionState, BrokerError> {
        let next = next_state(self.state, &event).ok_or(BrokerError::InvalidTransition {
            from: self.state,
            event: event.name(),
        })?;

        match event {
            SessionEvent::Consent {
                receiver,
                destination_path,
            } => {
                self.receiver = Some(receiver);
                if let Some(dest) = destination_path {
                    self.destination_path = dest;
                }
            }
            SessionEvent::StartTransfer => self.started_at = Some(now),
            SessionEvent::Fail(record) => self.last_error = Some(record),
            SessionEvent::Timeout => self.cancel.cancel(),
            SessionEvent::Cleanup { warning } => {
                self.cleanup_warning = warning;
                self.cleaned_up_at = Some(now);
            }
            SessionEvent::KeyInstalled | SessionEvent::Succeed => {}
        }

        if next.is_outcome() {
            self.outcome = Some(next);
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(next)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state.can_expire() && now >= self.expires_at
    }

    /// Append a line. Logs only ever grow.
    pub fn append_log(&mut self, stream: LogStream, line: String) {
        match stream {
            LogStream::Install => self.install_log.push(line),
            LogStream::Transfer => self.transfer_log.push(line),
            LogStream::Cleanup => self.cleanup_log.push(line),
        }
    }

    pub fn transfer_log(&self) -> &[String] {
        &self.transfer_log
    }

    pub fn install_log(&self) -> &[String] {
        &self.install_log
    }

    pub fn cleanup_log(&self) -> &[String] {
        &self.cleanup_log
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            outcome: self.outcome,
            source_paths: self.source_paths.clone(),
            destination_path: self.destination_path.clone(),
            receiver: self.receiver.clone(),
            public_key: self.public_key.clone(),
            fingerprint: self.fingerprint.clone(),
            key_present: self.keypair.is_some(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            expected_size_bytes: self.expected_size_bytes,
            transfer_log: self.transfer_log.clone(),
            install_log: self.install_log.clone(),
            cleanup_log: self.cleanup_log.clone(),
            last_error: self.last_error.clone(),
            cleanup_warning: self.cleanup_warning.clone(),
        }
    }
}

/// Read-only view of a session, as returned to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub outcome: Option<SessionState>,
    pub source_paths: Vec<String>,
    pub destination_path: String,
    pub receiver: Option<Receiver>,
    pub public_key: String,
    pub fingerprint: String,
    pub key_present: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expected_size_bytes: Option<u64>,
    pub transfer_log: Vec<String>,
    pub install_log: Vec<String>,
    pub cleanup_log: Vec<String>,
    pub last_error: Option<ErrorRecord>,
    pub cleanup_warning: Option<String>,
}
