// src/core/mod.rs — Transfer-session lifecycle and credential broker

pub mod broker;
pub mod cleanup;
pub mod clock;
pub mod consent;
mod jobs;
pub mod keys;
pub mod session;
pub mod store;
pub mod transfer;

pub use broker::{AcceptRequest, Broker, BrokerSettings, CreatedSession, SweepReport};
pub use session::{SessionId, SessionState, SessionStatus};
