//! Error kinds surfaced by the session, the slot registry and the subsystem
//! initializer.
//!
//! Collaborators (engine, asset fetcher, configuration loading) report
//! `anyhow::Error`s; they are flattened into one of these variants with the
//! full context chain as the reason, so a single error can be cloned and
//! handed to every waiter of a subsystem bring-up.

use crate::subsystems::Subsystem;
use thiserror::Error;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Fetching, parsing or instantiating an effect failed.
    #[error("failed to load effect into slot '{slot}': {reason}")]
    EffectLoadFailed { slot: String, reason: String },

    /// A newer switch or a clear on the same slot preempted this switch.
    #[error("effect switch on slot '{slot}' (generation {generation}) was superseded")]
    EffectSwitchSuperseded { slot: String, generation: u64 },

    #[error("failed to initialize {kind}: {reason}")]
    SubsystemInitFailed { kind: Subsystem, reason: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("engine call failed: {0}")]
    EngineCallFailed(String),

    #[error("session is closed")]
    SessionClosed,
}

impl SessionError {
    pub(crate) fn engine(operation: &str, e: anyhow::Error) -> Self {
        Self::EngineCallFailed(format!("{operation}: {e:#}"))
    }

    /// True for the cancellation signal of a preempted switch.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::EffectSwitchSuperseded { .. })
    }
}
