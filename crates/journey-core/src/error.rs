//! Error kinds surfaced to engine callers
//!
//! Every failed mutation leaves the store in its pre-call state, so callers
//! can act on the kind alone:
//! - `Conflict` and `Transient` may be retried after re-reading
//! - `Forbidden` and `PreconditionFailed` need a different actor or input
//! - `Invalid` and `NotFound` indicate a caller bug or stale reference

use journey_playbook::PlaybookError;

/// Message carried by every optimistic-lock failure on node state
pub const STATE_CONFLICT: &str = "node state changed by another process";

/// Engine error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JourneyError {
    /// Referenced instance, attachment, slot or node does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Role-based denial or unlinked advisor
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Optimistic-lock mismatch on state or revision
    #[error("conflict: {0}")]
    Conflict(String),

    /// Required slot missing or review target not pending
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Unknown state, malformed payload or playbook integrity failure
    #[error("invalid: {0}")]
    Invalid(String),

    /// Underlying storage failure
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// The caller's cancellation token fired before commit
    #[error("operation cancelled")]
    Cancelled,
}

impl JourneyError {
    /// Lost an optimistic-lock race on node state
    #[must_use]
    pub fn state_conflict() -> Self {
        Self::Conflict(STATE_CONFLICT.to_string())
    }

    #[must_use]
    pub fn missing_slot(slot_key: &str) -> Self {
        Self::PreconditionFailed(format!("required file for slot '{slot_key}' is missing"))
    }

    /// Whether retrying the same call may succeed without changes
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Invalid(_) => "invalid",
            Self::Transient(_) => "transient",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<PlaybookError> for JourneyError {
    fn from(err: PlaybookError) -> Self {
        Self::Invalid(err.to_string())
    }
}

impl From<serde_json::Error> for JourneyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Invalid(format!("malformed payload: {err}"))
    }
}

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, JourneyError>;
