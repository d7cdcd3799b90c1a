//! Append-only, hash-chained audit log per node instance
//!
//! Each event stores the hash of its predecessor, so rewriting history
//! breaks the chain. Timestamps never go backwards within one instance: an
//! event stamped earlier than its predecessor takes the predecessor's time.

use crate::error::{JourneyError, Result};
use crate::types::{EventId, InstanceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Opened,
    SubmissionSaved,
    StateChanged,
    /// State copied from a peer instance under another playbook version
    StateSynced,
    AttachmentAdded,
    AttachmentReviewed,
    ReviewedDocumentUploaded,
    Activated,
    Reset,
    OutcomeRecorded,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::SubmissionSaved => "submission_saved",
            Self::StateChanged => "state_changed",
            Self::StateSynced => "state_synced",
            Self::AttachmentAdded => "attachment_added",
            Self::AttachmentReviewed => "attachment_reviewed",
            Self::ReviewedDocumentUploaded => "reviewed_document_uploaded",
            Self::Activated => "activated",
            Self::Reset => "reset",
            Self::OutcomeRecorded => "outcome_recorded",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub instance_id: InstanceId,
    pub event_type: EventType,
    pub actor_id: Option<UserId>,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl Event {
    /// Lowercase hex of the record hash
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Build the next event of a chain whose last record is `last`
pub(crate) fn chain_event(
    last: Option<&Event>,
    instance_id: InstanceId,
    event_type: EventType,
    actor_id: Option<UserId>,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) -> Event {
    let (prev_hash, at) = match last {
        Some(prev) => (prev.hash, now.max(prev.at)),
        None => ([0u8; 32], now),
    };
    let mut event = Event {
        event_id: EventId::new(),
        instance_id,
        event_type,
        actor_id,
        payload,
        at,
        prev_hash,
        hash: [0u8; 32],
    };
    event.hash = compute_hash(&event);
    event
}

/// Verify linkage, hashes and timestamp order; returns the number of events
pub fn verify_chain(events: &[Event]) -> Result<usize> {
    let mut prev_hash = [0u8; 32];
    let mut prev_at: Option<DateTime<Utc>> = None;
    for (index, event) in events.iter().enumerate() {
        if event.prev_hash != prev_hash || event.hash != compute_hash(event) {
            return Err(JourneyError::Invalid(format!(
                "event chain broken at index {index} (event {})",
                event.hash_hex()
            )));
        }
        if prev_at.is_some_and(|at| event.at < at) {
            return Err(JourneyError::Invalid(format!(
                "event timestamps regress at index {index}"
            )));
        }
        prev_hash = event.hash;
        prev_at = Some(event.at);
    }
    Ok(events.len())
}

fn compute_hash(event: &Event) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(event.event_id.0.to_bytes());
    hasher.update(event.instance_id.0.to_bytes());
    hasher.update(event.event_type.as_str().as_bytes());
    hasher.update([0]);
    if let Some(actor) = event.actor_id {
        hasher.update(actor.0.as_bytes());
    }
    hasher.update([0]);
    hasher.update(event.payload.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(event.at.timestamp_micros().to_le_bytes());
    hasher.update(event.prev_hash);
    hasher.finalize().into()
}
