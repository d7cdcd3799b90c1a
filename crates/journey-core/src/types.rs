//! Core domain types for the journey engine
//!
//! Defines:
//! - Identifiers (ULID for engine-owned records, UUID for external ones)
//! - Node, attachment and review state enums
//! - Actor roles
//! - Stored records (instances, revisions, slots, attachments, outcomes)

use crate::error::JourneyError;
use chrono::{DateTime, Utc};
use journey_playbook::{Multiplicity, NodeId, PlaybookVersionId, TenantId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Ulid);

        impl $name {
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// Node instance identifier
    InstanceId
);
ulid_id!(
    /// Upload slot identifier
    SlotId
);
ulid_id!(
    /// Attachment identifier; ULIDs sort by creation millisecond
    AttachmentId
);
ulid_id!(
    /// Audit event identifier
    EventId
);

/// User identifier issued by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Document version in the external document registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentVersionId(pub Uuid);

impl DocumentVersionId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentVersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocumentVersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    Submitted,
    UnderReview,
    NeedsFixes,
    Done,
    Skipped,
}

impl NodeState {
    pub const ALL: [Self; 6] = [
        Self::Active,
        Self::Submitted,
        Self::UnderReview,
        Self::NeedsFixes,
        Self::Done,
        Self::Skipped,
    ];

    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::NeedsFixes => "needs_fixes",
            Self::Done => "done",
            Self::Skipped => "skipped",
        }
    }

    /// Done or skipped
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }

    /// Waiting on a reviewer or on student fixes
    #[inline]
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Submitted | Self::UnderReview | Self::NeedsFixes)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = JourneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JourneyError::Invalid(format!("unknown state '{s}'")))
    }
}

/// Requested target of a state patch
///
/// `approved_with_comments` is a review disposition rather than a stored
/// state: it lands the node in `done` and records an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetState {
    Node(NodeState),
    ApprovedWithComments,
}

impl TargetState {
    pub const APPROVED_WITH_COMMENTS: &'static str = "approved_with_comments";

    /// Stored node state this target lands in
    #[inline]
    #[must_use]
    pub fn resolved(self) -> NodeState {
        match self {
            Self::Node(state) => state,
            Self::ApprovedWithComments => NodeState::Done,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node(state) => state.as_str(),
            Self::ApprovedWithComments => Self::APPROVED_WITH_COMMENTS,
        }
    }
}

impl From<NodeState> for TargetState {
    fn from(state: NodeState) -> Self {
        Self::Node(state)
    }
}

impl FromStr for TargetState {
    type Err = JourneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::APPROVED_WITH_COMMENTS {
            return Ok(Self::ApprovedWithComments);
        }
        s.parse().map(Self::Node)
    }
}

impl TryFrom<String> for TargetState {
    type Error = JourneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetState> for String {
    fn from(target: TargetState) -> Self {
        target.as_str().to_string()
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actor role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Advisor,
    Admin,
    Superadmin,
}

impl Role {
    pub const ALL: [Self; 4] = [Self::Student, Self::Advisor, Self::Admin, Self::Superadmin];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Advisor => "advisor",
            Self::Admin => "admin",
            Self::Superadmin => "superadmin",
        }
    }

    /// Admin or superadmin
    #[inline]
    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::Superadmin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = JourneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| JourneyError::Invalid(format!("unknown role '{s}'")))
    }
}

/// Authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    #[inline]
    #[must_use]
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    #[must_use]
    pub fn student(id: UserId) -> Self {
        Self::new(id, Role::Student)
    }

    #[must_use]
    pub fn advisor(id: UserId) -> Self {
        Self::new(id, Role::Advisor)
    }

    #[must_use]
    pub fn admin(id: UserId) -> Self {
        Self::new(id, Role::Admin)
    }
}

/// Attachment review status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Submitted,
    UnderReview,
    Approved,
    ApprovedWithComments,
    Rejected,
}

impl AttachmentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::ApprovedWithComments => "approved_with_comments",
            Self::Rejected => "rejected",
        }
    }

    #[inline]
    #[must_use]
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved | Self::ApprovedWithComments)
    }
}

impl std::fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer decision on one attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ApprovedWithComments,
    Rejected,
    /// Return the attachment to the review queue
    Submitted,
}

impl From<ReviewDecision> for AttachmentStatus {
    fn from(decision: ReviewDecision) -> Self {
        match decision {
            ReviewDecision::Approved => Self::Approved,
            ReviewDecision::ApprovedWithComments => Self::ApprovedWithComments,
            ReviewDecision::Rejected => Self::Rejected,
            ReviewDecision::Submitted => Self::Submitted,
        }
    }
}

impl FromStr for ReviewDecision {
    type Err = JourneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "approved_with_comments" => Ok(Self::ApprovedWithComments),
            "rejected" => Ok(Self::Rejected),
            "submitted" => Ok(Self::Submitted),
            other => Err(JourneyError::Invalid(format!("unknown decision '{other}'"))),
        }
    }
}

/// A student's stateful occurrence of a node under one playbook version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub instance_id: InstanceId,
    pub tenant_id: TenantId,
    pub student_id: UserId,
    pub node_id: NodeId,
    pub playbook_version_id: PlaybookVersionId,
    pub state: NodeState,
    /// Latest stored form revision; 0 when none exists
    pub current_rev: u32,
    pub locale: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-lock token, bumped on every state or form write
    pub version: u64,
}

/// Uniqueness key of a node instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub student_id: UserId,
    pub node_id: NodeId,
    pub playbook_version_id: PlaybookVersionId,
}

impl NodeInstance {
    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            student_id: self.student_id,
            node_id: self.node_id.clone(),
            playbook_version_id: self.playbook_version_id,
        }
    }
}

/// Snapshot of a form body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormRevision {
    pub instance_id: InstanceId,
    pub rev: u32,
    pub payload: serde_json::Value,
    pub edited_by: UserId,
    pub edited_at: DateTime<Utc>,
}

/// Typed file placeholder materialized from an upload requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub slot_id: SlotId,
    pub instance_id: InstanceId,
    pub slot_key: String,
    pub required: bool,
    pub multiplicity: Multiplicity,
    pub accepted_mime: Vec<String>,
}

/// Student upload bound to a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: AttachmentId,
    pub slot_id: SlotId,
    pub instance_id: InstanceId,
    pub document_version_id: DocumentVersionId,
    pub filename: String,
    pub size_bytes: u64,
    pub mime: Option<String>,
    pub status: AttachmentStatus,
    pub review_note: Option<String>,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Reviewer's marked-up copy
    pub reviewed_version_id: Option<DocumentVersionId>,
    pub attached_by: UserId,
    pub attached_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Attachment {
    /// Ordering key for "most recently reviewed or created"
    #[must_use]
    pub fn recency(&self) -> (DateTime<Utc>, AttachmentId) {
        (
            self.reviewed_at.unwrap_or(self.attached_at),
            self.attachment_id,
        )
    }
}

/// Per-node disposition record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub instance_id: InstanceId,
    pub value: String,
    pub decided_by: UserId,
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Denormalized latest state for fast listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionRow {
    pub tenant_id: TenantId,
    pub student_id: UserId,
    pub node_id: NodeId,
    pub state: NodeState,
    pub updated_at: DateTime<Utc>,
}
