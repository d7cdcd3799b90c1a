//! Request and response shapes of the engine facade
//!
//! Plain serde structs so a transport layer can expose them unchanged.

use crate::collab::StudentRecord;
use crate::types::{
    Actor, AttachmentId, AttachmentStatus, DocumentVersionId, InstanceId, NodeState, Outcome,
    ReviewDecision, SlotId, TargetState, UserId,
};
use chrono::{DateTime, Utc};
use journey_playbook::{Multiplicity, NodeId, TenantId, WorldId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionView {
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub state: NodeState,
    pub version: u64,
    pub locale: Option<String>,
    pub form: FormView,
    pub slots: Vec<SlotView>,
    pub outcomes: Vec<Outcome>,
}

/// Latest form body; `rev` 0 with a null payload when nothing was saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormView {
    pub rev: u32,
    pub payload: serde_json::Value,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub slot_id: SlotId,
    pub slot_key: String,
    pub required: bool,
    pub multiplicity: Multiplicity,
    pub accepted_mime: Vec<String>,
    /// Active attachments only
    pub attachments: Vec<AttachmentView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentView {
    pub attachment_id: AttachmentId,
    pub document_version_id: DocumentVersionId,
    pub status: AttachmentStatus,
    pub filename: String,
    pub size: u64,
    pub review_note: Option<String>,
    pub reviewed_version_id: Option<DocumentVersionId>,
    pub attached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutSubmission {
    pub tenant: TenantId,
    pub student: UserId,
    pub actor: Actor,
    pub node: NodeId,
    pub locale: Option<String>,
    /// Fail with `Conflict` unless the stored revision still equals this
    pub expected_rev: Option<u32>,
    pub payload: serde_json::Value,
    /// State to move to once the revision is stored; the current state is a
    /// no-op
    #[serde(default)]
    pub state: Option<TargetState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionSaved {
    pub new_rev: u32,
    pub state: NodeState,
    /// Successors created when the requested state triggered activation
    pub activated: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchState {
    pub tenant: TenantId,
    pub student: UserId,
    pub actor: Actor,
    pub node: NodeId,
    pub target: TargetState,
    /// Optimistic-lock token; defaults to the version read before the write
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePatched {
    pub new_state: NodeState,
    pub version: u64,
    /// Successors created by activation in the same transaction
    pub activated: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRequest {
    pub slot_id: SlotId,
    pub document_version_id: DocumentVersionId,
    pub filename: String,
    pub size_bytes: u64,
    pub mime: Option<String>,
    pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub attachment_id: AttachmentId,
    pub decision: ReviewDecision,
    pub note: Option<String>,
    pub actor: Actor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub attachment_status: AttachmentStatus,
    pub node_state: NodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewedDocumentUploaded {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRow {
    pub student: UserId,
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
    pub current_stage: Option<WorldId>,
}

/// Student selection for monitor views
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorFilter {
    pub tenant: TenantId,
    /// Case-insensitive substring of name or email
    pub query: Option<String>,
    pub program: Option<String>,
    pub department: Option<String>,
    pub cohort: Option<String>,
    pub advisor_id: Option<UserId>,
    #[serde(default)]
    pub rp_required_only: bool,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl MonitorFilter {
    #[must_use]
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            query: None,
            program: None,
            department: None,
            cohort: None,
            advisor_id: None,
            rp_required_only: false,
            limit: None,
            offset: 0,
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    #[must_use]
    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    #[must_use]
    pub fn with_cohort(mut self, cohort: impl Into<String>) -> Self {
        self.cohort = Some(cohort.into());
        self
    }

    #[must_use]
    pub fn with_advisor(mut self, advisor: UserId) -> Self {
        self.advisor_id = Some(advisor);
        self
    }

    #[must_use]
    pub fn rp_required_only(mut self) -> Self {
        self.rp_required_only = true;
        self
    }

    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Whether a student passes every criterion except paging
    #[must_use]
    pub fn matches(&self, record: &StudentRecord, advisors: &[UserId]) -> bool {
        let query_ok = self.query.as_deref().map_or(true, |q| {
            let q = q.trim().to_lowercase();
            q.is_empty()
                || record.name.to_lowercase().contains(&q)
                || record.email.to_lowercase().contains(&q)
        });
        let eq = |wanted: &Option<String>, actual: &Option<String>| {
            wanted.as_ref().map_or(true, |w| actual.as_ref() == Some(w))
        };
        query_ok
            && eq(&self.program, &record.program)
            && eq(&self.department, &record.department)
            && eq(&self.cohort, &record.cohort)
            && self.advisor_id.map_or(true, |a| advisors.contains(&a))
            && (!self.rp_required_only || record.rp_required)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRow {
    pub student: StudentRecord,
    pub advisors: Vec<UserId>,
    pub done_count: usize,
    pub total: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub overall_pct: f64,
    pub current_stage: Option<WorldId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub students: usize,
    pub rp_required_count: usize,
    pub antiplag_done_count: usize,
    pub antiplag_done_pct: f64,
    pub bottleneck_node: Option<NodeId>,
    pub bottleneck_count: usize,
    /// World whose completion times feed `stage_median_days`
    pub median_world: Option<WorldId>,
    #[serde(alias = "w2_median_days")]
    pub stage_median_days: f64,
}

/// Attachment counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentTally {
    pub total: usize,
    pub submitted: usize,
    pub under_review: usize,
    pub approved: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyNodeView {
    pub node_id: NodeId,
    pub world: Option<WorldId>,
    pub title: String,
    pub state: NodeState,
    pub updated_at: DateTime<Utc>,
    pub attachments: AttachmentTally,
}

/// One attachment of a node, superseded uploads included
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFileView {
    pub slot_key: String,
    pub attachment_id: AttachmentId,
    pub document_version_id: DocumentVersionId,
    pub filename: String,
    pub size_bytes: u64,
    pub mime: Option<String>,
    pub status: AttachmentStatus,
    pub is_active: bool,
    pub attached_by: UserId,
    pub attached_at: DateTime<Utc>,
    pub review_note: Option<String>,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_version_id: Option<DocumentVersionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreboardEntry {
    pub student: UserId,
    pub name: String,
    pub score: u32,
    /// 1-based; students without points rank after everyone listed
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scoreboard {
    #[serde(rename = "top_5")]
    pub top: Vec<ScoreboardEntry>,
    /// Integer mean over ranked students
    pub average_score: u32,
    pub me: ScoreboardEntry,
    /// Students with at least one scoring node
    pub total_users: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionMismatch {
    pub student: UserId,
    pub node: NodeId,
    /// `None` when the row is missing, which reads as `active`
    pub projected: Option<NodeState>,
    /// `None` when no instance backs the row
    pub actual: Option<NodeState>,
}

/// Reconciliation of the projection against node instances
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionReport {
    pub checked: usize,
    pub mismatches: Vec<ProjectionMismatch>,
}

impl ProjectionReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_on_every_criterion() {
        let tenant = TenantId::new();
        let advisor = UserId::new();
        let record = StudentRecord::new(UserId::new(), "Dana Sarsen", "dana@uni.kz")
            .with_program("PhD CS")
            .with_cohort("2024")
            .with_rp_required(true);

        assert!(MonitorFilter::new(tenant).matches(&record, &[]));
        assert!(MonitorFilter::new(tenant).with_query("SARS").matches(&record, &[]));
        assert!(!MonitorFilter::new(tenant).with_query("zz").matches(&record, &[]));
        assert!(MonitorFilter::new(tenant).with_program("PhD CS").matches(&record, &[]));
        assert!(!MonitorFilter::new(tenant).with_department("Math").matches(&record, &[]));
        assert!(MonitorFilter::new(tenant).with_advisor(advisor).matches(&record, &[advisor]));
        assert!(!MonitorFilter::new(tenant).with_advisor(advisor).matches(&record, &[]));
        assert!(MonitorFilter::new(tenant).rp_required_only().matches(&record, &[]));
    }
}
