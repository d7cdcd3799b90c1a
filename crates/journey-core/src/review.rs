//! Attachment review workflow
//!
//! A review decision updates one attachment, then the node state is
//! recomputed from the most recently reviewed-or-created active attachment
//! and moved there through the transition table. Everything, including
//! activation when the node lands in `done`, commits as one unit.

use crate::activation::activate_successors;
use crate::api::{ReviewOutcome, ReviewRequest, ReviewedDocumentUploaded};
use crate::audit::EventType;
use crate::engine::{triggers_activation, JourneyEngine};
use crate::error::{JourneyError, Result};
use crate::lifecycle::{transition, Transition};
use crate::notify::{review_message, review_title, Notification, NotificationKind, Recipient};
use crate::transitions::{check_transition, validate_transition};
use crate::types::{
    Actor, Attachment, AttachmentId, AttachmentStatus, DocumentVersionId, NodeInstance, NodeState,
    Role, TargetState,
};
use serde_json::json;

/// Node state implied by the latest active attachment
///
/// Latest means greatest `(reviewed_at or attached_at, attachment_id)`, so
/// reviews stamped in the same instant fall back to upload order.
pub fn derive_state<'a>(
    attachments: impl IntoIterator<Item = &'a Attachment>,
) -> Option<NodeState> {
    attachments
        .into_iter()
        .filter(|a| a.is_active)
        .max_by_key(|a| a.recency())
        .map(|latest| match latest.status {
            AttachmentStatus::Approved | AttachmentStatus::ApprovedWithComments => NodeState::Done,
            AttachmentStatus::Rejected => NodeState::NeedsFixes,
            AttachmentStatus::Submitted => NodeState::UnderReview,
            AttachmentStatus::UnderReview => NodeState::Submitted,
        })
}

/// States to pass through to get from `from` to `to` as `role`: directly
/// when the table allows it, otherwise via `under_review`
pub fn route(from: NodeState, to: NodeState, role: Role) -> Result<Vec<NodeState>> {
    if check_transition(from, to.into(), role) {
        return Ok(vec![to]);
    }
    let via = NodeState::UnderReview;
    if from != via
        && to != via
        && check_transition(from, via.into(), role)
        && check_transition(via, to.into(), role)
    {
        return Ok(vec![via, to]);
    }
    validate_transition(from, to.into(), role).map(|()| vec![to])
}

impl JourneyEngine {
    fn reviewable(
        &self,
        attachment_id: AttachmentId,
        actor: Actor,
    ) -> Result<(Attachment, NodeInstance)> {
        let tables = self.snapshot();
        let attachment = tables
            .attachment(attachment_id)
            .cloned()
            .ok_or_else(|| JourneyError::NotFound(format!("attachment {attachment_id}")))?;
        let instance = tables.require_instance(attachment.instance_id)?.clone();
        self.authorize_reviewer(instance.tenant_id, instance.student_id, actor)?;
        Ok((attachment, instance))
    }

    /// Record a review decision and move the node accordingly
    pub fn review_attachment(&self, request: ReviewRequest) -> Result<ReviewOutcome> {
        let ReviewRequest {
            attachment_id,
            decision,
            note,
            actor,
        } = request;
        let (attachment, instance) = self.reviewable(attachment_id, actor)?;
        if !attachment.is_active {
            return Err(JourneyError::PreconditionFailed(
                "attachment was superseded by a newer upload".to_string(),
            ));
        }
        if instance.state == NodeState::Skipped {
            return Err(JourneyError::PreconditionFailed(format!(
                "node '{}' is skipped",
                instance.node_id
            )));
        }
        let active = self.active_playbook(instance.tenant_id)?;
        let config = &self.inner.config;
        let status = AttachmentStatus::from(decision);
        let note = note.filter(|n| !n.trim().is_empty());

        let outcome = self.run("review_attachment", |tx| {
            let mut node = tx.require_instance(instance.instance_id)?.clone();
            if node.version != instance.version {
                return Err(JourneyError::state_conflict());
            }
            let mut reviewed = tx
                .attachment(attachment_id)
                .filter(|a| a.is_active)
                .cloned()
                .ok_or_else(|| {
                    JourneyError::PreconditionFailed("attachment is no longer active".to_string())
                })?;

            if node.state == NodeState::Submitted {
                node = transition(
                    tx,
                    Transition {
                        instance_id: node.instance_id,
                        expected_version: node.version,
                        target: TargetState::Node(NodeState::UnderReview),
                        actor,
                    },
                )?;
            }

            let now = tx.now();
            reviewed.status = status;
            reviewed.review_note.clone_from(&note);
            reviewed.reviewed_by = Some(actor.id);
            reviewed.reviewed_at = Some(now);
            tx.put_attachment(reviewed.clone());
            tx.append_event(
                node.instance_id,
                EventType::AttachmentReviewed,
                Some(actor.id),
                json!({
                    "attachment_id": attachment_id,
                    "status": status,
                    "note": note,
                    "filename": reviewed.filename,
                }),
                now,
            );

            let derived = derive_state(tx.attachments_of_instance(node.instance_id));
            let before = node.state;
            if let Some(target) = derived.filter(|d| *d != node.state) {
                for step in route(node.state, target, actor.role)? {
                    node = transition(
                        tx,
                        Transition {
                            instance_id: node.instance_id,
                            expected_version: node.version,
                            target: TargetState::Node(step),
                            actor,
                        },
                    )?;
                }
            }
            if node.state != before && triggers_activation(config, node.state) {
                activate_successors(tx, &active, &node, config, Some(actor.id))?;
            }

            tx.notify(Notification {
                tenant_id: node.tenant_id,
                recipient: Recipient::User(node.student_id),
                kind: NotificationKind::DocumentReviewed,
                title: review_title(&reviewed.filename),
                message: review_message(decision, note.as_deref()),
                student_id: node.student_id,
                node_id: node.node_id.clone(),
                created_at: now,
            });

            Ok(ReviewOutcome {
                attachment_status: status,
                node_state: node.state,
            })
        })?;

        tracing::info!(
            attachment = %attachment_id,
            instance = %instance.instance_id,
            status = %outcome.attachment_status,
            node_state = %outcome.node_state,
            "attachment reviewed"
        );
        Ok(outcome)
    }

    /// Bind a reviewer's marked-up copy to an attachment without changing
    /// its status
    pub fn upload_reviewed_document(
        &self,
        attachment_id: AttachmentId,
        reviewed_document: DocumentVersionId,
        actor: Actor,
    ) -> Result<ReviewedDocumentUploaded> {
        let (_, instance) = self.reviewable(attachment_id, actor)?;
        if !self
            .inner
            .documents
            .exists(instance.tenant_id, reviewed_document)
        {
            return Err(JourneyError::NotFound(format!(
                "document version {reviewed_document}"
            )));
        }
        let at = self.run("upload_reviewed_document", |tx| {
            let mut attachment = tx
                .attachment(attachment_id)
                .cloned()
                .ok_or_else(|| JourneyError::NotFound(format!("attachment {attachment_id}")))?;
            attachment.reviewed_version_id = Some(reviewed_document);
            tx.put_attachment(attachment);
            let now = tx.now();
            let event = tx.append_event(
                instance.instance_id,
                EventType::ReviewedDocumentUploaded,
                Some(actor.id),
                json!({
                    "attachment_id": attachment_id,
                    "reviewed_version_id": reviewed_document,
                }),
                now,
            );
            Ok(event.at)
        })?;
        Ok(ReviewedDocumentUploaded { at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentVersionId, InstanceId, SlotId, UserId};
    use chrono::{Duration, Utc};

    fn attachment(status: AttachmentStatus, offset_secs: i64, active: bool) -> Attachment {
        let t0 = Utc::now();
        Attachment {
            attachment_id: AttachmentId::new(),
            slot_id: SlotId::new(),
            instance_id: InstanceId::new(),
            document_version_id: DocumentVersionId::new(),
            filename: "f.pdf".into(),
            size_bytes: 10,
            mime: None,
            status,
            review_note: None,
            reviewed_by: None,
            reviewed_at: Some(t0 + Duration::seconds(offset_secs)),
            reviewed_version_id: None,
            attached_by: UserId::new(),
            attached_at: t0,
            is_active: active,
        }
    }

    #[test]
    fn latest_attachment_decides() {
        let list = [
            attachment(AttachmentStatus::Approved, 10, true),
            attachment(AttachmentStatus::Rejected, 20, true),
        ];
        assert_eq!(derive_state(&list), Some(NodeState::NeedsFixes));
    }

    #[test]
    fn inactive_attachments_are_ignored() {
        let list = [
            attachment(AttachmentStatus::Approved, 10, true),
            attachment(AttachmentStatus::Rejected, 20, false),
        ];
        assert_eq!(derive_state(&list), Some(NodeState::Done));
        assert_eq!(derive_state(&[] as &[Attachment]), None);
    }

    #[test]
    fn status_mapping() {
        let state = |s| derive_state(&[attachment(s, 0, true)]);
        assert_eq!(state(AttachmentStatus::ApprovedWithComments), Some(NodeState::Done));
        assert_eq!(state(AttachmentStatus::Submitted), Some(NodeState::UnderReview));
        assert_eq!(state(AttachmentStatus::UnderReview), Some(NodeState::Submitted));
    }

    #[test]
    fn route_goes_through_under_review_when_needed() {
        assert_eq!(
            route(NodeState::Active, NodeState::Done, Role::Advisor).unwrap(),
            vec![NodeState::UnderReview, NodeState::Done]
        );
        assert_eq!(
            route(NodeState::Done, NodeState::NeedsFixes, Role::Advisor).unwrap(),
            vec![NodeState::NeedsFixes]
        );
        assert!(route(NodeState::Skipped, NodeState::Done, Role::Advisor).is_err());
    }
}
