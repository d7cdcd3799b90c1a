//! Form revisions and file slots
//!
//! Revisions are append-only and numbered from 1; `current_rev` 0 means no
//! revision exists. Attachments are immutable apart from their review
//! fields and the `is_active` flag flipped when a single-file slot gets a
//! newer upload.

use crate::api::{
    AttachRequest, AttachmentView, FormView, NodeFileView, PutSubmission, SlotView,
    SubmissionSaved, SubmissionView,
};
use crate::audit::EventType;
use crate::engine::JourneyEngine;
use crate::error::{JourneyError, Result};
use crate::lifecycle::PatchPlan;
use crate::store::Tables;
use crate::types::{
    Actor, Attachment, AttachmentId, AttachmentStatus, FormRevision, InstanceId, NodeInstance,
    NodeState, Role, Slot, UserId,
};
use journey_playbook::{Multiplicity, NodeId, TenantId};
use serde_json::json;
use std::collections::BTreeMap;

fn attachment_view(attachment: &Attachment) -> AttachmentView {
    AttachmentView {
        attachment_id: attachment.attachment_id,
        document_version_id: attachment.document_version_id,
        status: attachment.status,
        filename: attachment.filename.clone(),
        size: attachment.size_bytes,
        review_note: attachment.review_note.clone(),
        reviewed_version_id: attachment.reviewed_version_id,
        attached_at: attachment.attached_at,
    }
}

fn node_file(slot_key: &str, attachment: &Attachment) -> NodeFileView {
    NodeFileView {
        slot_key: slot_key.to_string(),
        attachment_id: attachment.attachment_id,
        document_version_id: attachment.document_version_id,
        filename: attachment.filename.clone(),
        size_bytes: attachment.size_bytes,
        mime: attachment.mime.clone(),
        status: attachment.status,
        is_active: attachment.is_active,
        attached_by: attachment.attached_by,
        attached_at: attachment.attached_at,
        review_note: attachment.review_note.clone(),
        reviewed_by: attachment.reviewed_by,
        reviewed_at: attachment.reviewed_at,
        reviewed_version_id: attachment.reviewed_version_id,
    }
}

fn slot_view(tables: &Tables, slot: &Slot) -> SlotView {
    SlotView {
        slot_id: slot.slot_id,
        slot_key: slot.slot_key.clone(),
        required: slot.required,
        multiplicity: slot.multiplicity,
        accepted_mime: slot.accepted_mime.clone(),
        attachments: tables
            .attachments_of_slot(slot.slot_id)
            .filter(|a| a.is_active)
            .map(attachment_view)
            .collect(),
    }
}

fn submission_view(tables: &Tables, instance: &NodeInstance) -> SubmissionView {
    let form = tables.latest_revision(instance.instance_id).map_or(
        FormView {
            rev: 0,
            payload: serde_json::Value::Null,
            edited_at: None,
        },
        |revision| FormView {
            rev: revision.rev,
            payload: revision.payload.clone(),
            edited_at: Some(revision.edited_at),
        },
    );
    SubmissionView {
        instance_id: instance.instance_id,
        node_id: instance.node_id.clone(),
        state: instance.state,
        version: instance.version,
        locale: instance.locale.clone(),
        form,
        slots: tables
            .slots_of(instance.instance_id)
            .map(|slot| slot_view(tables, slot))
            .collect(),
        outcomes: tables.outcomes(instance.instance_id).cloned().collect(),
    }
}

/// Scalar values of `fields` found at the top level of `payload`
fn profile_fields(payload: &serde_json::Value, fields: &[String]) -> BTreeMap<String, String> {
    let Some(object) = payload.as_object() else {
        return BTreeMap::new();
    };
    fields
        .iter()
        .filter_map(|field| {
            let value = match object.get(field)? {
                serde_json::Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((field.clone(), value))
        })
        .collect()
}

impl JourneyEngine {
    /// Current form, slots and outcomes of a node; opens the instance if absent
    pub fn get_submission(
        &self,
        tenant: TenantId,
        student: UserId,
        node: &NodeId,
        locale: Option<&str>,
    ) -> Result<SubmissionView> {
        let instance = self.ensure_instance(tenant, student, node, locale)?;
        let tables = self.snapshot();
        let instance = tables
            .instance(instance.instance_id)
            .cloned()
            .unwrap_or(instance);
        Ok(submission_view(&tables, &instance))
    }

    /// Append a form revision, then optionally move the node
    ///
    /// The revision and the requested transition commit together; a
    /// rejected transition discards the revision as well.
    pub fn put_submission(&self, request: PutSubmission) -> Result<SubmissionSaved> {
        let PutSubmission {
            tenant,
            student,
            actor,
            node,
            locale,
            expected_rev,
            payload,
            state,
        } = request;
        if actor.role == Role::Advisor {
            return Err(JourneyError::Forbidden(
                "advisors cannot edit student submissions".to_string(),
            ));
        }
        self.authorize(tenant, student, actor)?;
        if !payload.is_object() {
            return Err(JourneyError::Invalid(
                "form payload must be a JSON object".to_string(),
            ));
        }

        let instance = self.ensure_instance(tenant, student, &node, locale.as_deref())?;
        let playbook = self.playbook_of(&instance)?;
        let active = self.active_playbook(tenant)?;
        let advisors = self.inner.advisors.advisors_of(tenant, student);
        let title = active.title(&node, locale.as_deref().or(instance.locale.as_deref()));
        let plan = PatchPlan {
            tenant,
            student,
            actor,
            node: &node,
            playbook: &playbook,
            active: &active,
            config: &self.inner.config,
            advisors: &advisors,
            title: &title,
        };

        let saved = self.run("put_submission", |tx| {
            let mut current = tx.require_instance(instance.instance_id)?.clone();
            if current.version != instance.version {
                return Err(JourneyError::state_conflict());
            }
            if !matches!(current.state, NodeState::Active | NodeState::NeedsFixes) {
                return Err(JourneyError::Conflict(format!(
                    "node '{}' is not editable in state '{}'",
                    current.node_id, current.state
                )));
            }
            if let Some(expected) = expected_rev {
                if expected != current.current_rev {
                    return Err(JourneyError::Conflict(format!(
                        "form revision changed: expected {expected}, current {}",
                        current.current_rev
                    )));
                }
            }

            let now = tx.now();
            let rev = current.current_rev + 1;
            tx.push_revision(FormRevision {
                instance_id: current.instance_id,
                rev,
                payload: payload.clone(),
                edited_by: actor.id,
                edited_at: now,
            });
            current.current_rev = rev;
            current.version += 1;
            current.updated_at = now;
            if locale.is_some() {
                current.locale.clone_from(&locale);
            }
            tx.put_instance(current.clone());
            tx.append_event(
                current.instance_id,
                EventType::SubmissionSaved,
                Some(actor.id),
                json!({ "rev": rev }),
                now,
            );

            match state.filter(|target| target.resolved() != current.state) {
                Some(target) => {
                    let patched = plan.apply(tx, &current, target, current.version)?;
                    Ok(SubmissionSaved {
                        new_rev: rev,
                        state: patched.new_state,
                        activated: patched.activated,
                    })
                }
                None => Ok(SubmissionSaved {
                    new_rev: rev,
                    state: current.state,
                    activated: Vec::new(),
                }),
            }
        })?;

        tracing::info!(
            tenant = %tenant,
            student = %student,
            node = %node,
            rev = saved.new_rev,
            state = %saved.state,
            "submission saved"
        );
        if node == self.inner.config.profile_node {
            self.mirror_profile(tenant, student, &payload);
        }
        Ok(saved)
    }

    fn mirror_profile(&self, tenant: TenantId, student: UserId, payload: &serde_json::Value) {
        let fields = profile_fields(payload, &self.inner.config.mirrored_profile_fields);
        if fields.is_empty() {
            return;
        }
        if let Err(err) = self.inner.profile.mirror(tenant, student, &fields) {
            tracing::warn!(
                tenant = %tenant,
                student = %student,
                error = %err,
                "profile mirror failed"
            );
        }
    }

    /// Slot of an instance with its active attachments
    pub fn get_slot(&self, instance_id: InstanceId, slot_key: &str) -> Result<SlotView> {
        let tables = self.snapshot();
        tables.require_instance(instance_id)?;
        let slot = tables.slot_by_key(instance_id, slot_key).ok_or_else(|| {
            JourneyError::NotFound(format!("slot '{slot_key}' on instance {instance_id}"))
        })?;
        Ok(slot_view(&tables, slot))
    }

    /// Every attachment of the student's most recently updated instance of
    /// `node`, oldest upload first, superseded ones included
    pub fn list_node_files(
        &self,
        tenant: TenantId,
        student: UserId,
        node: &NodeId,
        caller: Actor,
    ) -> Result<Vec<NodeFileView>> {
        self.authorize(tenant, student, caller)?;
        let tables = self.snapshot();
        let instance = tables
            .instances_of(tenant, student)
            .filter(|i| &i.node_id == node)
            .max_by_key(|i| (i.updated_at, i.instance_id))
            .ok_or_else(|| JourneyError::NotFound(format!("node '{node}' has no instance")))?;

        let mut files: Vec<NodeFileView> = tables
            .slots_of(instance.instance_id)
            .flat_map(|slot| {
                tables
                    .attachments_of_slot(slot.slot_id)
                    .map(move |a| node_file(&slot.slot_key, a))
            })
            .collect();
        files.sort_by_key(|f| (f.attached_at, f.attachment_id));
        Ok(files)
    }

    /// Bind an uploaded document version to a slot
    pub fn attach(&self, request: AttachRequest) -> Result<Attachment> {
        let AttachRequest {
            slot_id,
            document_version_id,
            filename,
            size_bytes,
            mime,
            actor,
        } = request;
        let tables = self.snapshot();
        let slot = tables
            .slot(slot_id)
            .cloned()
            .ok_or_else(|| JourneyError::NotFound(format!("slot {slot_id}")))?;
        let instance = tables.require_instance(slot.instance_id)?.clone();
        drop(tables);

        if actor.role == Role::Advisor {
            return Err(JourneyError::Forbidden(
                "advisors upload reviewed copies, not attachments".to_string(),
            ));
        }
        self.authorize(instance.tenant_id, instance.student_id, actor)?;
        if filename.trim().is_empty() {
            return Err(JourneyError::Invalid("filename is empty".to_string()));
        }
        let limit = self.inner.config.max_upload_bytes;
        if size_bytes > limit {
            return Err(JourneyError::Invalid(format!(
                "file exceeds the {limit} byte upload limit"
            )));
        }
        if let Some(mime) = &mime {
            if !slot.accepted_mime.is_empty() && !slot.accepted_mime.contains(mime) {
                return Err(JourneyError::Invalid(format!(
                    "mime type '{mime}' is not accepted for slot '{}'",
                    slot.slot_key
                )));
            }
        }
        if !self
            .inner
            .documents
            .exists(instance.tenant_id, document_version_id)
        {
            return Err(JourneyError::NotFound(format!(
                "document version {document_version_id}"
            )));
        }

        let attachment = self.run("attach", |tx| {
            let mut current = tx.require_instance(instance.instance_id)?.clone();
            if current.state.is_terminal() {
                return Err(JourneyError::Conflict(format!(
                    "node '{}' is closed in state '{}'",
                    current.node_id, current.state
                )));
            }
            let now = tx.now();
            if slot.multiplicity == Multiplicity::Single {
                let superseded: Vec<Attachment> = tx
                    .attachments_of_slot(slot_id)
                    .filter(|a| a.is_active)
                    .cloned()
                    .collect();
                for mut previous in superseded {
                    previous.is_active = false;
                    tx.put_attachment(previous);
                }
            }
            let attachment = Attachment {
                attachment_id: AttachmentId::new(),
                slot_id,
                instance_id: current.instance_id,
                document_version_id,
                filename: filename.clone(),
                size_bytes,
                mime: mime.clone(),
                status: AttachmentStatus::Submitted,
                review_note: None,
                reviewed_by: None,
                reviewed_at: None,
                reviewed_version_id: None,
                attached_by: actor.id,
                attached_at: now,
                is_active: true,
            };
            tx.insert_attachment(attachment.clone());
            current.updated_at = now;
            tx.put_instance(current.clone());
            tx.append_event(
                current.instance_id,
                EventType::AttachmentAdded,
                Some(actor.id),
                json!({
                    "attachment_id": attachment.attachment_id,
                    "slot_key": slot.slot_key,
                    "filename": attachment.filename,
                    "size_bytes": size_bytes,
                }),
                now,
            );
            Ok(attachment)
        })?;

        tracing::info!(
            instance = %instance.instance_id,
            slot = %slot.slot_key,
            attachment = %attachment.attachment_id,
            size_bytes,
            "attachment added"
        );
        Ok(attachment)
    }
}
