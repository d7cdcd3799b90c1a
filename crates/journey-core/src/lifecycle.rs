//! Node instance lifecycle: creation, guarded state transitions, peer sync
//!
//! Every state change goes through [`transition`], which enforces the
//! optimistic-lock token, the transition table, the projection update and
//! the `state_changed` event as one unit inside the caller's transaction.

use crate::activation::activate_successors;
use crate::api::{PatchState, StatePatched};
use crate::audit::EventType;
use crate::config::EngineConfig;
use crate::engine::{push_outcome, triggers_activation, JourneyEngine};
use crate::error::{JourneyError, Result};
use crate::notify::{Notification, NotificationKind, Recipient};
use crate::store::{Tables, Tx};
use crate::transitions::validate_transition;
use crate::types::{
    Actor, InstanceId, NodeInstance, NodeState, ProjectionRow, Role, Slot, SlotId, TargetState,
    UserId,
};
use journey_playbook::{NodeId, Playbook, TenantId};
use serde_json::json;

/// Create an `active` instance with its slots, projection row and `opened` event
pub(crate) fn open_instance(
    tx: &mut Tx<'_>,
    playbook: &Playbook,
    tenant: TenantId,
    student: UserId,
    node: &NodeId,
    locale: Option<String>,
    actor: Option<UserId>,
) -> Result<NodeInstance> {
    if !playbook.contains(node) {
        return Err(JourneyError::NotFound(format!("node '{node}'")));
    }
    let now = tx.now();
    let instance = NodeInstance {
        instance_id: InstanceId::new(),
        tenant_id: tenant,
        student_id: student,
        node_id: node.clone(),
        playbook_version_id: playbook.version_id(),
        state: NodeState::Active,
        current_rev: 0,
        locale,
        opened_at: now,
        updated_at: now,
        version: 1,
    };
    tx.insert_instance(instance.clone())?;
    materialize_slots(tx, playbook, &instance);
    tx.upsert_projection(projection_row(&instance));
    tx.append_event(
        instance.instance_id,
        EventType::Opened,
        actor,
        json!({ "node": node, "playbook_version": playbook.version_id() }),
        now,
    );
    tracing::debug!(
        tenant = %tenant,
        student = %student,
        node = %node,
        instance = %instance.instance_id,
        "node instance opened"
    );
    Ok(instance)
}

/// Insert slot rows for upload requirements that have none yet
pub(crate) fn materialize_slots(tx: &mut Tx<'_>, playbook: &Playbook, instance: &NodeInstance) {
    for requirement in playbook.upload_slots(&instance.node_id) {
        if tx
            .slot_by_key(instance.instance_id, &requirement.key)
            .is_some()
        {
            continue;
        }
        tx.insert_slot(Slot {
            slot_id: SlotId::new(),
            instance_id: instance.instance_id,
            slot_key: requirement.key.clone(),
            required: requirement.required,
            multiplicity: requirement.multiplicity,
            accepted_mime: requirement.mime.clone(),
        });
    }
}

fn projection_row(instance: &NodeInstance) -> ProjectionRow {
    ProjectionRow {
        tenant_id: instance.tenant_id,
        student_id: instance.student_id,
        node_id: instance.node_id.clone(),
        state: instance.state,
        updated_at: instance.updated_at,
    }
}

/// One requested state change
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transition {
    pub instance_id: InstanceId,
    pub expected_version: u64,
    pub target: TargetState,
    pub actor: Actor,
}

/// Apply a table-checked, version-checked state change
pub(crate) fn transition(tx: &mut Tx<'_>, request: Transition) -> Result<NodeInstance> {
    let current = tx.require_instance(request.instance_id)?.clone();
    let to = request.target.resolved();
    if current.version != request.expected_version || current.state == to {
        return Err(JourneyError::state_conflict());
    }
    validate_transition(current.state, request.target, request.actor.role)?;

    let now = tx.now();
    let mut next = current.clone();
    next.state = to;
    next.version += 1;
    next.updated_at = now;
    tx.put_instance(next.clone());
    tx.upsert_projection(projection_row(&next));
    tx.append_event(
        next.instance_id,
        EventType::StateChanged,
        Some(request.actor.id),
        json!({
            "from": current.state,
            "to": to,
            "target": request.target,
            "role": request.actor.role,
        }),
        now,
    );
    sync_peers(tx, &next, request.actor);

    tracing::info!(
        tenant = %next.tenant_id,
        student = %next.student_id,
        node = %next.node_id,
        instance = %next.instance_id,
        from = %current.state,
        to = %to,
        role = %request.actor.role,
        "node state changed"
    );
    Ok(next)
}

/// Copy a new state onto the same node's instances under other playbook
/// versions so the projection stays coherent
pub(crate) fn sync_peers(tx: &mut Tx<'_>, source: &NodeInstance, actor: Actor) {
    let peers: Vec<NodeInstance> = tx
        .instances_of(source.tenant_id, source.student_id)
        .filter(|i| {
            i.node_id == source.node_id
                && i.instance_id != source.instance_id
                && i.state != source.state
        })
        .cloned()
        .collect();
    let now = tx.now();
    for mut peer in peers {
        let from = peer.state;
        peer.state = source.state;
        peer.version += 1;
        peer.updated_at = now;
        tx.put_instance(peer.clone());
        tx.append_event(
            peer.instance_id,
            EventType::StateSynced,
            Some(actor.id),
            json!({ "from": from, "to": source.state, "source": source.instance_id }),
            now,
        );
        tracing::debug!(
            node = %peer.node_id,
            instance = %peer.instance_id,
            version = %peer.playbook_version_id,
            "peer instance synced"
        );
    }
}

/// `PreconditionFailed` naming the first required slot without an active attachment
pub(crate) fn ensure_required_slots(
    tables: &Tables,
    playbook: &Playbook,
    instance: &NodeInstance,
) -> Result<()> {
    for requirement in playbook.required_slots(&instance.node_id) {
        let satisfied = tables
            .slot_by_key(instance.instance_id, &requirement.key)
            .is_some_and(|slot| {
                tables
                    .attachments_of_slot(slot.slot_id)
                    .any(|a| a.is_active)
            });
        if !satisfied {
            return Err(JourneyError::missing_slot(&requirement.key));
        }
    }
    Ok(())
}

/// Everything a state patch needs besides the transaction
pub(crate) struct PatchPlan<'a> {
    pub tenant: TenantId,
    pub student: UserId,
    pub actor: Actor,
    pub node: &'a NodeId,
    /// Version the instance was opened under
    pub playbook: &'a Playbook,
    /// Version activation runs against
    pub active: &'a Playbook,
    pub config: &'a EngineConfig,
    pub advisors: &'a [UserId],
    pub title: &'a str,
}

impl PatchPlan<'_> {
    /// Move `current` to `target`: slot checks, the transition, the outcome
    /// for `approved_with_comments`, activation and notifications
    pub(crate) fn apply(
        &self,
        tx: &mut Tx<'_>,
        current: &NodeInstance,
        target: TargetState,
        expected_version: u64,
    ) -> Result<StatePatched> {
        let to = target.resolved();
        if current.version != expected_version || current.state == to {
            return Err(JourneyError::state_conflict());
        }
        validate_transition(current.state, target, self.actor.role)?;
        if matches!(to, NodeState::Submitted | NodeState::Done) {
            ensure_required_slots(tx, self.playbook, current)?;
        }

        let next = transition(
            tx,
            Transition {
                instance_id: current.instance_id,
                expected_version,
                target,
                actor: self.actor,
            },
        )?;
        if target == TargetState::ApprovedWithComments {
            push_outcome(
                tx,
                next.instance_id,
                TargetState::APPROVED_WITH_COMMENTS,
                None,
                self.actor.id,
            );
        }
        let activated = if triggers_activation(self.config, next.state) {
            activate_successors(tx, self.active, &next, self.config, Some(self.actor.id))?
        } else {
            Vec::new()
        };
        self.notify(tx, next.state);

        Ok(StatePatched {
            new_state: next.state,
            version: next.version,
            activated: activated.into_iter().map(|i| i.node_id).collect(),
        })
    }

    fn notify(&self, tx: &mut Tx<'_>, state: NodeState) {
        let now = tx.now();
        let title = self.title;
        let notice = |recipient, kind, title: String, message: String| Notification {
            tenant_id: self.tenant,
            recipient,
            kind,
            title,
            message,
            student_id: self.student,
            node_id: self.node.clone(),
            created_at: now,
        };
        if self.actor.role == Role::Student && state == NodeState::Submitted {
            for advisor in self.advisors {
                tx.notify(notice(
                    Recipient::User(*advisor),
                    NotificationKind::SubmissionReceived,
                    format!("New submission: {title}"),
                    format!("A student submitted '{title}' for review."),
                ));
            }
            tx.notify(notice(
                Recipient::AdminChannel,
                NotificationKind::SubmissionReceived,
                format!("New submission: {title}"),
                format!("A student submitted '{title}' for review."),
            ));
        } else if self.actor.id != self.student {
            tx.notify(notice(
                Recipient::User(self.student),
                NotificationKind::StateChanged,
                format!("Journey updated: {title}"),
                format!("Status changed to {state}."),
            ));
        }
    }
}

impl JourneyEngine {
    /// Move a node to `target` on behalf of `actor`
    ///
    /// Moving to `submitted` or `done` requires every required slot to hold
    /// an active attachment. Reaching `done` runs activation in the same
    /// transaction.
    pub fn patch_state(&self, request: PatchState) -> Result<StatePatched> {
        let PatchState {
            tenant,
            student,
            actor,
            node,
            target,
            expected_version,
        } = request;
        self.authorize(tenant, student, actor)?;

        let instance = self.ensure_instance(tenant, student, &node, None)?;
        let playbook = self.playbook_of(&instance)?;
        let active = self.active_playbook(tenant)?;
        let expected = expected_version.unwrap_or(instance.version);
        let advisors = self.inner.advisors.advisors_of(tenant, student);
        let title = active.title(&node, instance.locale.as_deref());
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

        self.run("patch_state", |tx| {
            let current = tx.require_instance(instance.instance_id)?.clone();
            plan.apply(tx, &current, target, expected)
        })
    }
}
