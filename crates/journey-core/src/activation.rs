//! Prerequisite-driven activation of successor nodes
//!
//! Purely forward: a successor is opened only when every one of its
//! prerequisites is satisfied under the active playbook version, and an
//! existing instance is never touched.

use crate::audit::EventType;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::lifecycle::open_instance;
use crate::store::{Tables, Tx};
use crate::types::{InstanceKey, NodeInstance, NodeState, UserId};
use journey_playbook::{NodeId, Playbook};
use serde_json::json;

/// Whether every prerequisite of `node` is satisfied for the student
#[must_use]
pub fn prerequisites_met(
    tables: &Tables,
    playbook: &Playbook,
    student: UserId,
    node: &NodeId,
    config: &EngineConfig,
) -> bool {
    playbook.predecessors(node).iter().all(|prerequisite| {
        let key = InstanceKey {
            student_id: student,
            node_id: prerequisite.clone(),
            playbook_version_id: playbook.version_id(),
        };
        tables.instance_by_key(&key).is_some_and(|i| {
            i.state == NodeState::Done
                || (config.skipped_satisfies_prerequisites && i.state == NodeState::Skipped)
        })
    })
}

/// Open every successor of `completed` whose prerequisites are all met
///
/// `playbook` is the tenant's active version; successors and prerequisites
/// are evaluated there even when `completed` belongs to an older version.
pub(crate) fn activate_successors(
    tx: &mut Tx<'_>,
    playbook: &Playbook,
    completed: &NodeInstance,
    config: &EngineConfig,
    actor: Option<UserId>,
) -> Result<Vec<NodeInstance>> {
    let mut created = Vec::new();
    for successor in playbook.successors(&completed.node_id) {
        let key = InstanceKey {
            student_id: completed.student_id,
            node_id: successor.clone(),
            playbook_version_id: playbook.version_id(),
        };
        if tx.instance_by_key(&key).is_some() {
            continue;
        }
        if !prerequisites_met(tx, playbook, completed.student_id, successor, config) {
            tracing::debug!(
                student = %completed.student_id,
                node = %successor,
                "successor waiting on prerequisites"
            );
            continue;
        }
        let instance = open_instance(
            tx,
            playbook,
            completed.tenant_id,
            completed.student_id,
            successor,
            completed.locale.clone(),
            actor,
        )?;
        let now = tx.now();
        tx.append_event(
            instance.instance_id,
            EventType::Activated,
            actor,
            json!({ "reason": "prerequisites_met", "source": completed.node_id }),
            now,
        );
        tracing::info!(
            tenant = %completed.tenant_id,
            student = %completed.student_id,
            node = %successor,
            source = %completed.node_id,
            "node activated"
        );
        created.push(instance);
    }
    Ok(created)
}
