//! Engine facade
//!
//! [`JourneyEngine`] wires the playbook catalog, the store and the external
//! collaborators together. Operations live in topic modules (`lifecycle`,
//! `submission`, `review`, `monitor`) as further `impl` blocks; this module
//! holds construction, the transaction runner and instance bookkeeping.

use crate::activation::activate_successors;
use crate::api::{ProjectionMismatch, ProjectionReport};
use crate::audit::{verify_chain, Event, EventType};
use crate::cancel::Cancellation;
use crate::collab::{
    AdvisorLinks, Clock, DocumentRegistry, InMemoryDirectory, InMemoryDocuments, ProfileMirror,
    StudentDirectory, SystemClock,
};
use crate::config::EngineConfig;
use crate::error::{JourneyError, Result};
use crate::lifecycle::{materialize_slots, open_instance};
use crate::notify::{self, Notifier, TracingNotifier};
use crate::store::{MemoryStore, Tables, Tx};
use crate::types::{
    Actor, InstanceId, InstanceKey, NodeInstance, NodeState, Outcome, Role, Slot, UserId,
};
use chrono::{DateTime, Utc};
use journey_playbook::{NodeId, Playbook, PlaybookCatalog, TenantId};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub(crate) struct Inner {
    pub catalog: Arc<PlaybookCatalog>,
    pub store: MemoryStore,
    pub config: EngineConfig,
    pub advisors: Arc<dyn AdvisorLinks>,
    pub directory: Arc<dyn StudentDirectory>,
    pub documents: Arc<dyn DocumentRegistry>,
    pub notifier: Arc<dyn Notifier>,
    pub profile: Arc<dyn ProfileMirror>,
    pub clock: Arc<dyn Clock>,
}

/// Program journey engine
///
/// Cheap to clone; clones share the store and collaborators. Use
/// [`JourneyEngine::with_cancellation`] to scope a cancellation token to a
/// set of calls.
#[derive(Clone)]
pub struct JourneyEngine {
    pub(crate) inner: Arc<Inner>,
    pub(crate) cancel: Cancellation,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("config", &self.inner.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Builder for [`JourneyEngine`]
pub struct EngineBuilder {
    catalog: Arc<PlaybookCatalog>,
    config: EngineConfig,
    advisors: Option<Arc<dyn AdvisorLinks>>,
    directory: Option<Arc<dyn StudentDirectory>>,
    documents: Option<Arc<dyn DocumentRegistry>>,
    notifier: Option<Arc<dyn Notifier>>,
    profile: Option<Arc<dyn ProfileMirror>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn advisor_links(mut self, advisors: Arc<dyn AdvisorLinks>) -> Self {
        self.advisors = Some(advisors);
        self
    }

    #[must_use]
    pub fn directory(mut self, directory: Arc<dyn StudentDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn documents(mut self, documents: Arc<dyn DocumentRegistry>) -> Self {
        self.documents = Some(documents);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn profile_mirror(mut self, profile: Arc<dyn ProfileMirror>) -> Self {
        self.profile = Some(profile);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use one in-memory directory for advisor links, student records and
    /// the profile mirror
    #[must_use]
    pub fn in_memory_directory(self, directory: Arc<InMemoryDirectory>) -> Self {
        self.advisor_links(directory.clone())
            .directory(directory.clone())
            .profile_mirror(directory)
    }

    #[must_use]
    pub fn build(self) -> JourneyEngine {
        let fallback = Arc::new(InMemoryDirectory::new());
        let inner = Inner {
            catalog: self.catalog,
            store: MemoryStore::new(),
            config: self.config,
            advisors: self.advisors.unwrap_or_else(|| fallback.clone()),
            directory: self.directory.unwrap_or_else(|| fallback.clone()),
            documents: self
                .documents
                .unwrap_or_else(|| Arc::new(InMemoryDocuments::permissive())),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
            profile: self.profile.unwrap_or(fallback),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };
        JourneyEngine {
            inner: Arc::new(inner),
            cancel: Cancellation::new(),
        }
    }
}

impl JourneyEngine {
    #[must_use]
    pub fn builder(catalog: Arc<PlaybookCatalog>) -> EngineBuilder {
        EngineBuilder {
            catalog,
            config: EngineConfig::default(),
            advisors: None,
            directory: None,
            documents: None,
            notifier: None,
            profile: None,
            clock: None,
        }
    }

    /// A handle sharing all state whose calls observe `token`
    #[must_use]
    pub fn with_cancellation(&self, token: Cancellation) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cancel: token,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn catalog(&self) -> &PlaybookCatalog {
        &self.inner.catalog
    }

    /// Backing store, exposed for snapshots and fault injection
    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.inner.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub(crate) fn snapshot(&self) -> Tables {
        self.inner.store.snapshot()
    }

    pub(crate) fn active_playbook(&self, tenant: TenantId) -> Result<Arc<Playbook>> {
        self.inner
            .catalog
            .active(tenant)
            .ok_or_else(|| {
                JourneyError::NotFound(format!("no active playbook for tenant {tenant}"))
            })
    }

    /// The version an instance was opened under
    pub(crate) fn playbook_of(&self, instance: &NodeInstance) -> Result<Arc<Playbook>> {
        self.inner
            .catalog
            .version(instance.playbook_version_id)
            .ok_or_else(|| {
                JourneyError::NotFound(format!(
                    "playbook version {}",
                    instance.playbook_version_id
                ))
            })
    }

    /// Run `body` in one transaction, retrying once on `Transient`, then
    /// dispatch its outbox
    pub(crate) fn run<T, F>(&self, op: &'static str, mut body: F) -> Result<T>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T>,
    {
        let store = &self.inner.store;
        let clock = self.inner.clock.as_ref();
        let committed = match store.transaction(&self.cancel, clock, &mut body) {
            Err(err) if err.is_retryable() => {
                tracing::warn!(op, error = %err, "retrying transaction");
                store.transaction(&self.cancel, clock, &mut body)
            }
            other => other,
        }
        .map_err(|err| {
            tracing::debug!(op, error = %err, "transaction rolled back");
            err
        })?;

        notify::dispatch(
            self.inner.notifier.as_ref(),
            &committed.outbox,
            self.inner.config.notify_retry_attempts,
        );
        Ok(committed.value)
    }

    /// Students act on their own journey, advisors on linked students,
    /// admins on anyone
    pub(crate) fn authorize(&self, tenant: TenantId, student: UserId, actor: Actor) -> Result<()> {
        match actor.role {
            Role::Student if actor.id != student => Err(JourneyError::Forbidden(
                "students may only act on their own journey".to_string(),
            )),
            Role::Advisor if !self.inner.advisors.is_linked(tenant, actor.id, student) => Err(
                JourneyError::Forbidden("advisor is not linked to this student".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Reviewer roles only, advisors must be linked
    pub(crate) fn authorize_reviewer(
        &self,
        tenant: TenantId,
        student: UserId,
        actor: Actor,
    ) -> Result<()> {
        if actor.role == Role::Student {
            return Err(JourneyError::Forbidden(
                "students cannot review their own documents".to_string(),
            ));
        }
        self.authorize(tenant, student, actor)
    }

    /// Return the student's instance of `node` under the active playbook,
    /// creating it in `active` when absent
    pub fn ensure_instance(
        &self,
        tenant: TenantId,
        student: UserId,
        node: &NodeId,
        locale: Option<&str>,
    ) -> Result<NodeInstance> {
        let playbook = self.active_playbook(tenant)?;
        if !playbook.contains(node) {
            return Err(JourneyError::NotFound(format!("node '{node}'")));
        }
        let key = InstanceKey {
            student_id: student,
            node_id: node.clone(),
            playbook_version_id: playbook.version_id(),
        };
        if let Some(existing) = self.snapshot().instance_by_key(&key) {
            return Ok(existing.clone());
        }
        self.run("ensure_instance", |tx| {
            if let Some(existing) = tx.instance_by_key(&key) {
                return Ok(existing.clone());
            }
            open_instance(
                tx,
                &playbook,
                tenant,
                student,
                node,
                locale.map(str::to_string),
                Some(student),
            )
        })
    }

    /// Instance of `node` under the active playbook, if opened
    pub fn get_by_student_node(
        &self,
        tenant: TenantId,
        student: UserId,
        node: &NodeId,
    ) -> Result<Option<NodeInstance>> {
        let playbook = self.active_playbook(tenant)?;
        let key = InstanceKey {
            student_id: student,
            node_id: node.clone(),
            playbook_version_id: playbook.version_id(),
        };
        Ok(self.snapshot().instance_by_key(&key).cloned())
    }

    pub fn get_by_id(&self, instance: InstanceId) -> Result<NodeInstance> {
        self.snapshot().require_instance(instance).cloned()
    }

    /// Create missing slot rows for the instance's upload requirements
    pub fn ensure_slots(&self, instance_id: InstanceId) -> Result<Vec<Slot>> {
        let instance = self.get_by_id(instance_id)?;
        let playbook = self.playbook_of(&instance)?;
        let existing: Vec<Slot> = self.snapshot().slots_of(instance_id).cloned().collect();
        if existing.len() >= playbook.upload_slots(&instance.node_id).len() {
            return Ok(existing);
        }
        self.run("ensure_slots", |tx| {
            materialize_slots(tx, &playbook, &instance);
            Ok(tx.slots_of(instance_id).cloned().collect())
        })
    }

    /// Audit events of an instance in commit order
    #[must_use]
    pub fn events(&self, instance: InstanceId) -> Vec<Event> {
        self.snapshot().events(instance)
    }

    /// Check the hash chain and timestamp order of an instance's log
    pub fn verify_event_chain(&self, instance: InstanceId) -> Result<usize> {
        verify_chain(&self.events(instance))
    }

    /// Projection rows of a student, keyed by node
    #[must_use]
    pub fn journey_state(&self, tenant: TenantId, student: UserId) -> BTreeMap<NodeId, NodeState> {
        self.snapshot()
            .projection_of(tenant, student)
            .map(|row| (row.node_id.clone(), row.state))
            .collect()
    }

    /// Compare every projection row with the latest instance state. A
    /// missing row reads as `active`.
    pub fn verify_projection(&self, tenant: TenantId) -> Result<ProjectionReport> {
        let tables = self.snapshot();
        let mut report = ProjectionReport::default();
        for student in tables.students(tenant) {
            self.cancel.check()?;
            let mut latest: HashMap<&NodeId, &NodeInstance> = HashMap::new();
            for instance in tables.instances_of(tenant, student) {
                let entry = latest.entry(&instance.node_id).or_insert(instance);
                if (instance.updated_at, instance.instance_id)
                    > (entry.updated_at, entry.instance_id)
                {
                    *entry = instance;
                }
            }
            for (node, instance) in &latest {
                report.checked += 1;
                let projected = tables
                    .projection_row(tenant, student, node)
                    .map(|row| row.state);
                if projected.unwrap_or(NodeState::Active) != instance.state {
                    report.mismatches.push(ProjectionMismatch {
                        student,
                        node: (*node).clone(),
                        projected,
                        actual: Some(instance.state),
                    });
                }
            }
            for row in tables.projection_of(tenant, student) {
                if !latest.contains_key(&row.node_id) {
                    report.checked += 1;
                    report.mismatches.push(ProjectionMismatch {
                        student,
                        node: row.node_id.clone(),
                        projected: Some(row.state),
                        actual: None,
                    });
                }
            }
        }
        if !report.is_consistent() {
            tracing::warn!(
                tenant = %tenant,
                mismatches = report.mismatches.len(),
                "journey projection drift"
            );
        }
        Ok(report)
    }

    /// Move every instance of a student back to `active` and wipe the
    /// projection. The profile node keeps its state and row.
    pub fn reset_journey(&self, tenant: TenantId, student: UserId, actor: Actor) -> Result<usize> {
        if !actor.role.is_admin() {
            return Err(JourneyError::Forbidden(
                "only administrators may reset a journey".to_string(),
            ));
        }
        let profile = self.inner.config.profile_node.clone();
        let reset = self.run("reset_journey", |tx| {
            let now = tx.now();
            let instances: Vec<NodeInstance> = tx
                .instances_of(tenant, student)
                .filter(|i| i.node_id != profile)
                .cloned()
                .collect();
            let mut reset = 0;
            for mut instance in instances {
                let from = instance.state;
                if from != NodeState::Active {
                    instance.state = NodeState::Active;
                    instance.version += 1;
                    instance.updated_at = now;
                    tx.put_instance(instance.clone());
                    reset += 1;
                }
                tx.append_event(
                    instance.instance_id,
                    EventType::Reset,
                    Some(actor.id),
                    json!({ "from": from }),
                    now,
                );
            }
            let wiped: Vec<NodeId> = tx
                .projection_of(tenant, student)
                .filter(|row| row.node_id != profile)
                .map(|row| row.node_id.clone())
                .collect();
            for node in &wiped {
                tx.remove_projection(tenant, student, node);
            }
            Ok(reset)
        })?;
        tracing::info!(tenant = %tenant, student = %student, reset, "journey reset");
        Ok(reset)
    }

    /// Store a disposition for an instance
    pub fn record_outcome(
        &self,
        instance_id: InstanceId,
        value: &str,
        note: Option<&str>,
        actor: Actor,
    ) -> Result<Outcome> {
        if value.trim().is_empty() {
            return Err(JourneyError::Invalid("outcome value is empty".to_string()));
        }
        let instance = self.get_by_id(instance_id)?;
        self.authorize_reviewer(instance.tenant_id, instance.student_id, actor)?;
        self.run("record_outcome", |tx| {
            tx.require_instance(instance_id)?;
            Ok(push_outcome(tx, instance_id, value, note, actor.id))
        })
    }

    /// Evaluate successors of a terminal instance. Safe to call repeatedly.
    pub fn activate_next(
        &self,
        instance_id: InstanceId,
        actor: Actor,
    ) -> Result<Vec<NodeInstance>> {
        let instance = self.get_by_id(instance_id)?;
        let playbook = self.active_playbook(instance.tenant_id)?;
        let config = &self.inner.config;
        self.run("activate_next", |tx| {
            let current = tx.require_instance(instance_id)?.clone();
            if !triggers_activation(config, current.state) {
                return Ok(Vec::new());
            }
            activate_successors(tx, &playbook, &current, config, Some(actor.id))
        })
    }
}

/// Whether reaching `state` runs activation
pub(crate) fn triggers_activation(config: &EngineConfig, state: NodeState) -> bool {
    state == NodeState::Done
        || (state == NodeState::Skipped && config.skipped_satisfies_prerequisites)
}

pub(crate) fn push_outcome(
    tx: &mut Tx<'_>,
    instance_id: InstanceId,
    value: &str,
    note: Option<&str>,
    decided_by: UserId,
) -> Outcome {
    let now = tx.now();
    let outcome = Outcome {
        instance_id,
        value: value.to_string(),
        decided_by,
        note: note.map(str::to_string),
        decided_at: now,
    };
    tx.push_outcome(outcome.clone());
    tx.append_event(
        instance_id,
        EventType::OutcomeRecorded,
        Some(decided_by),
        json!({ "value": value, "note": note }),
        now,
    );
    outcome
}
