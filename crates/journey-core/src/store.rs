//! Transactional in-memory store
//!
//! All engine state lives in [`Tables`], a bundle of persistent (`im`) maps.
//! A transaction clones the tables (structural sharing keeps this cheap),
//! runs its body against the copy and publishes it by swapping it in. A body
//! error, a cancellation or a failed commit drops the copy, so no partial
//! write is ever observable.
//!
//! Writers serialize on the commit lock and read the clock while holding
//! it, so commit timestamps strictly increase in commit order. Readers take
//! snapshots and never block writers for longer than one pointer swap.

use crate::audit::{chain_event, Event, EventType};
use crate::cancel::Cancellation;
use crate::collab::Clock;
use crate::error::{JourneyError, Result};
use crate::notify::Notification;
use crate::types::{
    Attachment, AttachmentId, FormRevision, InstanceId, InstanceKey, NodeInstance, Outcome,
    ProjectionRow, Slot, SlotId, UserId,
};
use chrono::{DateTime, Duration, Utc};
use im::{HashMap, Vector};
use journey_playbook::{NodeId, TenantId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};

type StudentKey = (TenantId, UserId);
type ProjectionKey = (TenantId, UserId, NodeId);

/// Every table the engine persists
#[derive(Debug, Clone, Default)]
pub struct Tables {
    instances: HashMap<InstanceId, NodeInstance>,
    instance_keys: HashMap<InstanceKey, InstanceId>,
    student_instances: HashMap<StudentKey, Vector<InstanceId>>,
    revisions: HashMap<InstanceId, Vector<FormRevision>>,
    slots: HashMap<SlotId, Slot>,
    instance_slots: HashMap<InstanceId, Vector<SlotId>>,
    attachments: HashMap<AttachmentId, Attachment>,
    slot_attachments: HashMap<SlotId, Vector<AttachmentId>>,
    outcomes: HashMap<InstanceId, Vector<Outcome>>,
    events: HashMap<InstanceId, Vector<Event>>,
    projection: HashMap<ProjectionKey, ProjectionRow>,
}

impl Tables {
    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<&NodeInstance> {
        self.instances.get(&id)
    }

    pub(crate) fn require_instance(&self, id: InstanceId) -> Result<&NodeInstance> {
        self.instance(id)
            .ok_or_else(|| JourneyError::NotFound(format!("node instance {id}")))
    }

    #[must_use]
    pub fn instance_by_key(&self, key: &InstanceKey) -> Option<&NodeInstance> {
        self.instance_keys
            .get(key)
            .and_then(|id| self.instances.get(id))
    }

    /// Every instance of a student, in creation order
    pub fn instances_of(
        &self,
        tenant: TenantId,
        student: UserId,
    ) -> impl Iterator<Item = &NodeInstance> + '_ {
        self.student_instances
            .get(&(tenant, student))
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.instances.get(id))
    }

    /// Students of a tenant that have at least one instance
    #[must_use]
    pub fn students(&self, tenant: TenantId) -> Vec<UserId> {
        let mut students: Vec<UserId> = self
            .student_instances
            .keys()
            .filter(|(t, _)| *t == tenant)
            .map(|(_, student)| *student)
            .collect();
        students.sort();
        students
    }

    /// Form revisions of an instance, oldest first
    pub fn revisions(&self, instance: InstanceId) -> impl Iterator<Item = &FormRevision> + '_ {
        self.revisions.get(&instance).into_iter().flat_map(|r| r.iter())
    }

    #[must_use]
    pub fn latest_revision(&self, instance: InstanceId) -> Option<&FormRevision> {
        self.revisions.get(&instance).and_then(Vector::last)
    }

    #[must_use]
    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    /// Slots of an instance in creation order
    pub fn slots_of(&self, instance: InstanceId) -> impl Iterator<Item = &Slot> + '_ {
        self.instance_slots
            .get(&instance)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.slots.get(id))
    }

    #[must_use]
    pub fn slot_by_key(&self, instance: InstanceId, slot_key: &str) -> Option<&Slot> {
        self.slots_of(instance).find(|slot| slot.slot_key == slot_key)
    }

    #[must_use]
    pub fn attachment(&self, id: AttachmentId) -> Option<&Attachment> {
        self.attachments.get(&id)
    }

    /// Attachments of a slot in upload order
    pub fn attachments_of_slot(&self, slot: SlotId) -> impl Iterator<Item = &Attachment> + '_ {
        self.slot_attachments
            .get(&slot)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.attachments.get(id))
    }

    pub fn attachments_of_instance(
        &self,
        instance: InstanceId,
    ) -> impl Iterator<Item = &Attachment> + '_ {
        self.slots_of(instance)
            .flat_map(|slot| self.attachments_of_slot(slot.slot_id))
    }

    pub fn outcomes(&self, instance: InstanceId) -> impl Iterator<Item = &Outcome> + '_ {
        self.outcomes.get(&instance).into_iter().flat_map(|o| o.iter())
    }

    /// Audit events of an instance in commit order
    #[must_use]
    pub fn events(&self, instance: InstanceId) -> Vec<Event> {
        self.events
            .get(&instance)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn projection_row(
        &self,
        tenant: TenantId,
        student: UserId,
        node: &NodeId,
    ) -> Option<&ProjectionRow> {
        self.projection.get(&(tenant, student, node.clone()))
    }

    /// Projection rows of a student
    pub fn projection_of(
        &self,
        tenant: TenantId,
        student: UserId,
    ) -> impl Iterator<Item = &ProjectionRow> + '_ {
        self.projection
            .values()
            .filter(move |row| row.tenant_id == tenant && row.student_id == student)
    }

    pub(crate) fn insert_instance(&mut self, instance: NodeInstance) -> Result<()> {
        let key = instance.key();
        if self.instance_keys.contains_key(&key) {
            return Err(JourneyError::Conflict(format!(
                "instance for node '{}' already exists",
                instance.node_id
            )));
        }
        self.instance_keys.insert(key, instance.instance_id);
        self.student_instances
            .entry((instance.tenant_id, instance.student_id))
            .or_default()
            .push_back(instance.instance_id);
        self.instances.insert(instance.instance_id, instance);
        Ok(())
    }

    pub(crate) fn put_instance(&mut self, instance: NodeInstance) {
        self.instances.insert(instance.instance_id, instance);
    }

    pub(crate) fn push_revision(&mut self, revision: FormRevision) {
        self.revisions
            .entry(revision.instance_id)
            .or_default()
            .push_back(revision);
    }

    pub(crate) fn insert_slot(&mut self, slot: Slot) {
        self.instance_slots
            .entry(slot.instance_id)
            .or_default()
            .push_back(slot.slot_id);
        self.slots.insert(slot.slot_id, slot);
    }

    pub(crate) fn insert_attachment(&mut self, attachment: Attachment) {
        self.slot_attachments
            .entry(attachment.slot_id)
            .or_default()
            .push_back(attachment.attachment_id);
        self.attachments.insert(attachment.attachment_id, attachment);
    }

    pub(crate) fn put_attachment(&mut self, attachment: Attachment) {
        self.attachments.insert(attachment.attachment_id, attachment);
    }

    pub(crate) fn push_outcome(&mut self, outcome: Outcome) {
        self.outcomes
            .entry(outcome.instance_id)
            .or_default()
            .push_back(outcome);
    }

    pub(crate) fn append_event(
        &mut self,
        instance: InstanceId,
        event_type: EventType,
        actor: Option<UserId>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Event {
        let log = self.events.entry(instance).or_default();
        let event = chain_event(log.last(), instance, event_type, actor, payload, now);
        log.push_back(event.clone());
        event
    }

    pub(crate) fn upsert_projection(&mut self, row: ProjectionRow) {
        self.projection
            .insert((row.tenant_id, row.student_id, row.node_id.clone()), row);
    }

    pub(crate) fn remove_projection(&mut self, tenant: TenantId, student: UserId, node: &NodeId) {
        self.projection.remove(&(tenant, student, node.clone()));
    }
}

/// Mutable view handed to a transaction body
pub struct Tx<'a> {
    tables: &'a mut Tables,
    outbox: Vec<Notification>,
    now: DateTime<Utc>,
}

impl Tx<'_> {
    /// Commit timestamp shared by every write in this transaction
    #[inline]
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Queue a notification for dispatch after commit
    pub fn notify(&mut self, notification: Notification) {
        self.outbox.push(notification);
    }
}

impl std::ops::Deref for Tx<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        self.tables
    }
}

impl std::ops::DerefMut for Tx<'_> {
    fn deref_mut(&mut self) -> &mut Tables {
        self.tables
    }
}

/// Result of a committed transaction plus its outbox
#[derive(Debug)]
pub(crate) struct Committed<T> {
    pub value: T,
    pub outbox: Vec<Notification>,
}

/// Timestamp for a commit that reads `read` after the one stamped `last`
fn commit_time(read: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match last {
        Some(prev) if read <= prev => prev + Duration::microseconds(1),
        _ => read,
    }
}

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    /// Guards writers; holds the timestamp of the last commit
    commit: Mutex<Option<DateTime<Utc>>>,
    injected_failures: AtomicU32,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent point-in-time copy of every table
    #[must_use]
    pub fn snapshot(&self) -> Tables {
        self.tables.read().clone()
    }

    /// Make the next `n` commits fail with `Transient`
    pub fn fail_next_commits(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn transaction<T, F>(
        &self,
        cancel: &Cancellation,
        clock: &dyn Clock,
        body: &mut F,
    ) -> Result<Committed<T>>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T>,
    {
        let mut last_commit = self.commit.lock();
        cancel.check()?;
        let now = commit_time(clock.now(), *last_commit);

        let mut working = self.tables.read().clone();
        let mut tx = Tx {
            tables: &mut working,
            outbox: Vec::new(),
            now,
        };
        let value = body(&mut tx)?;
        let outbox = tx.outbox;

        cancel.check()?;
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(JourneyError::Transient("commit failed".to_string()));
        }

        *self.tables.write() = working;
        *last_commit = Some(now);
        Ok(Committed { value, outbox })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::SystemClock;
    use crate::types::NodeState;
    use journey_playbook::PlaybookVersionId;

    fn instance(tenant: TenantId, student: UserId, node: &str) -> NodeInstance {
        let now = Utc::now();
        NodeInstance {
            instance_id: InstanceId::new(),
            tenant_id: tenant,
            student_id: student,
            node_id: NodeId::new(node),
            playbook_version_id: PlaybookVersionId::derive(tenant, "x"),
            state: NodeState::Active,
            current_rev: 0,
            locale: None,
            opened_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn body_error_discards_writes() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let student = UserId::new();
        let result: Result<Committed<()>> = store.transaction(&Cancellation::new(), &SystemClock, &mut |tx| {
            tx.insert_instance(instance(tenant, student, "A"))?;
            Err(JourneyError::Invalid("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.snapshot().students(tenant).is_empty());
    }

    #[test]
    fn injected_failure_is_transient_and_consumed() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let student = UserId::new();
        store.fail_next_commits(1);
        let mut body = |tx: &mut Tx<'_>| tx.insert_instance(instance(tenant, student, "A"));
        let first = store.transaction(&Cancellation::new(), &SystemClock, &mut body);
        assert!(matches!(first, Err(JourneyError::Transient(_))));
        assert!(store.snapshot().students(tenant).is_empty());

        let second = store.transaction(&Cancellation::new(), &SystemClock, &mut body);
        assert!(second.is_ok());
        assert_eq!(store.snapshot().students(tenant), vec![student]);
    }

    #[test]
    fn instance_key_is_unique() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let student = UserId::new();
        let result: Result<()> = store
            .transaction(&Cancellation::new(), &SystemClock, &mut |tx| {
                tx.insert_instance(instance(tenant, student, "A"))?;
                tx.insert_instance(instance(tenant, student, "A"))
            })
            .map(|c| c.value);
        assert!(matches!(result, Err(JourneyError::Conflict(_))));
    }

    #[test]
    fn cancelled_token_aborts_before_body() {
        let store = MemoryStore::new();
        let cancel = Cancellation::new();
        cancel.cancel();
        let mut ran = false;
        let result = store.transaction(&cancel, &SystemClock, &mut |_tx| {
            ran = true;
            Ok(())
        });
        assert_eq!(result.map(|c| c.value), Err(JourneyError::Cancelled));
        assert!(!ran);
    }

    struct FrozenClock(DateTime<Utc>);

    impl Clock for FrozenClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn commit_times_strictly_increase() {
        let store = MemoryStore::new();
        let clock = FrozenClock(Utc::now());
        let mut stamps = Vec::new();
        for _ in 0..3 {
            let stamped = store
                .transaction(&Cancellation::new(), &clock, &mut |tx| Ok(tx.now()))
                .map(|c| c.value);
            stamps.push(stamped.unwrap());
        }
        assert_eq!(stamps[0], clock.0);
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn failed_commit_leaves_last_stamp() {
        let store = MemoryStore::new();
        let clock = FrozenClock(Utc::now());
        store.fail_next_commits(1);
        let failed = store.transaction(&Cancellation::new(), &clock, &mut |tx| Ok(tx.now()));
        assert!(failed.is_err());
        let stamped = store
            .transaction(&Cancellation::new(), &clock, &mut |tx| Ok(tx.now()))
            .map(|c| c.value);
        assert_eq!(stamped, Ok(clock.0));
    }

    #[test]
    fn clock_behind_last_commit_is_clamped() {
        let t0 = Utc::now();
        assert_eq!(commit_time(t0, None), t0);
        assert_eq!(
            commit_time(t0 - Duration::days(1), Some(t0)),
            t0 + Duration::microseconds(1)
        );
        assert_eq!(commit_time(t0 + Duration::seconds(1), Some(t0)), t0 + Duration::seconds(1));
    }
}
