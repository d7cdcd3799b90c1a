//! Testing utilities for the journey workspace
//!
//! Sample playbooks, a settable clock, and a harness wiring an engine to
//! in-memory collaborators.

#![allow(missing_docs)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use journey_core::collab::{Clock, InMemoryDirectory, InMemoryDocuments, StudentRecord};
use journey_core::config::EngineConfig;
use journey_core::notify::RecordingNotifier;
use journey_core::{
    Actor, AttachRequest, Attachment, DocumentVersionId, JourneyEngine, NodeState, PatchState,
    Result, StatePatched, TargetState, UserId,
};
use journey_playbook::{NodeId, Playbook, PlaybookCatalog, TenantId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A, B and C in one world; C waits on both A and B
pub const LINEAR: &str = r#"{
    "playbook_id": "linear",
    "version": "1.0.0",
    "worlds": [
        {"id": "W1", "nodes": [
            {"id": "A", "title": {"en": "Step A"}, "next": ["C"]},
            {"id": "B", "title": {"en": "Step B"}, "next": ["C"]},
            {"id": "C", "title": {"en": "Step C"}, "prerequisites": ["A", "B"]}
        ]}
    ]
}"#;

/// N requires one file in slot `k`; M follows N
pub const SINGLE_SLOT: &str = r#"{
    "playbook_id": "single-slot",
    "version": "1.0.0",
    "worlds": [
        {"id": "W1", "nodes": [
            {"id": "N", "title": {"en": "Upload thesis", "ru": "Загрузка"},
             "next": ["M"],
             "requirements": {
                "uploads": [{"key": "k", "required": true, "mime": ["application/pdf"]}],
                "form": {"type": "object"}
             }},
            {"id": "M", "title": {"en": "Follow-up"}, "prerequisites": ["N"]}
        ]}
    ]
}"#;

/// N requires single files in slots `a` and `b` and takes any number in
/// `c`; M follows N
pub const MULTI_SLOT: &str = r#"{
    "playbook_id": "multi-slot",
    "version": "1.0.0",
    "worlds": [
        {"id": "W1", "nodes": [
            {"id": "N", "title": {"en": "Dissertation package"},
             "next": ["M"],
             "requirements": {"uploads": [
                {"key": "a", "required": true, "mime": ["application/pdf"]},
                {"key": "b", "required": true, "mime": ["application/pdf"]},
                {"key": "c", "multiplicity": "many"}
             ]}},
            {"id": "M", "title": {"en": "Follow-up"}, "prerequisites": ["N"]}
        ]}
    ]
}"#;

/// Ten nodes over three worlds; W3 holds three optional nodes and W2
/// feeds the stage median
pub const TEN_NODES: &str = r#"{
    "playbook_id": "phd-default",
    "version": "3.0.0",
    "analytics": {"optional_world": "W3", "median_world": "W2"},
    "worlds": [
        {"id": "W1", "nodes": [
            {"id": "S1_profile", "title": {"en": "Profile"}},
            {"id": "S1_antiplag", "title": {"en": "Antiplagiarism"}, "prerequisites": ["S1_profile"]},
            {"id": "W1_plan", "title": {"en": "Study plan"}, "prerequisites": ["S1_antiplag"]},
            {"id": "W1_seminar", "title": {"en": "Seminar"}, "prerequisites": ["W1_plan"]}
        ]},
        {"id": "W2", "nodes": [
            {"id": "W2_proposal", "title": {"en": "Proposal"}, "prerequisites": ["W1_seminar"]},
            {"id": "W2_article", "title": {"en": "Article"}, "prerequisites": ["W2_proposal"]},
            {"id": "W2_defense", "title": {"en": "Pre-defense"}, "prerequisites": ["W2_article"]}
        ]},
        {"id": "W3", "nodes": [
            {"id": "W3_rp1", "prerequisites": ["W2_defense"]},
            {"id": "W3_rp2", "prerequisites": ["W3_rp1"]},
            {"id": "W3_rp3", "prerequisites": ["W3_rp2"]}
        ]}
    ]
}"#;

/// Clock that only moves when told to
///
/// [`ManualClock::stall_next_read`] makes the next reader sleep after
/// taking its reading, which lets tests hold a writer between reading the
/// time and using it.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    stall: Mutex<Option<std::time::Duration>>,
    stalls: AtomicUsize,
}

impl ManualClock {
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            stall: Mutex::new(None),
            stalls: AtomicUsize::new(0),
        }
    }

    pub fn stall_next_read(&self, pause: std::time::Duration) {
        *self.stall.lock() = Some(pause);
    }

    /// Number of stalled reads started so far
    #[must_use]
    pub fn stalls_started(&self) -> usize {
        self.stalls.load(Ordering::SeqCst)
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(epoch())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let now = *self.now.lock();
        let pause = self.stall.lock().take();
        if let Some(pause) = pause {
            self.stalls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(pause);
        }
        now
    }
}

/// Fixed start instant for harness clocks
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Engine plus handles to every in-memory collaborator
pub struct Harness {
    pub engine: JourneyEngine,
    pub catalog: Arc<PlaybookCatalog>,
    pub playbook: Arc<Playbook>,
    pub tenant: TenantId,
    pub directory: Arc<InMemoryDirectory>,
    pub documents: Arc<InMemoryDocuments>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    /// Harness with `playbook_json` published and active
    ///
    /// # Panics
    ///
    /// Panics if the playbook does not load.
    #[must_use]
    pub fn new(playbook_json: &str) -> Self {
        Self::with_config(playbook_json, EngineConfig::default())
    }

    /// # Panics
    ///
    /// Panics if the playbook does not load.
    #[must_use]
    pub fn with_config(playbook_json: &str, config: EngineConfig) -> Self {
        journey_core::telemetry::init_tracing("warn");
        let tenant = TenantId::new();
        let catalog = Arc::new(PlaybookCatalog::new());
        let playbook = catalog.publish_active(
            Playbook::from_json_str(tenant, playbook_json).expect("sample playbook loads"),
        );
        let directory = Arc::new(InMemoryDirectory::new());
        let documents = Arc::new(InMemoryDocuments::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::default());
        let engine = JourneyEngine::builder(Arc::clone(&catalog))
            .config(config)
            .in_memory_directory(Arc::clone(&directory))
            .documents(documents.clone())
            .notifier(notifier.clone())
            .clock(clock.clone())
            .build();
        Self {
            engine,
            catalog,
            playbook,
            tenant,
            directory,
            documents,
            notifier,
            clock,
        }
    }

    /// Register a student record and return its id
    #[must_use]
    pub fn student(&self, name: &str) -> UserId {
        self.enroll(StudentRecord::new(
            UserId::new(),
            name,
            format!("{}@uni.example", name.to_lowercase()),
        ))
    }

    pub fn enroll(&self, record: StudentRecord) -> UserId {
        let id = record.id;
        self.directory.add_student(self.tenant, record);
        id
    }

    /// New advisor linked to `student`
    #[must_use]
    pub fn advisor_for(&self, student: UserId) -> Actor {
        let advisor = UserId::new();
        self.directory.link(self.tenant, advisor, student);
        Actor::advisor(advisor)
    }

    #[must_use]
    pub fn admin(&self) -> Actor {
        Actor::admin(UserId::new())
    }

    /// A registered document version
    #[must_use]
    pub fn document(&self) -> DocumentVersionId {
        let document = DocumentVersionId::new();
        self.documents.register(self.tenant, document);
        document
    }

    pub fn patch(
        &self,
        student: UserId,
        actor: Actor,
        node: &str,
        target: NodeState,
    ) -> Result<StatePatched> {
        self.engine.patch_state(PatchState {
            tenant: self.tenant,
            student,
            actor,
            node: NodeId::new(node),
            target: TargetState::Node(target),
            expected_version: None,
        })
    }

    /// Upload `filename` as a fresh registered document into `slot_key` of
    /// the student's `node` instance
    pub fn upload(
        &self,
        student: UserId,
        node: &str,
        slot_key: &str,
        filename: &str,
    ) -> Result<Attachment> {
        let instance = self
            .engine
            .ensure_instance(self.tenant, student, &NodeId::new(node), None)?;
        let slot = self.engine.get_slot(instance.instance_id, slot_key)?;
        self.engine.attach(AttachRequest {
            slot_id: slot.slot_id,
            document_version_id: self.document(),
            filename: filename.to_string(),
            size_bytes: 100,
            mime: Some("application/pdf".to_string()),
            actor: Actor::student(student),
        })
    }

    /// Drive `node` to `done` through `under_review` as `reviewer`
    pub fn complete(&self, student: UserId, reviewer: Actor, node: &str) -> Result<StatePatched> {
        let current = self
            .engine
            .ensure_instance(self.tenant, student, &NodeId::new(node), None)?;
        if current.state != NodeState::UnderReview {
            self.patch(student, reviewer, node, NodeState::UnderReview)?;
        }
        self.patch(student, reviewer, node, NodeState::Done)
    }
}
