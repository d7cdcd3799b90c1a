//! External collaborators consumed by the engine
//!
//! The engine only reads through these traits:
//! - [`AdvisorLinks`]: which advisors may act on a student
//! - [`StudentDirectory`]: student records for monitor views
//! - [`DocumentRegistry`]: existence of uploaded document versions
//! - [`ProfileMirror`]: best-effort copy of profile fields
//! - [`Clock`]: wall time
//!
//! [`InMemoryDirectory`] and [`InMemoryDocuments`] back embedding and tests.

use crate::types::{DocumentVersionId, UserId};
use chrono::{DateTime, Utc};
use journey_playbook::TenantId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Failure reported by a collaborator hook
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub trait AdvisorLinks: Send + Sync {
    fn is_linked(&self, tenant: TenantId, advisor: UserId, student: UserId) -> bool;

    fn advisors_of(&self, tenant: TenantId, student: UserId) -> Vec<UserId>;
}

/// Student row as listed by admin monitors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub program: Option<String>,
    pub specialty: Option<String>,
    pub department: Option<String>,
    pub cohort: Option<String>,
    /// Whether the optional research world counts toward progress
    pub rp_required: bool,
}

impl StudentRecord {
    #[must_use]
    pub fn new(id: UserId, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
            program: None,
            specialty: None,
            department: None,
            cohort: None,
            rp_required: false,
        }
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
    pub fn with_rp_required(mut self, required: bool) -> Self {
        self.rp_required = required;
        self
    }

    /// Student with no directory entry
    #[must_use]
    pub fn unknown(id: UserId) -> Self {
        Self::new(id, id.to_string(), String::new())
    }
}

pub trait StudentDirectory: Send + Sync {
    fn students(&self, tenant: TenantId) -> Vec<StudentRecord>;

    fn student(&self, tenant: TenantId, student: UserId) -> Option<StudentRecord> {
        self.students(tenant).into_iter().find(|s| s.id == student)
    }
}

pub trait DocumentRegistry: Send + Sync {
    fn exists(&self, tenant: TenantId, document: DocumentVersionId) -> bool;
}

/// Receives scalar profile fields saved on the profile node
pub trait ProfileMirror: Send + Sync {
    fn mirror(
        &self,
        tenant: TenantId,
        student: UserId,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), HookError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    students: HashMap<TenantId, BTreeMap<UserId, StudentRecord>>,
    links: HashSet<(TenantId, UserId, UserId)>,
    mirror_failures: u32,
}

/// Student directory, advisor links and profile mirror held in memory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_student(&self, tenant: TenantId, record: StudentRecord) {
        self.state
            .write()
            .students
            .entry(tenant)
            .or_default()
            .insert(record.id, record);
    }

    pub fn link(&self, tenant: TenantId, advisor: UserId, student: UserId) {
        self.state.write().links.insert((tenant, advisor, student));
    }

    pub fn unlink(&self, tenant: TenantId, advisor: UserId, student: UserId) {
        self.state.write().links.remove(&(tenant, advisor, student));
    }

    /// Make the next `n` profile mirror calls fail
    pub fn fail_next_mirrors(&self, n: u32) {
        self.state.write().mirror_failures = n;
    }
}

impl AdvisorLinks for InMemoryDirectory {
    fn is_linked(&self, tenant: TenantId, advisor: UserId, student: UserId) -> bool {
        self.state.read().links.contains(&(tenant, advisor, student))
    }

    fn advisors_of(&self, tenant: TenantId, student: UserId) -> Vec<UserId> {
        let mut advisors: Vec<UserId> = self
            .state
            .read()
            .links
            .iter()
            .filter(|(t, _, s)| *t == tenant && *s == student)
            .map(|(_, advisor, _)| *advisor)
            .collect();
        advisors.sort();
        advisors
    }
}

impl StudentDirectory for InMemoryDirectory {
    fn students(&self, tenant: TenantId) -> Vec<StudentRecord> {
        self.state
            .read()
            .students
            .get(&tenant)
            .map(|students| students.values().cloned().collect())
            .unwrap_or_default()
    }

    fn student(&self, tenant: TenantId, student: UserId) -> Option<StudentRecord> {
        self.state
            .read()
            .students
            .get(&tenant)
            .and_then(|students| students.get(&student))
            .cloned()
    }
}

impl ProfileMirror for InMemoryDirectory {
    fn mirror(
        &self,
        tenant: TenantId,
        student: UserId,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), HookError> {
        let mut state = self.state.write();
        if state.mirror_failures > 0 {
            state.mirror_failures -= 1;
            return Err(HookError::new("user record unavailable"));
        }
        let record = state
            .students
            .entry(tenant)
            .or_default()
            .entry(student)
            .or_insert_with(|| StudentRecord::unknown(student));
        for (field, value) in fields {
            let slot = match field.as_str() {
                "program" => &mut record.program,
                "specialty" => &mut record.specialty,
                "department" => &mut record.department,
                "cohort" => &mut record.cohort,
                _ => continue,
            };
            *slot = Some(value.clone());
        }
        Ok(())
    }
}

/// Document registry backed by a set of known versions
#[derive(Debug, Default)]
pub struct InMemoryDocuments {
    known: RwLock<HashSet<(TenantId, DocumentVersionId)>>,
    accept_unknown: bool,
}

impl InMemoryDocuments {
    /// Only registered versions exist
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every version exists
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            known: RwLock::default(),
            accept_unknown: true,
        }
    }

    pub fn register(&self, tenant: TenantId, document: DocumentVersionId) {
        self.known.write().insert((tenant, document));
    }
}

impl DocumentRegistry for InMemoryDocuments {
    fn exists(&self, tenant: TenantId, document: DocumentVersionId) -> bool {
        self.accept_unknown || self.known.read().contains(&(tenant, document))
    }
}
