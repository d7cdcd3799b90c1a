//! Registry of published playbook versions
//!
//! Versions are immutable and shared as `Arc<Playbook>`. Exactly one version
//! is active per tenant; switching the active version never touches existing
//! node instances, which stay bound to the version they were opened under.

use crate::error::PlaybookError;
use crate::ids::{PlaybookVersionId, TenantId};
use crate::playbook::Playbook;
use dashmap::DashMap;
use std::sync::Arc;

/// Thread-safe catalog of playbook versions
#[derive(Debug, Default)]
pub struct PlaybookCatalog {
    versions: DashMap<PlaybookVersionId, Arc<Playbook>>,
    active: DashMap<TenantId, PlaybookVersionId>,
}

impl PlaybookCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a version. Publishing identical bytes twice returns the
    /// already stored version.
    pub fn publish(&self, playbook: Playbook) -> Arc<Playbook> {
        let id = playbook.version_id();
        let entry = self
            .versions
            .entry(id)
            .or_insert_with(|| {
                tracing::info!(
                    tenant = %playbook.tenant_id(),
                    version_id = %id,
                    version = %playbook.version(),
                    "playbook published"
                );
                Arc::new(playbook)
            });
        Arc::clone(entry.value())
    }

    /// Make a published version the active one for its tenant
    pub fn activate(&self, version: PlaybookVersionId) -> Result<Arc<Playbook>, PlaybookError> {
        let playbook = self
            .version(version)
            .ok_or(PlaybookError::UnknownVersion(version))?;
        let previous = self.active.insert(playbook.tenant_id(), version);
        if previous != Some(version) {
            tracing::info!(
                tenant = %playbook.tenant_id(),
                version_id = %version,
                previous = ?previous,
                "playbook activated"
            );
        }
        Ok(playbook)
    }

    /// Publish and activate in one step
    pub fn publish_active(&self, playbook: Playbook) -> Arc<Playbook> {
        let published = self.publish(playbook);
        self.active
            .insert(published.tenant_id(), published.version_id());
        published
    }

    #[must_use]
    pub fn active(&self, tenant: TenantId) -> Option<Arc<Playbook>> {
        let id = *self.active.get(&tenant)?;
        self.version(id)
    }

    #[must_use]
    pub fn version(&self, id: PlaybookVersionId) -> Option<Arc<Playbook>> {
        self.versions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// All versions published for a tenant
    #[must_use]
    pub fn versions_of(&self, tenant: TenantId) -> Vec<Arc<Playbook>> {
        self.versions
            .iter()
            .filter(|entry| entry.value().tenant_id() == tenant)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playbook(tenant: TenantId, version: &str) -> Playbook {
        let json = format!(
            r#"{{"playbook_id":"p","version":"{version}","worlds":[{{"id":"W1","nodes":[{{"id":"A"}}]}}]}}"#
        );
        Playbook::from_json_str(tenant, &json).unwrap()
    }

    #[test]
    fn publish_is_idempotent() {
        let catalog = PlaybookCatalog::new();
        let tenant = TenantId::new();
        let a = catalog.publish(playbook(tenant, "1"));
        let b = catalog.publish(playbook(tenant, "1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(catalog.versions_of(tenant).len(), 1);
    }

    #[test]
    fn activation_is_per_tenant() {
        let catalog = PlaybookCatalog::new();
        let t1 = TenantId::new();
        let t2 = TenantId::new();
        let v1 = catalog.publish(playbook(t1, "1"));
        let v2 = catalog.publish(playbook(t1, "2"));
        assert!(catalog.active(t1).is_none());

        catalog.activate(v1.version_id()).unwrap();
        assert_eq!(catalog.active(t1).unwrap().version(), "1");
        catalog.activate(v2.version_id()).unwrap();
        assert_eq!(catalog.active(t1).unwrap().version(), "2");
        assert!(catalog.active(t2).is_none());
    }

    #[test]
    fn activating_unknown_version_fails() {
        let catalog = PlaybookCatalog::new();
        let id = PlaybookVersionId::derive(TenantId::new(), "missing");
        assert!(matches!(
            catalog.activate(id),
            Err(PlaybookError::UnknownVersion(_))
        ));
    }
}
