//! Indexed, validated playbook version
//!
//! A [`Playbook`] is built once from the canonical JSON definition and never
//! mutated afterwards. Construction performs every integrity check:
//! - Unique world and node ids, no empty worlds
//! - Every prerequisite and successor resolves inside the version
//! - Slot keys are unique per node
//! - Prerequisites are acyclic

use crate::error::PlaybookError;
use crate::ids::{NodeId, PlaybookVersionId, TenantId, WorldId};
use crate::model::{AnalyticsHints, NodeDefinition, PlaybookDefinition, UploadRequirement};
use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One immutable, published playbook version
#[derive(Debug, Clone)]
pub struct Playbook {
    version_id: PlaybookVersionId,
    tenant_id: TenantId,
    playbook_id: String,
    version: String,
    checksum: String,
    raw: serde_json::Value,
    default_locale: String,
    analytics: AnalyticsHints,
    nodes: IndexMap<NodeId, NodeDefinition>,
    node_world: HashMap<NodeId, WorldId>,
    world_nodes: IndexMap<WorldId, Vec<NodeId>>,
    successors: HashMap<NodeId, Vec<NodeId>>,
    predecessors: HashMap<NodeId, Vec<NodeId>>,
}

impl Playbook {
    /// Parse, index and validate a definition from raw JSON bytes
    pub fn from_json_bytes(tenant: TenantId, bytes: &[u8]) -> Result<Self, PlaybookError> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let definition: PlaybookDefinition = serde_json::from_value(raw.clone())?;
        let checksum = hex::encode(Sha256::digest(bytes));
        Self::build(tenant, definition, raw, checksum)
    }

    pub fn from_json_str(tenant: TenantId, json: &str) -> Result<Self, PlaybookError> {
        Self::from_json_bytes(tenant, json.as_bytes())
    }

    /// Load a definition file from disk
    pub fn from_path(tenant: TenantId, path: impl AsRef<Path>) -> Result<Self, PlaybookError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_json_bytes(tenant, &bytes)
    }

    fn build(
        tenant: TenantId,
        definition: PlaybookDefinition,
        raw: serde_json::Value,
        checksum: String,
    ) -> Result<Self, PlaybookError> {
        if definition.playbook_id.trim().is_empty() {
            return Err(PlaybookError::MissingField("playbook_id"));
        }
        if definition.worlds.is_empty() {
            return Err(PlaybookError::MissingField("worlds"));
        }

        let mut nodes = IndexMap::new();
        let mut node_world = HashMap::new();
        let mut world_nodes: IndexMap<WorldId, Vec<NodeId>> = IndexMap::new();

        for world in definition.worlds {
            if world_nodes.contains_key(&world.id) {
                return Err(PlaybookError::DuplicateWorld(world.id));
            }
            if world.nodes.is_empty() {
                return Err(PlaybookError::EmptyWorld(world.id));
            }
            let mut members = Vec::with_capacity(world.nodes.len());
            for node in world.nodes {
                if nodes.contains_key(&node.id) {
                    return Err(PlaybookError::DuplicateNode(node.id));
                }
                check_slot_keys(&node)?;
                members.push(node.id.clone());
                node_world.insert(node.id.clone(), world.id.clone());
                nodes.insert(node.id.clone(), node);
            }
            world_nodes.insert(world.id, members);
        }

        for hinted in [
            &definition.analytics.optional_world,
            &definition.analytics.median_world,
        ]
        .into_iter()
        .flatten()
        {
            if !world_nodes.contains_key(hinted) {
                return Err(PlaybookError::UnknownWorld(hinted.clone()));
            }
        }

        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut predecessors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for node in nodes.values() {
            for reference in node.prerequisites.iter().chain(node.next.iter()) {
                if !nodes.contains_key(reference) {
                    return Err(PlaybookError::UnknownReference {
                        node: node.id.clone(),
                        missing: reference.clone(),
                    });
                }
            }
            predecessors.insert(node.id.clone(), dedup(&node.prerequisites));
            successors.insert(node.id.clone(), dedup(&node.next));
        }

        // A prerequisite implies the reverse edge even when `next` omits it.
        for node in nodes.values() {
            for prerequisite in &node.prerequisites {
                let list = successors.entry(prerequisite.clone()).or_default();
                if !list.contains(&node.id) {
                    list.push(node.id.clone());
                }
            }
        }

        check_acyclic(&nodes)?;

        let version_id = PlaybookVersionId::derive(tenant, &checksum);
        tracing::debug!(
            tenant = %tenant,
            playbook = %definition.playbook_id,
            version = %definition.version,
            nodes = nodes.len(),
            worlds = world_nodes.len(),
            "playbook indexed"
        );

        Ok(Self {
            version_id,
            tenant_id: tenant,
            playbook_id: definition.playbook_id,
            version: definition.version,
            checksum,
            raw,
            default_locale: definition.locale_default,
            analytics: definition.analytics,
            nodes,
            node_world,
            world_nodes,
            successors,
            predecessors,
        })
    }

    #[inline]
    #[must_use]
    pub fn version_id(&self) -> PlaybookVersionId {
        self.version_id
    }

    #[inline]
    #[must_use]
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    #[must_use]
    pub fn playbook_id(&self) -> &str {
        &self.playbook_id
    }

    /// Semantic version string as declared in the definition
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Lowercase hex SHA-256 of the definition bytes
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// The definition exactly as parsed
    #[must_use]
    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    #[must_use]
    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }

    #[must_use]
    pub fn get_node(&self, node: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.get(node)
    }

    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    /// Node definitions in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes.values()
    }

    #[inline]
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn world_of(&self, node: &NodeId) -> Option<&WorldId> {
        self.node_world.get(node)
    }

    /// Nodes of a world in declaration order; empty for unknown worlds
    #[must_use]
    pub fn nodes_in_world(&self, world: &WorldId) -> &[NodeId] {
        self.world_nodes.get(world).map_or(&[][..], Vec::as_slice)
    }

    /// World ids in declaration order
    pub fn worlds(&self) -> impl Iterator<Item = &WorldId> {
        self.world_nodes.keys()
    }

    #[must_use]
    pub fn first_world(&self) -> Option<&WorldId> {
        self.world_nodes.keys().next()
    }

    #[must_use]
    pub fn predecessors(&self, node: &NodeId) -> &[NodeId] {
        self.predecessors.get(node).map_or(&[][..], Vec::as_slice)
    }

    #[must_use]
    pub fn successors(&self, node: &NodeId) -> &[NodeId] {
        self.successors.get(node).map_or(&[][..], Vec::as_slice)
    }

    /// Upload requirements flagged as required
    pub fn required_slots(&self, node: &NodeId) -> impl Iterator<Item = &UploadRequirement> {
        self.upload_slots(node).iter().filter(|slot| slot.required)
    }

    /// Every upload requirement of a node
    #[must_use]
    pub fn upload_slots(&self, node: &NodeId) -> &[UploadRequirement] {
        self.nodes
            .get(node)
            .map_or(&[][..], NodeDefinition::uploads)
    }

    #[must_use]
    pub fn form_schema(&self, node: &NodeId) -> Option<&serde_json::Value> {
        self.nodes
            .get(node)
            .and_then(|n| n.requirements.as_ref())
            .and_then(|r| r.form.as_ref())
    }

    /// Localized title, falling back to the default locale, then the node id
    #[must_use]
    pub fn title(&self, node: &NodeId, locale: Option<&str>) -> String {
        let Some(definition) = self.nodes.get(node) else {
            return node.to_string();
        };
        locale
            .and_then(|l| definition.title.get(l))
            .or_else(|| definition.title.get(&self.default_locale))
            .cloned()
            .unwrap_or_else(|| node.to_string())
    }

    #[must_use]
    pub fn optional_world(&self) -> Option<&WorldId> {
        self.analytics.optional_world.as_ref()
    }

    #[must_use]
    pub fn median_world(&self) -> Option<&WorldId> {
        self.analytics.median_world.as_ref()
    }
}

fn dedup(ids: &[NodeId]) -> Vec<NodeId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().filter(|id| seen.insert(*id)).cloned().collect()
}

fn check_slot_keys(node: &NodeDefinition) -> Result<(), PlaybookError> {
    let mut keys = HashSet::new();
    for slot in node.uploads() {
        if !keys.insert(slot.key.as_str()) {
            return Err(PlaybookError::DuplicateSlot {
                node: node.id.clone(),
                slot_key: slot.key.clone(),
            });
        }
    }
    Ok(())
}

fn check_acyclic(nodes: &IndexMap<NodeId, NodeDefinition>) -> Result<(), PlaybookError> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for node in nodes.values() {
        graph.add_node(node.id.as_str());
        for prerequisite in &node.prerequisites {
            if prerequisite == &node.id {
                return Err(PlaybookError::Cycle(node.id.clone()));
            }
            graph.add_edge(prerequisite.as_str(), node.id.as_str(), ());
        }
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| PlaybookError::Cycle(NodeId::new(cycle.node_id())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"{
        "playbook_id": "phd",
        "version": "1.0.0",
        "locale_default": "ru",
        "worlds": [
            {"id": "W1", "nodes": [
                {"id": "A", "title": {"ru": "А", "en": "A"}, "next": ["C"]},
                {"id": "B", "next": ["C"]},
                {"id": "C", "prerequisites": ["A", "B"],
                 "requirements": {"uploads": [{"key": "k", "required": true}],
                                  "form": {"fields": []}}}
            ]}
        ]
    }"#;

    #[test]
    fn indexes_graph() {
        let pb = Playbook::from_json_str(TenantId::new(), LINEAR).unwrap();
        let c = NodeId::new("C");
        assert_eq!(pb.node_count(), 3);
        assert_eq!(pb.predecessors(&c), &[NodeId::new("A"), NodeId::new("B")]);
        assert_eq!(pb.successors(&NodeId::new("A")), &[c.clone()]);
        assert_eq!(pb.world_of(&c), Some(&WorldId::new("W1")));
        assert_eq!(pb.required_slots(&c).count(), 1);
        assert!(pb.form_schema(&c).is_some());
        assert_eq!(pb.first_world(), Some(&WorldId::new("W1")));
    }

    #[test]
    fn title_falls_back_to_default_locale_then_id() {
        let pb = Playbook::from_json_str(TenantId::new(), LINEAR).unwrap();
        assert_eq!(pb.title(&NodeId::new("A"), Some("kz")), "А");
        assert_eq!(pb.title(&NodeId::new("A"), Some("en")), "A");
        assert_eq!(pb.title(&NodeId::new("B"), None), "B");
    }

    #[test]
    fn prerequisite_implies_successor() {
        let json = r#"{"playbook_id":"p","version":"1","worlds":[{"id":"W1","nodes":[
            {"id":"A"},{"id":"B","prerequisites":["A"]}]}]}"#;
        let pb = Playbook::from_json_str(TenantId::new(), json).unwrap();
        assert_eq!(pb.successors(&NodeId::new("A")), &[NodeId::new("B")]);
    }

    #[test]
    fn checksum_is_hex_sha256() {
        let pb = Playbook::from_json_str(TenantId::new(), LINEAR).unwrap();
        assert_eq!(pb.checksum().len(), 64);
        assert!(pb.checksum().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_unknown_reference() {
        let json = r#"{"playbook_id":"p","version":"1","worlds":[{"id":"W1","nodes":[
            {"id":"A","next":["Z"]}]}]}"#;
        let err = Playbook::from_json_str(TenantId::new(), json).unwrap_err();
        assert!(matches!(err, PlaybookError::UnknownReference { .. }));
    }

    #[test]
    fn rejects_self_prerequisite() {
        let json = r#"{"playbook_id":"p","version":"1","worlds":[{"id":"W1","nodes":[
            {"id":"A","prerequisites":["A"]}]}]}"#;
        let err = Playbook::from_json_str(TenantId::new(), json).unwrap_err();
        assert!(matches!(err, PlaybookError::Cycle(_)));
    }
}
