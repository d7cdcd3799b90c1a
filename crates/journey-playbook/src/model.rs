//! Canonical playbook definition as published by program administrators
//!
//! These types mirror the JSON document one-to-one. Indexing and integrity
//! checks live in [`crate::playbook`].

use crate::ids::{NodeId, WorldId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw playbook document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    /// Program identifier
    pub playbook_id: String,
    /// Semantic version string
    pub version: String,
    /// Locale used when a title has no entry for the requested one
    #[serde(default = "default_locale")]
    pub locale_default: String,
    /// World labels used by derived views
    #[serde(default)]
    pub analytics: AnalyticsHints,
    /// Ordered phases
    pub worlds: Vec<WorldDefinition>,
}

fn default_locale() -> String {
    "en".to_string()
}

/// Which worlds derived views treat specially
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsHints {
    /// World excluded from progress when the student's profile does not require it
    #[serde(default)]
    pub optional_world: Option<WorldId>,
    /// World whose completion time feeds the stage median
    #[serde(default)]
    pub median_world: Option<WorldId>,
}

/// One phase of the program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldDefinition {
    pub id: WorldId,
    #[serde(default)]
    pub title: BTreeMap<String, String>,
    pub nodes: Vec<NodeDefinition>,
}

/// One step of the program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    /// Locale-keyed title
    #[serde(default)]
    pub title: BTreeMap<String, String>,
    /// Free-form node kind used by clients (form, upload, confirm, ...)
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Nodes that must be `done` before this one activates
    #[serde(default)]
    pub prerequisites: Vec<NodeId>,
    /// Nodes evaluated for activation once this one completes
    #[serde(default)]
    pub next: Vec<NodeId>,
    #[serde(default)]
    pub requirements: Option<Requirements>,
    /// Role-specific presentation overrides, passed through untouched
    #[serde(default)]
    pub role_overrides: BTreeMap<String, serde_json::Value>,
}

impl NodeDefinition {
    /// Upload requirements, empty when the node declares none
    #[must_use]
    pub fn uploads(&self) -> &[UploadRequirement] {
        self.requirements
            .as_ref()
            .map_or(&[][..], |r| r.uploads.as_slice())
    }
}

/// What a node asks the student to provide
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub uploads: Vec<UploadRequirement>,
    /// Opaque form schema rendered by clients
    #[serde(default, alias = "form_schema")]
    pub form: Option<serde_json::Value>,
}

/// A typed file slot a node requires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequirement {
    #[serde(alias = "slot_key")]
    pub key: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub multiplicity: Multiplicity,
    /// Accepted MIME types; empty accepts anything
    #[serde(default, alias = "accepted_mime")]
    pub mime: Vec<String>,
    #[serde(default)]
    pub label: BTreeMap<String, String>,
}

/// How many active attachments a slot holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    /// Exactly one active attachment; a new upload supersedes the previous
    #[default]
    Single,
    /// Any number of active attachments
    Many,
}

impl Multiplicity {
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Many => "many",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_requirement_accepts_spec_aliases() {
        let req: UploadRequirement = serde_json::from_str(
            r#"{"slot_key":"k","required":true,"multiplicity":"many","accepted_mime":["application/pdf"]}"#,
        )
        .unwrap();
        assert_eq!(req.key, "k");
        assert!(req.required);
        assert_eq!(req.multiplicity, Multiplicity::Many);
        assert_eq!(req.mime, vec!["application/pdf".to_string()]);
    }

    #[test]
    fn node_without_requirements_has_no_uploads() {
        let node: NodeDefinition = serde_json::from_str(r#"{"id":"A"}"#).unwrap();
        assert!(node.uploads().is_empty());
        assert!(node.prerequisites.is_empty());
    }
}
