//! Engine configuration

use journey_playbook::NodeId;
use serde::{Deserialize, Serialize};

/// Default upload limit (50 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Tunables and reserved node identifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Node whose form submissions are mirrored into the student record
    pub profile_node: NodeId,
    /// Node counted by the compliance view
    pub antiplag_node: NodeId,
    /// Scalar form fields copied to the student record from the profile node
    pub mirrored_profile_fields: Vec<String>,
    pub max_upload_bytes: u64,
    /// Whether a `skipped` node counts as a satisfied prerequisite
    pub skipped_satisfies_prerequisites: bool,
    /// Extra delivery attempts for a failed notification
    pub notify_retry_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile_node: NodeId::new("S1_profile"),
            antiplag_node: NodeId::new("S1_antiplag"),
            mirrored_profile_fields: ["program", "specialty", "department", "cohort"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            skipped_satisfies_prerequisites: false,
            notify_retry_attempts: 1,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_profile_node(mut self, node: impl Into<String>) -> Self {
        self.profile_node = NodeId::new(node);
        self
    }

    #[must_use]
    pub fn with_antiplag_node(mut self, node: impl Into<String>) -> Self {
        self.antiplag_node = NodeId::new(node);
        self
    }

    #[must_use]
    pub fn with_mirrored_profile_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mirrored_profile_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_skipped_satisfies_prerequisites(mut self, enabled: bool) -> Self {
        self.skipped_satisfies_prerequisites = enabled;
        self
    }

    #[must_use]
    pub fn with_notify_retry_attempts(mut self, attempts: u32) -> Self {
        self.notify_retry_attempts = attempts;
        self
    }
}
