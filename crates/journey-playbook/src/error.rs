//! Error types for playbook loading
//!
//! Every variant describes why a definition cannot be published:
//! - Malformed input (parse, io)
//! - Broken references between nodes
//! - Inconsistent worlds or slot declarations
//! - Prerequisite cycles

use crate::ids::{NodeId, PlaybookVersionId, WorldId};

/// Playbook integrity and loading errors
#[derive(Debug, thiserror::Error)]
pub enum PlaybookError {
    /// Definition is not valid JSON or does not match the schema
    #[error("malformed playbook: {0}")]
    Parse(#[from] serde_json::Error),

    /// Definition file could not be read
    #[error("cannot read playbook: {0}")]
    Io(#[from] std::io::Error),

    /// A prerequisite or successor names a node that does not exist
    #[error("node '{node}' references unknown node '{missing}'")]
    UnknownReference { node: NodeId, missing: NodeId },

    /// The same node id appears twice
    #[error("duplicate node id '{0}'")]
    DuplicateNode(NodeId),

    /// The same world id appears twice
    #[error("duplicate world id '{0}'")]
    DuplicateWorld(WorldId),

    /// A world declares no nodes
    #[error("world '{0}' has no nodes")]
    EmptyWorld(WorldId),

    /// Analytics hints reference a world that is not declared
    #[error("analytics references unknown world '{0}'")]
    UnknownWorld(WorldId),

    /// Two upload slots inside one node share a key
    #[error("node '{node}' declares slot '{slot_key}' more than once")]
    DuplicateSlot { node: NodeId, slot_key: String },

    /// Prerequisites form a cycle
    #[error("prerequisite cycle through node '{0}'")]
    Cycle(NodeId),

    /// Required top-level field is empty
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Version id is not published in the catalog
    #[error("unknown playbook version {0}")]
    UnknownVersion(PlaybookVersionId),
}

impl PlaybookError {
    /// Whether the error is caused by the definition itself (as opposed to I/O)
    #[inline]
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::UnknownVersion(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_both_nodes() {
        let err = PlaybookError::UnknownReference {
            node: NodeId::new("C"),
            missing: NodeId::new("Z"),
        };
        assert_eq!(err.to_string(), "node 'C' references unknown node 'Z'");
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn io_is_not_integrity() {
        let err = PlaybookError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        assert!(!err.is_integrity_failure());
    }
}
