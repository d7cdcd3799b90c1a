//! Journey Playbook - versioned program definitions
//!
//! A playbook is the immutable definition of an academic program:
//! - Worlds (phases) grouping nodes in order
//! - Nodes with prerequisites, successors and localized titles
//! - Upload slot requirements and an opaque form schema per node
//!
//! Once loaded, a [`Playbook`] is a read-only value shared by reference.
//! The [`PlaybookCatalog`] records every published version and which one is
//! active for each tenant.
//!
//! # Example
//!
//! ```rust,ignore
//! use journey_playbook::{Playbook, PlaybookCatalog, TenantId};
//!
//! let tenant = TenantId::new();
//! let playbook = Playbook::from_json_str(tenant, include_str!("playbook.json"))?;
//! let catalog = PlaybookCatalog::new();
//! let active = catalog.publish_active(playbook);
//! assert!(active.get_node(&"S1_profile".into()).is_some());
//! ```

#![allow(missing_docs)]

pub mod catalog;
pub mod error;
pub mod ids;
pub mod model;
pub mod playbook;

pub use catalog::PlaybookCatalog;
pub use error::PlaybookError;
pub use ids::{NodeId, PlaybookVersionId, TenantId, WorldId};
pub use model::{
    AnalyticsHints, Multiplicity, NodeDefinition, PlaybookDefinition, Requirements,
    UploadRequirement, WorldDefinition,
};
pub use playbook::Playbook;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
