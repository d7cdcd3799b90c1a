//! Journey Core - per-student program journey engine
//!
//! Tracks each student's progress through a versioned [`Playbook`]:
//! 1. **Instances**: one per student, node and playbook version, guarded by
//!    a role-aware transition table and an optimistic version token
//! 2. **Submissions**: append-only form revisions and file slots
//! 3. **Review**: attachment decisions that drive the node state
//! 4. **Activation**: successors open once all prerequisites are met
//! 5. **Views**: progress, stage, bottleneck and median analytics
//!
//! Every mutation commits atomically with its hash-chained audit events;
//! notifications leave only after commit.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use journey_core::prelude::*;
//!
//! let catalog = Arc::new(PlaybookCatalog::new());
//! catalog.publish_active(Playbook::from_json_str(tenant, json)?);
//! let engine = JourneyEngine::builder(catalog).build();
//!
//! let patched = engine.patch_state(PatchState {
//!     tenant,
//!     student,
//!     actor: Actor::student(student),
//!     node: "A".into(),
//!     target: TargetState::Node(NodeState::Submitted),
//!     expected_version: None,
//! })?;
//! ```
//!
//! [`Playbook`]: journey_playbook::Playbook

#![allow(missing_docs)]

// Records and rules
pub mod audit;
pub mod error;
pub mod transitions;
pub mod types;

// Storage and collaborators
pub mod cancel;
pub mod collab;
pub mod config;
pub mod notify;
pub mod store;
pub mod telemetry;

// Engine operations
pub mod activation;
pub mod api;
pub mod engine;
pub mod lifecycle;
pub mod monitor;
pub mod review;
pub mod submission;
pub mod views;

// Re-exports
pub use api::*;
pub use engine::{EngineBuilder, JourneyEngine};
pub use error::{JourneyError, Result, STATE_CONFLICT};
pub use types::*;

/// Common imports for embedding the engine
pub mod prelude {
    pub use crate::api::{
        AttachRequest, MonitorFilter, PatchState, PutSubmission, ReviewRequest,
    };
    pub use crate::cancel::Cancellation;
    pub use crate::collab::{InMemoryDirectory, InMemoryDocuments, StudentRecord};
    pub use crate::config::EngineConfig;
    pub use crate::engine::JourneyEngine;
    pub use crate::error::{JourneyError, Result};
    pub use crate::notify::{Notifier, RecordingNotifier};
    pub use crate::types::{Actor, NodeState, ReviewDecision, Role, TargetState, UserId};
    pub use journey_playbook::{NodeId, Playbook, PlaybookCatalog, TenantId};
    pub use std::sync::Arc;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
