//! Nested set (`lft`/`rgt` interval) trees.
//!
//! Every node carries two boundaries such that a descendant's interval lies
//! strictly inside its ancestor's, so ancestor, descendant and subtree queries
//! are single range scans. [`NestedSetRepository`] keeps that encoding intact
//! under inserts, moves and deletes, rebuilds trees from flat parent lists and
//! detects or repairs corruption.
//!
//! Storage is abstracted behind [`NodeStore`]: [`MemoryStore`] keeps trees in
//! process memory, [`PostgresStore`] drives a SeaORM entity deriving
//! [`NestedSetModel`].

pub mod boundary;
pub mod builder;
pub mod column;
pub mod config;
pub mod error;
pub mod lock;
pub mod mutator;
pub mod node;
pub mod query;
pub mod rebuild;
pub mod repository;
pub mod store;
pub mod traits;
pub mod validate;

pub mod prelude {
    //! Convenient re-exports for consumers.
    pub use crate::config::{AdvisoryLockStrategy, NestedSetConfig, NestedSetOptions, RootPolicy};
    pub use crate::mutator::{DeleteMode, Placement};
    pub use crate::node::{FlatNode, Node, NodeId, Scope, ScopeValue, TreeNode};
    pub use crate::repository::NestedSetRepository;
    pub use crate::store::{MemoryStore, NodeStore, PostgresStore, StoreTransaction};
    pub use crate::traits::NestedSetModel;
}

#[doc(hidden)]
pub mod __private {
    pub use chrono::{DateTime, Utc};
    pub use once_cell::sync::Lazy;
}

pub use nested_set_macros::NestedSetModel as NestedSetModelDerive;
#[doc(hidden)]
pub use nested_set_macros::NestedSetModel;

pub use builder::{assign_boundaries, BuildOptions, CyclePolicy, Layout, OrphanPolicy};
pub use config::{
    AdvisoryLockKey, AdvisoryLockStrategy, NestedSetConfig, NestedSetOptions, RootPolicy,
};
pub use error::NestedSetError;
pub use mutator::{DeleteMode, Placement};
pub use node::{Boundary, FlatNode, Node, NodeId, NodeSlot, Scope, ScopeValue, TreeNode};
pub use rebuild::RebuildReport;
pub use repository::NestedSetRepository;
pub use store::{MemoryStore, NodeStore, PostgresStore, StoreTransaction};
pub use traits::NestedSetModel;
pub use validate::ErrorCounts;
