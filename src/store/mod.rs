//! Node store gateway: the narrow persistence contract the engine runs on.
//!
//! A [`NodeStore`] hands out [`StoreTransaction`]s bound to one scope. Every
//! read and write goes through the transaction, so nothing a mutation does is
//! visible until [`StoreTransaction::commit`]; dropping or rolling back a
//! transaction discards all of its writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::boundary::Shift;
use crate::error::NestedSetError;
use crate::node::{Boundary, Node, NodeId, NodeSlot, Scope};
use crate::query::NodeFilter;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, MemoryTransaction};
pub use postgres::{PostgresStore, PostgresTransaction};

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Payload handed to [`StoreTransaction::insert_node`] for a new row.
    type Draft: Send + 'static;
    type Transaction: StoreTransaction<Draft = Self::Draft>;

    /// Open a write transaction holding the scope's serialization lock.
    async fn begin(&self, scope: &Scope) -> Result<Self::Transaction, NestedSetError>;

    /// Open a read transaction; takes no lock.
    async fn begin_read(&self, scope: &Scope) -> Result<Self::Transaction, NestedSetError>;

    /// Every scope that currently holds at least one row.
    async fn scopes(&self) -> Result<Vec<Scope>, NestedSetError>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    type Draft: Send + 'static;

    fn scope(&self) -> &Scope;

    /// Fetch one row, soft-deleted or not.
    ///
    /// Fails with `NotFound` when the id is unknown and `ScopeMismatch` when it
    /// lives in another scope.
    async fn read_node(&mut self, id: NodeId) -> Result<Node, NestedSetError>;

    /// Rows whose interval overlaps `[lft_min, rgt_max]`, soft-deleted rows
    /// included, ordered by `lft`.
    async fn read_range(
        &mut self,
        lft_min: Boundary,
        rgt_max: Boundary,
    ) -> Result<Vec<Node>, NestedSetError>;

    /// Rows matching `filter`, ordered by `lft`.
    async fn select(&mut self, filter: &NodeFilter) -> Result<Vec<Node>, NestedSetError>;

    async fn count(&mut self, filter: &NodeFilter) -> Result<u64, NestedSetError>;

    /// Largest `rgt` in the scope, `0` when empty.
    async fn max_rgt(&mut self) -> Result<Boundary, NestedSetError>;

    /// Most recent soft-delete marker in the scope.
    async fn latest_deletion(&mut self) -> Result<Option<DateTime<Utc>>, NestedSetError>;

    /// Apply one bulk boundary update; returns the number of rows touched.
    async fn shift_boundaries(&mut self, shift: Shift) -> Result<u64, NestedSetError>;

    /// Upsert the structural columns (`parent_id`, `lft`, `rgt`, deletion
    /// marker) of `node`.
    async fn write_node(&mut self, node: &Node) -> Result<(), NestedSetError>;

    /// Insert a new row built from `draft` at `slot`.
    async fn insert_node(
        &mut self,
        draft: Self::Draft,
        slot: NodeSlot,
    ) -> Result<Node, NestedSetError>;

    /// Remove every row whose `lft` lies in `[lft, rgt]`.
    async fn delete_range(&mut self, lft: Boundary, rgt: Boundary)
        -> Result<u64, NestedSetError>;

    async fn delete_node(&mut self, id: NodeId) -> Result<u64, NestedSetError>;

    /// Stamp `marker` on every live row whose `lft` lies in `[lft, rgt]`.
    async fn mark_deleted(
        &mut self,
        lft: Boundary,
        rgt: Boundary,
        marker: DateTime<Utc>,
    ) -> Result<u64, NestedSetError>;

    /// Clear the deletion marker on rows in `[lft, rgt]` stamped with `marker`.
    async fn clear_deleted(
        &mut self,
        lft: Boundary,
        rgt: Boundary,
        marker: DateTime<Utc>,
    ) -> Result<u64, NestedSetError>;

    async fn commit(self) -> Result<(), NestedSetError>;

    async fn rollback(self) -> Result<(), NestedSetError>;
}
