//! In-process store keeping each scope's rows in a vector.
//!
//! Writers serialize per scope on an async mutex; a transaction works on a
//! private copy of its scope's rows and publishes the copy on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::boundary::Shift;
use crate::error::NestedSetError;
use crate::node::{Boundary, Node, NodeId, NodeSlot, Scope};
use crate::query::NodeFilter;
use crate::store::{NodeStore, StoreTransaction};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type Tables = BTreeMap<Scope, Vec<Node>>;

struct Shared {
    tables: Mutex<Tables>,
    locks: Mutex<HashMap<Scope, Arc<AsyncMutex<()>>>>,
    /// Ids inserted by open transactions, with the scope that inserted them.
    claims: Mutex<HashMap<NodeId, Scope>>,
    next_id: AtomicI64,
    lock_timeout: Duration,
}

impl Shared {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, NestedSetError> {
        self.tables
            .lock()
            .map_err(|_| NestedSetError::invariant("memory store tables poisoned"))
    }

    fn scope_lock(&self, scope: &Scope) -> Result<Arc<AsyncMutex<()>>, NestedSetError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| NestedSetError::invariant("memory store locks poisoned"))?;
        Ok(locks.entry(scope.clone()).or_default().clone())
    }

    /// Scope of `id` outside `own`, if any.
    fn foreign_scope(&self, own: &Scope, id: NodeId) -> Result<Option<Scope>, NestedSetError> {
        let tables = self.tables()?;
        Ok(tables
            .iter()
            .filter(|(scope, _)| *scope != own)
            .find(|(_, rows)| rows.iter().any(|node| node.id == id))
            .map(|(scope, _)| scope.clone()))
    }

    /// Claim `id` for a row `scope` is about to insert. Fails when the id is
    /// committed in, or claimed by, another scope.
    fn claim(&self, scope: &Scope, id: NodeId) -> Result<(), NestedSetError> {
        let tables = self.tables()?;
        let committed = tables
            .iter()
            .filter(|(other, _)| *other != scope)
            .any(|(_, rows)| rows.iter().any(|node| node.id == id));
        let mut claims = self
            .claims
            .lock()
            .map_err(|_| NestedSetError::invariant("memory store claims poisoned"))?;
        let claimed = claims.get(&id).is_some_and(|owner| owner != scope);
        if committed || claimed {
            return Err(NestedSetError::invariant(format!("node {id} already exists")));
        }
        claims.insert(id, scope.clone());
        self.reserve_id(id);
        Ok(())
    }

    fn release(&self, ids: &[NodeId]) {
        if let Ok(mut claims) = self.claims.lock() {
            for id in ids {
                claims.remove(id);
            }
        }
    }

    fn reserve_id(&self, id: NodeId) {
        self.next_id.fetch_max(id.get() + 1, Ordering::SeqCst);
    }

    fn fresh_id(&self) -> NodeId {
        NodeId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Store backed by process memory. Clones share the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Writers waiting longer than `timeout` for a scope fail with
    /// `ConcurrentModification`.
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(BTreeMap::new()),
                locks: Mutex::new(HashMap::new()),
                claims: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                lock_timeout: timeout,
            }),
        }
    }

    /// Committed rows of `scope`, soft-deleted included, ordered by `lft`.
    pub fn nodes(&self, scope: &Scope) -> Result<Vec<Node>, NestedSetError> {
        let tables = self.shared.tables()?;
        let mut rows = tables.get(scope).cloned().unwrap_or_default();
        sort_rows(&mut rows);
        Ok(rows)
    }

    /// Replace (or add) a committed row as-is, bypassing every structural check.
    ///
    /// Meant for importing legacy data and for reproducing corruption.
    pub fn overwrite(&self, node: Node) -> Result<(), NestedSetError> {
        let mut tables = self.shared.tables()?;
        for rows in tables.values_mut() {
            rows.retain(|existing| existing.id != node.id);
        }
        self.shared.reserve_id(node.id);
        tables.entry(node.scope.clone()).or_default().push(node);
        tables.retain(|_, rows| !rows.is_empty());
        Ok(())
    }

    fn snapshot(&self, scope: &Scope) -> Result<Vec<Node>, NestedSetError> {
        let tables = self.shared.tables()?;
        Ok(tables.get(scope).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    /// Explicit id for the new row, or `None` to allocate one.
    type Draft = Option<NodeId>;
    type Transaction = MemoryTransaction;

    async fn begin(&self, scope: &Scope) -> Result<MemoryTransaction, NestedSetError> {
        let lock = self.shared.scope_lock(scope)?;
        let guard = tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                NestedSetError::ConcurrentModification(format!(
                    "timed out waiting for the lock on scope {scope}"
                ))
            })?;

        Ok(MemoryTransaction {
            shared: self.shared.clone(),
            scope: scope.clone(),
            rows: self.snapshot(scope)?,
            claimed: Vec::new(),
            guard: Some(guard),
        })
    }

    async fn begin_read(&self, scope: &Scope) -> Result<MemoryTransaction, NestedSetError> {
        Ok(MemoryTransaction {
            shared: self.shared.clone(),
            scope: scope.clone(),
            rows: self.snapshot(scope)?,
            claimed: Vec::new(),
            guard: None,
        })
    }

    async fn scopes(&self) -> Result<Vec<Scope>, NestedSetError> {
        let tables = self.shared.tables()?;
        Ok(tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(scope, _)| scope.clone())
            .collect())
    }
}

/// Private working copy of one scope. Writes are published on commit only
/// when the transaction holds the scope lock.
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    scope: Scope,
    rows: Vec<Node>,
    claimed: Vec<NodeId>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.claimed.is_empty() {
            self.shared.release(&self.claimed);
        }
    }
}

impl MemoryTransaction {
    fn position(&self, id: NodeId) -> Option<usize> {
        self.rows.iter().position(|node| node.id == id)
    }

    fn ensure_unused(&mut self, id: NodeId) -> Result<(), NestedSetError> {
        if self.position(id).is_some() {
            return Err(NestedSetError::invariant(format!("node {id} already exists")));
        }
        self.shared.claim(&self.scope, id)?;
        self.claimed.push(id);
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), NestedSetError> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(NestedSetError::invariant("write attempted in a read transaction"))
        }
    }

    fn sorted(mut rows: Vec<Node>) -> Vec<Node> {
        sort_rows(&mut rows);
        rows
    }
}

fn sort_rows(rows: &mut [Node]) {
    rows.sort_by_key(|node| (node.lft, node.id));
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    type Draft = Option<NodeId>;

    fn scope(&self) -> &Scope {
        &self.scope
    }

    async fn read_node(&mut self, id: NodeId) -> Result<Node, NestedSetError> {
        if let Some(idx) = self.position(id) {
            return Ok(self.rows[idx].clone());
        }
        match self.shared.foreign_scope(&self.scope, id)? {
            Some(actual) => Err(NestedSetError::ScopeMismatch {
                id,
                expected: self.scope.clone(),
                actual,
            }),
            None => Err(NestedSetError::NotFound(id)),
        }
    }

    async fn read_range(
        &mut self,
        lft_min: Boundary,
        rgt_max: Boundary,
    ) -> Result<Vec<Node>, NestedSetError> {
        let rows = self
            .rows
            .iter()
            .filter(|node| node.lft <= rgt_max && node.rgt >= lft_min)
            .cloned()
            .collect();
        Ok(Self::sorted(rows))
    }

    async fn select(&mut self, filter: &NodeFilter) -> Result<Vec<Node>, NestedSetError> {
        let rows = self
            .rows
            .iter()
            .filter(|node| filter.matches(node))
            .cloned()
            .collect();
        Ok(Self::sorted(rows))
    }

    async fn count(&mut self, filter: &NodeFilter) -> Result<u64, NestedSetError> {
        Ok(self.rows.iter().filter(|node| filter.matches(node)).count() as u64)
    }

    async fn max_rgt(&mut self) -> Result<Boundary, NestedSetError> {
        Ok(self.rows.iter().map(|node| node.rgt).max().unwrap_or(0))
    }

    async fn latest_deletion(&mut self) -> Result<Option<DateTime<Utc>>, NestedSetError> {
        Ok(self.rows.iter().filter_map(|node| node.deleted_at).max())
    }

    async fn shift_boundaries(&mut self, shift: Shift) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        if shift.is_noop() {
            return Ok(0);
        }
        let mut touched = 0;
        for node in &mut self.rows {
            if shift.apply_to(node) {
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn write_node(&mut self, node: &Node) -> Result<(), NestedSetError> {
        self.ensure_writable()?;
        if node.scope != self.scope {
            return Err(NestedSetError::ScopeMismatch {
                id: node.id,
                expected: self.scope.clone(),
                actual: node.scope.clone(),
            });
        }
        match self.position(node.id) {
            Some(idx) => {
                let row = &mut self.rows[idx];
                row.parent_id = node.parent_id;
                row.lft = node.lft;
                row.rgt = node.rgt;
                row.deleted_at = node.deleted_at;
            }
            None => {
                self.ensure_unused(node.id)?;
                self.rows.push(node.clone());
            }
        }
        Ok(())
    }

    async fn insert_node(
        &mut self,
        draft: Option<NodeId>,
        slot: NodeSlot,
    ) -> Result<Node, NestedSetError> {
        self.ensure_writable()?;
        let id = match draft {
            Some(id) => {
                self.ensure_unused(id)?;
                id
            }
            None => self.shared.fresh_id(),
        };
        let node = Node {
            id,
            parent_id: slot.parent_id,
            lft: slot.lft,
            rgt: slot.rgt,
            scope: self.scope.clone(),
            deleted_at: None,
        };
        self.rows.push(node.clone());
        Ok(node)
    }

    async fn delete_range(
        &mut self,
        lft: Boundary,
        rgt: Boundary,
    ) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        let before = self.rows.len();
        self.rows.retain(|node| !(lft <= node.lft && node.lft <= rgt));
        Ok((before - self.rows.len()) as u64)
    }

    async fn delete_node(&mut self, id: NodeId) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        let before = self.rows.len();
        self.rows.retain(|node| node.id != id);
        Ok((before - self.rows.len()) as u64)
    }

    async fn mark_deleted(
        &mut self,
        lft: Boundary,
        rgt: Boundary,
        marker: DateTime<Utc>,
    ) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        let mut touched = 0;
        for node in &mut self.rows {
            if lft <= node.lft && node.lft <= rgt && node.deleted_at.is_none() {
                node.deleted_at = Some(marker);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn clear_deleted(
        &mut self,
        lft: Boundary,
        rgt: Boundary,
        marker: DateTime<Utc>,
    ) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        let mut touched = 0;
        for node in &mut self.rows {
            if lft <= node.lft && node.lft <= rgt && node.deleted_at == Some(marker) {
                node.deleted_at = None;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn commit(mut self) -> Result<(), NestedSetError> {
        if self.guard.is_none() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.rows);
        let mut tables = self.shared.tables()?;
        if rows.is_empty() {
            tables.remove(&self.scope);
        } else {
            tables.insert(self.scope.clone(), rows);
        }
        // Released while the tables are locked so the id is never unguarded.
        self.shared.release(&std::mem::take(&mut self.claimed));
        Ok(())
    }

    async fn rollback(self) -> Result<(), NestedSetError> {
        Ok(())
    }
}
