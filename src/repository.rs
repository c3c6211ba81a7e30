use sea_orm::DatabaseConnection;

use crate::config::RootPolicy;
use crate::error::NestedSetError;
use crate::node::{Node, NodeId, Scope, TreeNode};
use crate::query::{self, NodeFilter};
use crate::store::{NodeStore, PostgresStore, StoreTransaction};
use crate::traits::NestedSetModel;

/// Repository exposing the nested-set operations over one store.
///
/// Every public method runs in its own store transaction: mutations take the
/// scope's write lock and commit on success, queries use a read transaction.
pub struct NestedSetRepository<S>
where
    S: NodeStore,
{
    store: S,
    root_policy: RootPolicy,
}

impl<M> NestedSetRepository<PostgresStore<M>>
where
    M: NestedSetModel,
{
    /// Repository over `M`'s table, honouring the model's root policy.
    pub fn for_model(db: DatabaseConnection) -> Result<Self, NestedSetError> {
        let store = PostgresStore::new(db)?;
        Ok(Self::new(store).with_root_policy(M::nested_set_config().root_policy()))
    }
}

impl<S> NestedSetRepository<S>
where
    S: NodeStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            root_policy: RootPolicy::default(),
        }
    }

    pub fn with_root_policy(mut self, policy: RootPolicy) -> Self {
        self.root_policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn root_policy(&self) -> RootPolicy {
        self.root_policy
    }

    /// Commit on success, roll back on failure.
    pub(crate) async fn finish<T>(
        &self,
        txn: S::Transaction,
        result: Result<T, NestedSetError>,
    ) -> Result<T, NestedSetError> {
        match result {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(scope = %txn.scope(), error = %err, "nested-set transaction rolled back");
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }

    /// Fetch a row, soft-deleted or not.
    pub async fn node(&self, scope: &Scope, id: NodeId) -> Result<Node, NestedSetError> {
        let mut txn = self.store.begin_read(scope).await?;
        let result = txn.read_node(id).await;
        self.finish(txn, result).await
    }

    pub async fn parent(&self, scope: &Scope, id: NodeId) -> Result<Option<Node>, NestedSetError> {
        let mut txn = self.store.begin_read(scope).await?;
        let result = Self::parent_on(&mut txn, id).await;
        self.finish(txn, result).await
    }

    async fn parent_on(txn: &mut S::Transaction, id: NodeId) -> Result<Option<Node>, NestedSetError> {
        let node = txn.read_node(id).await?;
        match node.parent_id {
            Some(parent_id) => Ok(Some(txn.read_node(parent_id).await?)),
            None => Ok(None),
        }
    }

    pub async fn roots(&self, scope: &Scope) -> Result<Vec<Node>, NestedSetError> {
        let mut txn = self.store.begin_read(scope).await?;
        let result = txn.select(&query::roots()).await;
        self.finish(txn, result).await
    }

    /// Ancestors ordered root first.
    pub async fn ancestors(&self, scope: &Scope, id: NodeId) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::ancestors).await
    }

    pub async fn ancestors_and_self(
        &self,
        scope: &Scope,
        id: NodeId,
    ) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::ancestors_and_self).await
    }

    /// Descendants in pre-order.
    pub async fn descendants(&self, scope: &Scope, id: NodeId) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::descendants).await
    }

    pub async fn self_and_descendants(
        &self,
        scope: &Scope,
        id: NodeId,
    ) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::self_and_descendants).await
    }

    pub async fn children(&self, scope: &Scope, id: NodeId) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::children).await
    }

    pub async fn siblings(&self, scope: &Scope, id: NodeId) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::siblings).await
    }

    pub async fn prev_siblings(
        &self,
        scope: &Scope,
        id: NodeId,
    ) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::prev_siblings).await
    }

    pub async fn next_siblings(
        &self,
        scope: &Scope,
        id: NodeId,
    ) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::next_siblings).await
    }

    pub async fn leaves(&self, scope: &Scope, id: NodeId) -> Result<Vec<Node>, NestedSetError> {
        self.related(scope, id, query::leaves).await
    }

    pub async fn is_root(&self, scope: &Scope, id: NodeId) -> Result<bool, NestedSetError> {
        Ok(self.node(scope, id).await?.is_root())
    }

    pub async fn is_leaf(&self, scope: &Scope, id: NodeId) -> Result<bool, NestedSetError> {
        Ok(self.node(scope, id).await?.is_leaf())
    }

    /// Number of live ancestors.
    pub async fn depth(&self, scope: &Scope, id: NodeId) -> Result<u64, NestedSetError> {
        let mut txn = self.store.begin_read(scope).await?;
        let result = match txn.read_node(id).await {
            Ok(node) => txn.count(&query::ancestors(&node)).await,
            Err(err) => Err(err),
        };
        self.finish(txn, result).await
    }

    /// Every live node of the scope as a forest.
    pub async fn tree(&self, scope: &Scope) -> Result<Vec<TreeNode>, NestedSetError> {
        let mut txn = self.store.begin_read(scope).await?;
        let result = txn.select(&NodeFilter::new()).await;
        let rows = self.finish(txn, result).await?;
        Ok(TreeNode::assemble(rows))
    }

    /// The node and its live descendants, nested.
    pub async fn subtree(&self, scope: &Scope, id: NodeId) -> Result<TreeNode, NestedSetError> {
        let rows = self.self_and_descendants(scope, id).await?;
        TreeNode::assemble(rows)
            .into_iter()
            .next()
            .ok_or(NestedSetError::NotFound(id))
    }

    async fn related(
        &self,
        scope: &Scope,
        id: NodeId,
        relation: fn(&Node) -> NodeFilter,
    ) -> Result<Vec<Node>, NestedSetError> {
        let mut txn = self.store.begin_read(scope).await?;
        let result = match txn.read_node(id).await {
            Ok(node) => txn.select(&relation(&node)).await,
            Err(err) => Err(err),
        };
        self.finish(txn, result).await
    }
}
