use std::time::Duration;

use crc32fast::Hasher;

use crate::node::Scope;

/// Static configuration describing how a SeaORM model maps onto a nested set.
#[derive(Clone, Debug)]
pub struct NestedSetConfig {
    entity_name: String,
    table: String,
    id_column: String,
    parent_column: String,
    lft_column: String,
    rgt_column: String,
    deleted_at_column: Option<String>,
    scope_columns: Vec<String>,
    root_policy: RootPolicy,
    advisory_lock_strategy: AdvisoryLockStrategy,
    lock_timeout: Option<Duration>,
}

impl NestedSetConfig {
    /// Create a new configuration for the logical entity name and its table.
    pub fn new(entity_name: impl Into<String>, table: impl Into<String>) -> Self {
        let entity_name = entity_name.into();
        let table = table.into();

        let default_lock =
            AdvisoryLockStrategy::Namespaced(AdvisoryLockKey::derived_from(&entity_name, &table));

        Self {
            entity_name,
            table,
            id_column: "id".to_string(),
            parent_column: "parent_id".to_string(),
            lft_column: "lft".to_string(),
            rgt_column: "rgt".to_string(),
            deleted_at_column: None,
            scope_columns: Vec::new(),
            root_policy: RootPolicy::default(),
            advisory_lock_strategy: default_lock,
            lock_timeout: None,
        }
    }

    /// Merge options produced by [`NestedSetOptions`].
    pub(crate) fn apply_options(mut self, options: NestedSetOptions) -> Self {
        if let Some(id_column) = options.id_column {
            self.id_column = id_column;
        }
        if let Some(parent_column) = options.parent_column {
            self.parent_column = parent_column;
        }
        if let Some(lft_column) = options.lft_column {
            self.lft_column = lft_column;
        }
        if let Some(rgt_column) = options.rgt_column {
            self.rgt_column = rgt_column;
        }
        if let Some(deleted_at_column) = options.deleted_at_column {
            self.deleted_at_column = Some(deleted_at_column);
        }
        if let Some(scope_columns) = options.scope_columns {
            self.scope_columns = scope_columns;
        }
        if let Some(policy) = options.root_policy {
            self.root_policy = policy;
        }
        if let Some(strategy) = options.advisory_lock_strategy {
            self.advisory_lock_strategy = strategy;
        }
        if let Some(timeout) = options.lock_timeout {
            self.lock_timeout = Some(timeout);
        }
        self
    }

    /// Human-readable Rust struct name for the entity.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Table holding the tree rows.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// Column name storing the parent foreign key.
    pub fn parent_column(&self) -> &str {
        &self.parent_column
    }

    pub fn lft_column(&self) -> &str {
        &self.lft_column
    }

    pub fn rgt_column(&self) -> &str {
        &self.rgt_column
    }

    /// Soft-delete timestamp column, when the model supports soft deletes.
    pub fn deleted_at_column(&self) -> Option<&str> {
        self.deleted_at_column.as_deref()
    }

    /// Columns partitioning independent trees, in scope-value order.
    pub fn scope_columns(&self) -> &[String] {
        &self.scope_columns
    }

    pub fn root_policy(&self) -> RootPolicy {
        self.root_policy
    }

    /// Advisory lock strategy (PostgreSQL only).
    pub fn advisory_lock_strategy(&self) -> &AdvisoryLockStrategy {
        &self.advisory_lock_strategy
    }

    /// Maximum time a mutation waits for locks before giving up.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout
    }
}

/// Builder-style options consumed by the derive macro.
#[derive(Clone, Debug, Default)]
pub struct NestedSetOptions {
    id_column: Option<String>,
    parent_column: Option<String>,
    lft_column: Option<String>,
    rgt_column: Option<String>,
    deleted_at_column: Option<String>,
    scope_columns: Option<Vec<String>>,
    root_policy: Option<RootPolicy>,
    advisory_lock_strategy: Option<AdvisoryLockStrategy>,
    lock_timeout: Option<Duration>,
}

impl NestedSetOptions {
    pub fn id_column(mut self, value: impl Into<String>) -> Self {
        self.id_column = Some(value.into());
        self
    }

    pub fn parent_column(mut self, value: impl Into<String>) -> Self {
        self.parent_column = Some(value.into());
        self
    }

    pub fn lft_column(mut self, value: impl Into<String>) -> Self {
        self.lft_column = Some(value.into());
        self
    }

    pub fn rgt_column(mut self, value: impl Into<String>) -> Self {
        self.rgt_column = Some(value.into());
        self
    }

    pub fn deleted_at_column(mut self, value: impl Into<String>) -> Self {
        self.deleted_at_column = Some(value.into());
        self
    }

    pub fn scope_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn root_policy(mut self, policy: RootPolicy) -> Self {
        self.root_policy = Some(policy);
        self
    }

    pub fn advisory_lock_strategy(mut self, strategy: AdvisoryLockStrategy) -> Self {
        self.advisory_lock_strategy = Some(strategy);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn apply(self, base: NestedSetConfig) -> NestedSetConfig {
        base.apply_options(self)
    }
}

/// How many roots a scope may hold.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RootPolicy {
    /// Roots are concatenated left to right in one boundary space.
    #[default]
    Multiple,
    /// Exactly one root spans `[1, 2N]`.
    Single,
}

/// Key used for PostgreSQL advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct AdvisoryLockKey(String);

impl AdvisoryLockKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Narrow the key to one scope so writers in different scopes never wait on
    /// each other.
    pub fn for_scope(&self, scope: &Scope) -> Self {
        if scope.is_global() {
            return self.clone();
        }
        let encoded = serde_json::to_string(scope).unwrap_or_else(|_| scope.to_string());
        let mut hasher = Hasher::new();
        hasher.update(encoded.as_bytes());
        Self(format!("{}::{:x}", self.0, hasher.finalize()))
    }

    fn derived_from(entity: &str, table: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(entity.as_bytes());
        hasher.update(b"/");
        hasher.update(table.as_bytes());
        let crc = hasher.finalize();
        Self(format!("nested-set::{entity}::{table}::{crc:x}"))
    }
}

/// Configuration describing how to acquire advisory locks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdvisoryLockStrategy {
    /// No advisory lock; writers lock the whole table instead.
    Disabled,
    Namespaced(AdvisoryLockKey),
}

impl AdvisoryLockStrategy {
    pub fn key(&self) -> Option<&AdvisoryLockKey> {
        match self {
            AdvisoryLockStrategy::Disabled => None,
            AdvisoryLockStrategy::Namespaced(key) => Some(key),
        }
    }
}
