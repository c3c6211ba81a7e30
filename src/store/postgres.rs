//! SeaORM store for PostgreSQL tables described by a [`NestedSetModel`].

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, DbBackend, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    Statement, Value,
};

use crate::boundary::Shift;
use crate::error::NestedSetError;
use crate::lock::LockedTransaction;
use crate::node::{Boundary, Node, NodeId, NodeSlot, Scope, ScopeValue};
use crate::query::{Cmp, NodeFilter, Predicate};
use crate::store::{NodeStore, StoreTransaction};
use crate::traits::NestedSetModel;

/// Store backed by the table of model `M`.
pub struct PostgresStore<M>
where
    M: NestedSetModel,
{
    db: DatabaseConnection,
    _marker: PhantomData<M>,
}

impl<M> PostgresStore<M>
where
    M: NestedSetModel,
{
    pub fn new(db: DatabaseConnection) -> Result<Self, NestedSetError> {
        ensure_postgres(&db)?;
        Ok(Self {
            db,
            _marker: PhantomData,
        })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn ensure_postgres(conn: &impl ConnectionTrait) -> Result<(), NestedSetError> {
    if conn.get_database_backend() == DbBackend::Postgres {
        Ok(())
    } else {
        Err(NestedSetError::UnsupportedBackend)
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn scope_value(value: &ScopeValue) -> Value {
    match value {
        ScopeValue::Bool(value) => Value::from(*value),
        ScopeValue::Int(value) => Value::from(*value),
        ScopeValue::Text(value) => Value::from(value.clone()),
    }
}

#[async_trait]
impl<M> NodeStore for PostgresStore<M>
where
    M: NestedSetModel,
{
    type Draft = M::ActiveModel;
    type Transaction = PostgresTransaction<M>;

    async fn begin(&self, scope: &Scope) -> Result<PostgresTransaction<M>, NestedSetError> {
        let config = M::nested_set_config();
        let key = config
            .advisory_lock_strategy()
            .key()
            .map(|key| key.for_scope(scope));
        let guard = LockedTransaction::acquire(
            key.as_ref(),
            config.table(),
            config.lock_timeout(),
            &self.db,
        )
        .await?;
        PostgresTransaction::new(guard, scope.clone(), true)
    }

    async fn begin_read(&self, scope: &Scope) -> Result<PostgresTransaction<M>, NestedSetError> {
        let guard = LockedTransaction::read_only(&self.db).await?;
        PostgresTransaction::new(guard, scope.clone(), false)
    }

    async fn scopes(&self) -> Result<Vec<Scope>, NestedSetError> {
        let config = M::nested_set_config();
        if config.scope_columns().is_empty() {
            let any = M::Entity::find().one(&self.db).await?;
            return Ok(any.map(|_| Scope::global()).into_iter().collect());
        }

        let columns = config
            .scope_columns()
            .iter()
            .map(|column| quote(column))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT DISTINCT {columns} FROM {} ORDER BY {columns}",
            quote(config.table())
        );
        let rows = self
            .db
            .query_all(Statement::from_string(DbBackend::Postgres, sql))
            .await?;
        let mut scopes = Vec::with_capacity(rows.len());
        for row in &rows {
            scopes.push(M::scope_from_row(row)?);
        }
        Ok(scopes)
    }
}

/// Transaction over the rows of one scope.
pub struct PostgresTransaction<M>
where
    M: NestedSetModel,
{
    guard: LockedTransaction,
    scope: Scope,
    scope_condition: Condition,
    writable: bool,
    _marker: PhantomData<M>,
}

impl<M> PostgresTransaction<M>
where
    M: NestedSetModel,
{
    fn new(guard: LockedTransaction, scope: Scope, writable: bool) -> Result<Self, NestedSetError> {
        let columns = M::scope_columns();
        if columns.len() != scope.values().len() {
            return Err(NestedSetError::invariant(format!(
                "scope {scope} has {} values, {} expects {}",
                scope.values().len(),
                M::nested_set_config().entity_name(),
                columns.len()
            )));
        }
        let scope_condition = columns
            .into_iter()
            .zip(scope.values())
            .fold(Condition::all(), |condition, (column, value)| {
                condition.add(column.eq(scope_value(value)))
            });

        Ok(Self {
            guard,
            scope,
            scope_condition,
            writable,
            _marker: PhantomData,
        })
    }

    fn conn(&self) -> &DatabaseTransaction {
        self.guard.connection()
    }

    fn ensure_writable(&self) -> Result<(), NestedSetError> {
        if self.writable {
            Ok(())
        } else {
            Err(NestedSetError::invariant("write attempted in a read transaction"))
        }
    }

    fn live_condition(&self) -> Condition {
        match M::deleted_at_column() {
            Some(column) => self.scope_condition.clone().add(column.is_null()),
            None => self.scope_condition.clone(),
        }
    }

    fn filter_condition(&self, filter: &NodeFilter) -> Result<Condition, NestedSetError> {
        let mut condition = if filter.include_deleted() {
            self.scope_condition.clone()
        } else {
            self.live_condition()
        };
        for predicate in filter.predicates() {
            condition = match *predicate {
                Predicate::Lft(cmp, value) => condition.add(compare(M::lft_column(), cmp, value)),
                Predicate::Rgt(cmp, value) => condition.add(compare(M::rgt_column(), cmp, value)),
                Predicate::Parent(Some(parent)) => {
                    condition.add(M::parent_column().eq(M::id_value(parent)?))
                }
                Predicate::Parent(None) => condition.add(M::parent_column().is_null()),
                Predicate::ExcludeId(id) => condition.add(M::id_column().ne(M::id_value(id)?)),
                Predicate::Leaf => condition.add(
                    Expr::col(M::rgt_column()).eq(Expr::col(M::lft_column()).add(1i64)),
                ),
            };
        }
        Ok(condition)
    }

    /// Where clause and bind values restricting raw statements to this scope.
    fn scope_sql(&self, first_param: usize) -> (String, Vec<Value>) {
        let config = M::nested_set_config();
        let mut sql = String::new();
        let mut values = Vec::new();
        for (offset, (column, value)) in config
            .scope_columns()
            .iter()
            .zip(self.scope.values())
            .enumerate()
        {
            sql.push_str(&format!(" AND {} = ${}", quote(column), first_param + offset));
            values.push(scope_value(value));
        }
        (sql, values)
    }

    async fn find_scoped(&self, id: NodeId) -> Result<Option<M>, NestedSetError> {
        let model = M::Entity::find()
            .filter(M::id_column().eq(M::id_value(id)?))
            .filter(self.scope_condition.clone())
            .one(self.conn())
            .await?;
        Ok(model)
    }

    async fn scope_mismatch_or_missing(&self, id: NodeId) -> Result<NestedSetError, NestedSetError> {
        let elsewhere = M::Entity::find()
            .filter(M::id_column().eq(M::id_value(id)?))
            .one(self.conn())
            .await?;
        Ok(match elsewhere {
            Some(model) => NestedSetError::ScopeMismatch {
                id,
                expected: self.scope.clone(),
                actual: model.to_node().scope,
            },
            None => NestedSetError::NotFound(id),
        })
    }

    fn deleted_at_column(&self) -> Result<<M::Entity as EntityTrait>::Column, NestedSetError> {
        M::deleted_at_column().ok_or_else(|| {
            NestedSetError::invariant(format!(
                "{} has no soft-delete column",
                M::nested_set_config().entity_name()
            ))
        })
    }
}

fn compare<C: ColumnTrait>(column: C, cmp: Cmp, value: Boundary) -> Condition {
    let expr = match cmp {
        Cmp::Lt => column.lt(value),
        Cmp::Le => column.lte(value),
        Cmp::Eq => column.eq(value),
        Cmp::Ge => column.gte(value),
        Cmp::Gt => column.gt(value),
    };
    Condition::all().add(expr)
}

#[async_trait]
impl<M> StoreTransaction for PostgresTransaction<M>
where
    M: NestedSetModel,
{
    type Draft = M::ActiveModel;

    fn scope(&self) -> &Scope {
        &self.scope
    }

    async fn read_node(&mut self, id: NodeId) -> Result<Node, NestedSetError> {
        match self.find_scoped(id).await? {
            Some(model) => Ok(model.to_node()),
            None => Err(self.scope_mismatch_or_missing(id).await?),
        }
    }

    async fn read_range(
        &mut self,
        lft_min: Boundary,
        rgt_max: Boundary,
    ) -> Result<Vec<Node>, NestedSetError> {
        let rows = M::Entity::find()
            .filter(self.scope_condition.clone())
            .filter(M::lft_column().lte(rgt_max))
            .filter(M::rgt_column().gte(lft_min))
            .order_by_asc(M::lft_column())
            .order_by_asc(M::id_column())
            .all(self.conn())
            .await?;
        Ok(rows.iter().map(M::to_node).collect())
    }

    async fn select(&mut self, filter: &NodeFilter) -> Result<Vec<Node>, NestedSetError> {
        let rows = M::Entity::find()
            .filter(self.filter_condition(filter)?)
            .order_by_asc(M::lft_column())
            .order_by_asc(M::id_column())
            .all(self.conn())
            .await?;
        Ok(rows.iter().map(M::to_node).collect())
    }

    async fn count(&mut self, filter: &NodeFilter) -> Result<u64, NestedSetError> {
        let count = M::Entity::find()
            .filter(self.filter_condition(filter)?)
            .count(self.conn())
            .await?;
        Ok(count)
    }

    async fn max_rgt(&mut self) -> Result<Boundary, NestedSetError> {
        let last = M::Entity::find()
            .filter(self.scope_condition.clone())
            .filter(M::rgt_column().is_not_null())
            .order_by_desc(M::rgt_column())
            .one(self.conn())
            .await?;
        Ok(last.map_or(0, |model| model.to_node().rgt))
    }

    async fn latest_deletion(&mut self) -> Result<Option<DateTime<Utc>>, NestedSetError> {
        let Some(column) = M::deleted_at_column() else {
            return Ok(None);
        };
        let latest = M::Entity::find()
            .filter(self.scope_condition.clone())
            .filter(column.is_not_null())
            .order_by_desc(column)
            .one(self.conn())
            .await?;
        Ok(latest.and_then(|model| model.to_node().deleted_at))
    }

    async fn shift_boundaries(&mut self, shift: Shift) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        if shift.is_noop() {
            return Ok(0);
        }
        let config = M::nested_set_config();
        let lft = quote(config.lft_column());
        let rgt = quote(config.rgt_column());
        let (scope_sql, scope_values) = self.scope_sql(4);
        let sql = format!(
            "UPDATE {table} SET \
             {lft} = CASE WHEN {lft} BETWEEN $1 AND $2 THEN {lft} + $3 ELSE {lft} END, \
             {rgt} = CASE WHEN {rgt} BETWEEN $1 AND $2 THEN {rgt} + $3 ELSE {rgt} END \
             WHERE ({lft} BETWEEN $1 AND $2 OR {rgt} BETWEEN $1 AND $2){scope_sql}",
            table = quote(config.table()),
        );
        let mut values = vec![
            Value::from(shift.start),
            Value::from(shift.end),
            Value::from(shift.delta),
        ];
        values.extend(scope_values);

        let result = self
            .conn()
            .execute(Statement::from_sql_and_values(DbBackend::Postgres, sql, values))
            .await?;
        Ok(result.rows_affected())
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
        let slot = NodeSlot {
            parent_id: node.parent_id,
            lft: node.lft,
            rgt: node.rgt,
        };

        match self.find_scoped(node.id).await? {
            Some(model) => {
                let mut active = model.into_active_model();
                M::set_position(&mut active, &slot)?;
                M::set_deleted_at(&mut active, node.deleted_at);
                if active.is_changed() {
                    active.update(self.conn()).await?;
                }
            }
            None => {
                if let NestedSetError::ScopeMismatch { .. } =
                    self.scope_mismatch_or_missing(node.id).await?
                {
                    return Err(NestedSetError::invariant(format!(
                        "node {} already exists in another scope",
                        node.id
                    )));
                }
                let mut active = M::ActiveModel::default();
                M::set_id(&mut active, node.id)?;
                M::set_scope(&mut active, &self.scope)?;
                M::set_position(&mut active, &slot)?;
                M::set_deleted_at(&mut active, node.deleted_at);
                active.insert(self.conn()).await?;
            }
        }
        Ok(())
    }

    async fn insert_node(
        &mut self,
        draft: M::ActiveModel,
        slot: NodeSlot,
    ) -> Result<Node, NestedSetError> {
        self.ensure_writable()?;
        let mut active = draft;
        M::set_scope(&mut active, &self.scope)?;
        M::set_position(&mut active, &slot)?;
        M::set_deleted_at(&mut active, None);
        let model = active.insert(self.conn()).await?;
        Ok(model.to_node())
    }

    async fn delete_range(
        &mut self,
        lft: Boundary,
        rgt: Boundary,
    ) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        let result = M::Entity::delete_many()
            .filter(self.scope_condition.clone())
            .filter(M::lft_column().between(lft, rgt))
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected)
    }

    async fn delete_node(&mut self, id: NodeId) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        let result = M::Entity::delete_many()
            .filter(self.scope_condition.clone())
            .filter(M::id_column().eq(M::id_value(id)?))
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected)
    }

    async fn mark_deleted(
        &mut self,
        lft: Boundary,
        rgt: Boundary,
        marker: DateTime<Utc>,
    ) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        let column = self.deleted_at_column()?;
        let result = M::Entity::update_many()
            .col_expr(column, Expr::value(marker))
            .filter(self.scope_condition.clone())
            .filter(M::lft_column().between(lft, rgt))
            .filter(column.is_null())
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected)
    }

    async fn clear_deleted(
        &mut self,
        lft: Boundary,
        rgt: Boundary,
        marker: DateTime<Utc>,
    ) -> Result<u64, NestedSetError> {
        self.ensure_writable()?;
        let column = self.deleted_at_column()?;
        let result = M::Entity::update_many()
            .col_expr(column, Expr::value(Option::<DateTime<Utc>>::None))
            .filter(self.scope_condition.clone())
            .filter(M::lft_column().between(lft, rgt))
            .filter(column.eq(marker))
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected)
    }

    async fn commit(self) -> Result<(), NestedSetError> {
        self.guard.commit().await
    }

    async fn rollback(self) -> Result<(), NestedSetError> {
        self.guard.rollback().await
    }
}
