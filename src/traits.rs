use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, DbErr, EntityTrait, FromQueryResult, IntoActiveModel,
    QueryResult, Value,
};

use crate::config::NestedSetConfig;
use crate::error::NestedSetError;
use crate::node::{Node, NodeId, NodeSlot, Scope};

/// Trait implemented by SeaORM `Model` types stored as a nested set.
///
/// Implementations are normally provided by the `#[derive(NestedSetModel)]` macro.
pub trait NestedSetModel:
    Clone + Send + Sync + 'static + IntoActiveModel<Self::ActiveModel> + FromQueryResult
{
    type Entity: EntityTrait<Model = Self>;
    type ActiveModel: ActiveModelTrait<Entity = Self::Entity> + ActiveModelBehavior + Send;

    fn nested_set_config() -> &'static NestedSetConfig;

    fn node_id(&self) -> NodeId;

    /// Structural view of the row.
    fn to_node(&self) -> Node;

    fn id_value(id: NodeId) -> Result<Value, NestedSetError>;

    fn set_id(active: &mut Self::ActiveModel, id: NodeId) -> Result<(), NestedSetError>;
    fn set_position(active: &mut Self::ActiveModel, slot: &NodeSlot)
        -> Result<(), NestedSetError>;
    fn set_scope(active: &mut Self::ActiveModel, scope: &Scope) -> Result<(), NestedSetError>;
    /// No-op for models without a soft-delete column.
    fn set_deleted_at(active: &mut Self::ActiveModel, marker: Option<DateTime<Utc>>);

    /// Decode the scope columns of a `SELECT DISTINCT <scope columns>` row.
    fn scope_from_row(row: &QueryResult) -> Result<Scope, DbErr>;

    fn id_column() -> <Self::Entity as EntityTrait>::Column;
    fn parent_column() -> <Self::Entity as EntityTrait>::Column;
    fn lft_column() -> <Self::Entity as EntityTrait>::Column;
    fn rgt_column() -> <Self::Entity as EntityTrait>::Column;
    fn deleted_at_column() -> Option<<Self::Entity as EntityTrait>::Column>;
    fn scope_columns() -> Vec<<Self::Entity as EntityTrait>::Column>;
}
