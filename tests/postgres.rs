use nested_set::{
    DeleteMode, ErrorCounts, NestedSetModel, NestedSetRepository, Node, NodeId, NodeStore,
    Placement, PostgresStore, Scope,
};
use sea_orm::{ActiveValue, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};

mod entity {
    pub mod category {
        use nested_set::NestedSetModelDerive as NestedSetModel;
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, NestedSetModel)]
        #[sea_orm(table_name = "categories")]
        #[nested_set(scope = "tenant_id", deleted_at_field = "deleted_at", lock_timeout_ms = 2000)]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub lft: i32,
            pub rgt: i32,
            pub tenant_id: i32,
            pub name: String,
            pub deleted_at: Option<DateTimeUtc>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod menu_item {
        use nested_set::NestedSetModelDerive as NestedSetModel;
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, NestedSetModel)]
        #[sea_orm(table_name = "menu_items")]
        #[nested_set(lock = "disabled", lock_timeout_ms = 2000)]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub lft: i32,
            pub rgt: i32,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{category, menu_item};

type Repo = NestedSetRepository<PostgresStore<category::Model>>;
type MenuRepo = NestedSetRepository<PostgresStore<menu_item::Model>>;

const WRITERS: usize = 8;

fn draft(name: &str) -> category::ActiveModel {
    category::ActiveModel {
        name: ActiveValue::Set(name.to_string()),
        ..Default::default()
    }
}

#[test]
fn derive_reads_field_layout_into_config() {
    let config = category::Model::nested_set_config();
    assert_eq!(config.table(), "categories");
    assert_eq!(config.lft_column(), "lft");
    assert_eq!(config.scope_columns(), ["tenant_id".to_string()]);
    assert_eq!(config.deleted_at_column(), Some("deleted_at"));
    assert_eq!(config.lock_timeout(), Some(std::time::Duration::from_millis(2000)));
    assert!(config.advisory_lock_strategy().key().is_some());

    let menu = menu_item::Model::nested_set_config();
    assert!(menu.advisory_lock_strategy().key().is_none());
    assert!(menu.scope_columns().is_empty());
}

// One test drives the shared table so runs never race on it.
#[tokio::test]
async fn postgres_store_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = setup_database().await? else {
        return Ok(());
    };
    reset_table(&db).await?;

    let repo: Repo = NestedSetRepository::for_model(db.clone())?;
    insert_move_and_delete(&repo).await?;

    reset_table(&db).await?;
    repair_after_manual_corruption(&repo, &db).await?;

    reset_table(&db).await?;
    concurrent_writers_under_advisory_lock(&db).await?;
    concurrent_writers_under_table_lock(&db).await?;
    Ok(())
}

async fn concurrent_writers_under_advisory_lock(
    db: &DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let scope = Scope::new([1]);
    let repo: Repo = NestedSetRepository::for_model(db.clone())?;
    let root = repo.create_root(&scope, draft("root")).await?;
    let root_id = root.id;

    let mut writers = tokio::task::JoinSet::new();
    for i in 0..WRITERS {
        let repo: Repo = NestedSetRepository::for_model(db.clone())?;
        let scope = scope.clone();
        writers.spawn(async move {
            let name = format!("writer-{i}");
            if i % 2 == 0 {
                repo.create_root(&scope, draft(&name)).await
            } else {
                repo.append_child(&scope, root_id, draft(&name)).await
            }
        });
    }
    while let Some(joined) = writers.join_next().await {
        joined??;
    }

    assert_eq!(repo.count_errors(&scope).await?, ErrorCounts::default());
    assert_contiguous(&repo.roots(&scope).await?, &repo, &scope, WRITERS + 1).await?;
    assert_eq!(repo.children(&scope, root_id).await?.len(), WRITERS / 2);
    Ok(())
}

async fn concurrent_writers_under_table_lock(
    db: &DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let scope = Scope::global();
    let repo: MenuRepo = NestedSetRepository::for_model(db.clone())?;
    let root = repo
        .create_root(&scope, menu_item::ActiveModel::default())
        .await?;
    let root_id = root.id;

    let mut writers = tokio::task::JoinSet::new();
    for i in 0..WRITERS {
        let repo: MenuRepo = NestedSetRepository::for_model(db.clone())?;
        writers.spawn(async move {
            let scope = Scope::global();
            if i % 2 == 0 {
                repo.create_root(&scope, menu_item::ActiveModel::default()).await
            } else {
                repo.append_child(&scope, root_id, menu_item::ActiveModel::default())
                    .await
            }
        });
    }
    while let Some(joined) = writers.join_next().await {
        joined??;
    }

    assert_eq!(repo.count_errors(&scope).await?, ErrorCounts::default());
    assert_contiguous(&repo.roots(&scope).await?, &repo, &scope, WRITERS + 1).await?;
    Ok(())
}

/// The trees under `roots` hold `expected` rows whose boundaries are exactly
/// `1..=2 * expected`.
async fn assert_contiguous<S: NodeStore>(
    roots: &[Node],
    repo: &NestedSetRepository<S>,
    scope: &Scope,
    expected: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut boundaries = Vec::new();
    for root in roots {
        for node in repo.self_and_descendants(scope, root.id).await? {
            boundaries.extend([node.lft, node.rgt]);
        }
    }
    boundaries.sort_unstable();
    let wanted: Vec<i64> = (1..=2 * expected as i64).collect();
    assert_eq!(boundaries, wanted);
    Ok(())
}

async fn insert_move_and_delete(repo: &Repo) -> Result<(), Box<dyn std::error::Error>> {
    let scope = Scope::new([1]);

    let a = repo.create_root(&scope, draft("a")).await?;
    let b = repo.append_child(&scope, a.id, draft("b")).await?;
    let c = repo.append_child(&scope, a.id, draft("c")).await?;

    let a_row = repo.node(&scope, a.id).await?;
    assert_eq!((a_row.lft, a_row.rgt), (1, 6));
    assert_eq!(
        repo.siblings(&scope, b.id)
            .await?
            .iter()
            .map(|node| node.id)
            .collect::<Vec<_>>(),
        vec![c.id]
    );

    repo.move_node(&scope, b.id, Placement::AppendTo(c.id)).await?;
    let b_row = repo.node(&scope, b.id).await?;
    let c_row = repo.node(&scope, c.id).await?;
    assert_eq!((c_row.lft, c_row.rgt), (2, 5));
    assert_eq!((b_row.lft, b_row.rgt), (3, 4));
    assert_eq!(repo.depth(&scope, b.id).await?, 2);

    assert_eq!(repo.delete(&scope, c.id, DeleteMode::Soft).await?, 2);
    assert!(repo.descendants(&scope, a.id).await?.is_empty());
    assert_eq!(repo.restore(&scope, c.id).await?, 2);
    assert_eq!(repo.descendants(&scope, a.id).await?.len(), 2);

    assert_eq!(repo.count_errors(&scope).await?, ErrorCounts::default());

    let other = Scope::new([2]);
    repo.create_root(&other, draft("other")).await?;
    let err = repo.node(&other, a.id).await.unwrap_err();
    assert!(matches!(err, nested_set::NestedSetError::ScopeMismatch { .. }));
    assert_eq!(repo.store().scopes().await?, vec![scope.clone(), other]);

    assert_eq!(repo.delete(&scope, c.id, DeleteMode::Hard).await?, 2);
    let a_row = repo.node(&scope, a.id).await?;
    assert_eq!((a_row.lft, a_row.rgt), (1, 2));

    Ok(())
}

async fn repair_after_manual_corruption(
    repo: &Repo,
    db: &DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let scope = Scope::new([1]);
    let a = repo.create_root(&scope, draft("a")).await?;
    let b = repo.append_child(&scope, a.id, draft("b")).await?;
    repo.append_child(&scope, a.id, draft("c")).await?;

    db.execute(Statement::from_sql_and_values(
        DbBackend::Postgres,
        "UPDATE categories SET rgt = lft WHERE id = $1",
        [i32::try_from(b.id.get())?.into()],
    ))
    .await?;

    let counts = repo.count_errors(&scope).await?;
    assert_eq!(counts.oddness, 1);
    assert_eq!(repo.fix_tree(&scope).await?, 1);
    assert!(!repo.is_broken(&scope).await?);
    let b_row = repo.node(&scope, b.id).await?;
    assert_eq!((b_row.lft, b_row.rgt), (2, 3));

    let missing = repo.node(&scope, NodeId::new(9_999)).await.unwrap_err();
    assert!(matches!(missing, nested_set::NestedSetError::NotFound(_)));

    Ok(())
}

async fn setup_database() -> Result<Option<DatabaseConnection>, sea_orm::DbErr> {
    let Ok(url) = std::env::var("NESTED_SET_TEST_DATABASE_URL") else {
        return Ok(None);
    };
    Database::connect(url).await.map(Some)
}

async fn reset_table(db: &DatabaseConnection) -> Result<(), sea_orm::DbErr> {
    db.execute(Statement::from_string(
        DbBackend::Postgres,
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id SERIAL PRIMARY KEY,
            parent_id INTEGER,
            lft INTEGER NOT NULL,
            rgt INTEGER NOT NULL,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            deleted_at TIMESTAMPTZ
        );
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Postgres,
        "CREATE INDEX IF NOT EXISTS categories_tree ON categories (tenant_id, lft, rgt);",
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Postgres,
        r#"
        CREATE TABLE IF NOT EXISTS menu_items (
            id SERIAL PRIMARY KEY,
            parent_id INTEGER,
            lft INTEGER NOT NULL,
            rgt INTEGER NOT NULL
        );
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Postgres,
        "TRUNCATE TABLE categories, menu_items RESTART IDENTITY;",
    ))
    .await?;

    Ok(())
}
