use std::time::Duration;

use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend,
    IsolationLevel, Statement, TransactionTrait, Value,
};

use crate::config::AdvisoryLockKey;
use crate::error::NestedSetError;

/// Database transaction that holds the writer lock for its scope until it ends.
///
/// With a key the lock is `pg_advisory_xact_lock` on that key; without one the
/// whole table is locked in `SHARE ROW EXCLUSIVE` mode. Both are released by
/// commit, rollback and drop.
///
/// Writers run at READ COMMITTED: every statement after the lock sees rows
/// committed by the writer that held it before. A REPEATABLE READ snapshot
/// would be fixed by the lock statement itself, before the wait.
pub struct LockedTransaction {
    txn: DatabaseTransaction,
}

impl LockedTransaction {
    pub async fn acquire(
        key: Option<&AdvisoryLockKey>,
        table: &str,
        lock_timeout: Option<Duration>,
        db: &DatabaseConnection,
    ) -> Result<Self, NestedSetError> {
        let txn = db
            .begin_with_config(Some(IsolationLevel::ReadCommitted), None)
            .await?;

        if let Err(err) = prepare(&txn, key, table, lock_timeout).await {
            let _ = txn.rollback().await;
            return Err(err);
        }

        Ok(Self { txn })
    }

    /// Snapshot transaction for queries; takes no lock.
    pub async fn read_only(db: &DatabaseConnection) -> Result<Self, NestedSetError> {
        let txn = db
            .begin_with_config(
                Some(IsolationLevel::RepeatableRead),
                Some(AccessMode::ReadOnly),
            )
            .await?;
        Ok(Self { txn })
    }

    pub fn connection(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub async fn commit(self) -> Result<(), NestedSetError> {
        self.txn.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), NestedSetError> {
        self.txn.rollback().await?;
        Ok(())
    }
}

async fn prepare(
    txn: &DatabaseTransaction,
    key: Option<&AdvisoryLockKey>,
    table: &str,
    lock_timeout: Option<Duration>,
) -> Result<(), NestedSetError> {
    if let Some(timeout) = lock_timeout {
        // SET does not take bind parameters.
        txn.execute(Statement::from_string(
            DbBackend::Postgres,
            format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis()),
        ))
        .await?;
    }
    match key {
        Some(key) => acquire_lock(txn, key.as_str()).await,
        None => lock_table(txn, table).await,
    }
}

async fn acquire_lock(txn: &DatabaseTransaction, key: &str) -> Result<(), NestedSetError> {
    txn.execute(Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT pg_advisory_xact_lock(hashtext($1), 0)",
        vec![Value::from(key)],
    ))
    .await?;
    Ok(())
}

async fn lock_table(txn: &DatabaseTransaction, table: &str) -> Result<(), NestedSetError> {
    txn.execute(Statement::from_string(
        DbBackend::Postgres,
        format!(
            "LOCK TABLE \"{}\" IN SHARE ROW EXCLUSIVE MODE",
            table.replace('"', "\"\"")
        ),
    ))
    .await?;
    Ok(())
}
