// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed flow store.
//!
//! Reference storage backend. Every epoch-gated method is a single `UPDATE`
//! whose `WHERE` clause carries the expected epoch (and, for result commits,
//! `status = 'executing'`); SQLite serializes writers, so a zero-row update is
//! exactly the "another executor got there first" signal the contract demands.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::error::FlowError;
use crate::identity::{FlowId, ReplicaId};
use crate::status::{Epoch, Status};

use super::{FlowStore, StoredFlow, SuspendResult};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed flow store.
#[derive(Clone)]
pub struct SqliteFlowStore {
    pool: SqlitePool,
}

/// Raw row shape; converted into [`StoredFlow`] after fetching.
#[derive(sqlx::FromRow)]
struct FlowRow {
    flow_type: String,
    instance: String,
    human_instance_id: String,
    status: String,
    epoch: i32,
    param: Vec<u8>,
    state: Option<Vec<u8>>,
    result: Option<Vec<u8>>,
    error: Option<Vec<u8>>,
    postpone_until: Option<DateTime<Utc>>,
    suspend_after: Option<i64>,
    interrupt_count: i64,
    lease_expiration: Option<DateTime<Utc>>,
    owner: Option<String>,
    parent: Option<String>,
    status_changed_at: DateTime<Utc>,
}

impl FlowRow {
    fn into_stored(self) -> Result<StoredFlow, FlowError> {
        let status = Status::parse(&self.status).ok_or_else(|| FlowError::Database {
            operation: "decode".to_string(),
            details: format!("unknown status '{}'", self.status),
        })?;
        let owner = self
            .owner
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| FlowError::Database {
                operation: "decode".to_string(),
                details: format!("invalid owner uuid: {}", e),
            })?
            .map(ReplicaId::from_uuid);
        Ok(StoredFlow {
            id: FlowId::new(self.flow_type, self.instance),
            human_instance_id: self.human_instance_id,
            status,
            epoch: self.epoch,
            param: self.param,
            state: self.state,
            result: self.result,
            error: self.error,
            postpone_until: self.postpone_until,
            suspend_after: self.suspend_after,
            interrupt_count: self.interrupt_count,
            lease_expiration: self.lease_expiration,
            owner,
            parent: self.parent.as_deref().and_then(FlowId::parse),
            status_changed_at: self.status_changed_at,
        })
    }
}

const SELECT_FLOW: &str = r#"
    SELECT flow_type, instance, human_instance_id, status, epoch, param, state,
           result, error, postpone_until, suspend_after, interrupt_count,
           lease_expiration, owner, parent, status_changed_at
    FROM flows
    WHERE flow_type = ? AND instance = ?
"#;

impl SqliteFlowStore {
    /// Create a flow store from an existing pool. Migrations must already
    /// have been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a flow store from a database file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// with sensible defaults, and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| FlowError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| FlowError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| FlowError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Create and initialize a flow store from a SQLite connection URL
    /// (e.g. `sqlite:.data/flows.db` or `sqlite::memory:`).
    pub async fn connect(url: &str) -> Result<Self, FlowError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| FlowError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| FlowError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    async fn create_flow(
        &self,
        id: &FlowId,
        human_instance_id: &str,
        param: &[u8],
        lease_expiration: DateTime<Utc>,
        postpone_until: Option<DateTime<Utc>>,
        parent: Option<&FlowId>,
        owner: Option<ReplicaId>,
    ) -> Result<bool, FlowError> {
        let status = if postpone_until.is_some() {
            Status::Postponed
        } else {
            Status::Executing
        };
        let lease = match status {
            Status::Executing => Some(lease_expiration),
            _ => None,
        };
        let owner = match status {
            Status::Executing => owner.map(|o| o.to_string()),
            _ => None,
        };
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO flows
                (flow_type, instance, human_instance_id, status, epoch, param,
                 postpone_until, lease_expiration, owner, parent, status_changed_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .bind(human_instance_id)
        .bind(status.as_str())
        .bind(param)
        .bind(postpone_until)
        .bind(lease)
        .bind(owner)
        .bind(parent.map(|p| p.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_flow(&self, id: &FlowId) -> Result<Option<StoredFlow>, FlowError> {
        let row = sqlx::query_as::<_, FlowRow>(SELECT_FLOW)
            .bind(id.flow_type.as_str())
            .bind(id.instance.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(FlowRow::into_stored).transpose()
    }

    async fn set_flow_state(
        &self,
        id: &FlowId,
        status: Status,
        param: Option<&[u8]>,
        state: Option<&[u8]>,
        result: Option<&[u8]>,
        error: Option<&[u8]>,
        postpone_until: Option<DateTime<Utc>>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError> {
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = ?,
                epoch = epoch + 1,
                param = COALESCE(?, param),
                state = COALESCE(?, state),
                result = ?,
                error = ?,
                postpone_until = ?,
                lease_expiration = NULL,
                owner = NULL,
                status_changed_at = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ?
            "#,
        )
        .bind(status.as_str())
        .bind(param)
        .bind(state)
        .bind(result)
        .bind(error)
        .bind(postpone_until)
        .bind(Utc::now())
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn succeed_flow(
        &self,
        id: &FlowId,
        result: &[u8],
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError> {
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = 'succeeded',
                epoch = epoch + 1,
                result = ?,
                state = COALESCE(?, state),
                postpone_until = NULL,
                lease_expiration = NULL,
                owner = NULL,
                status_changed_at = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ? AND status = 'executing'
            "#,
        )
        .bind(result)
        .bind(state)
        .bind(Utc::now())
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn postpone_flow(
        &self,
        id: &FlowId,
        postpone_until: DateTime<Utc>,
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError> {
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = 'postponed',
                epoch = epoch + 1,
                postpone_until = ?,
                state = COALESCE(?, state),
                lease_expiration = NULL,
                owner = NULL,
                status_changed_at = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ? AND status = 'executing'
            "#,
        )
        .bind(postpone_until)
        .bind(state)
        .bind(Utc::now())
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn fail_flow(
        &self,
        id: &FlowId,
        error: &[u8],
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError> {
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = 'failed',
                epoch = epoch + 1,
                error = ?,
                state = COALESCE(?, state),
                postpone_until = NULL,
                lease_expiration = NULL,
                owner = NULL,
                status_changed_at = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ? AND status = 'executing'
            "#,
        )
        .bind(error)
        .bind(state)
        .bind(Utc::now())
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn suspend_flow(
        &self,
        id: &FlowId,
        expected_interrupts: i64,
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<SuspendResult, FlowError> {
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = 'suspended',
                epoch = epoch + 1,
                suspend_after = ?,
                state = COALESCE(?, state),
                postpone_until = NULL,
                lease_expiration = NULL,
                owner = NULL,
                status_changed_at = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ?
              AND status = 'executing' AND interrupt_count < ?
            "#,
        )
        .bind(expected_interrupts)
        .bind(state)
        .bind(Utc::now())
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .bind(expected_epoch)
        .bind(expected_interrupts)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(SuspendResult::Suspended);
        }

        // Distinguish an interrupt race from a genuine epoch conflict.
        let row: Option<(i32, i64)> = sqlx::query_as(
            r#"SELECT epoch, interrupt_count FROM flows WHERE flow_type = ? AND instance = ?"#,
        )
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((epoch, interrupts))
                if epoch == expected_epoch && interrupts >= expected_interrupts =>
            {
                Ok(SuspendResult::WasInterrupted)
            }
            _ => Ok(SuspendResult::Conflict),
        }
    }

    async fn restart_execution(
        &self,
        id: &FlowId,
        expected_epoch: Epoch,
        new_lease_expiration: DateTime<Utc>,
        owner: ReplicaId,
    ) -> Result<Option<StoredFlow>, FlowError> {
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = 'executing',
                epoch = epoch + 1,
                lease_expiration = ?,
                owner = ?,
                postpone_until = NULL,
                suspend_after = NULL,
                status_changed_at = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ?
              AND status IN ('postponed', 'failed', 'suspended')
            "#,
        )
        .bind(new_lease_expiration)
        .bind(owner.to_string())
        .bind(Utc::now())
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() != 1 {
            return Ok(None);
        }

        // Only the election winner reaches this read; the row is ours at
        // epoch expected_epoch + 1 until we commit or our lease expires.
        self.get_flow(id).await
    }

    async fn get_expired_leases(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<(FlowId, Epoch)>, FlowError> {
        let rows: Vec<(String, String, i32)> = sqlx::query_as(
            r#"
            SELECT flow_type, instance, epoch
            FROM flows
            WHERE status = 'executing' AND lease_expiration <= ?
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(flow_type, instance, epoch)| (FlowId::new(flow_type, instance), epoch))
            .collect())
    }

    async fn get_eligible_postponed(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<(FlowId, Epoch)>, FlowError> {
        let rows: Vec<(String, String, i32)> = sqlx::query_as(
            r#"
            SELECT flow_type, instance, epoch
            FROM flows
            WHERE status = 'postponed' AND (postpone_until IS NULL OR postpone_until <= ?)
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(flow_type, instance, epoch)| (FlowId::new(flow_type, instance), epoch))
            .collect())
    }

    async fn renew_leases(
        &self,
        leases: &[(FlowId, Epoch)],
        new_expiration: DateTime<Utc>,
    ) -> Result<u64, FlowError> {
        let mut renewed = 0;
        for (id, epoch) in leases {
            let updated = sqlx::query(
                r#"
                UPDATE flows
                SET lease_expiration = ?
                WHERE flow_type = ? AND instance = ? AND epoch = ? AND status = 'executing'
                "#,
            )
            .bind(new_expiration)
            .bind(id.flow_type.as_str())
            .bind(id.instance.as_str())
            .bind(epoch)
            .execute(&self.pool)
            .await?;
            renewed += updated.rows_affected();
        }
        Ok(renewed)
    }

    async fn reschedule_crashed(&self, before: DateTime<Utc>) -> Result<u64, FlowError> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = 'postponed',
                epoch = epoch + 1,
                postpone_until = ?,
                lease_expiration = NULL,
                owner = NULL,
                status_changed_at = ?
            WHERE status = 'executing' AND lease_expiration <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected())
    }

    async fn reschedule_owned_by(&self, owner: ReplicaId) -> Result<u64, FlowError> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = 'postponed',
                epoch = epoch + 1,
                postpone_until = ?,
                lease_expiration = NULL,
                owner = NULL,
                status_changed_at = ?
            WHERE status = 'executing' AND owner = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(owner.to_string())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected())
    }

    async fn interrupt(&self, id: &FlowId) -> Result<bool, FlowError> {
        let mut tx = self.pool.begin().await?;

        let counted = sqlx::query(
            r#"
            UPDATE flows
            SET interrupt_count = interrupt_count + 1
            WHERE flow_type = ? AND instance = ?
            "#,
        )
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .execute(&mut *tx)
        .await?;

        if counted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE flows
            SET status = 'postponed',
                epoch = epoch + 1,
                postpone_until = ?,
                suspend_after = NULL,
                status_changed_at = ?
            WHERE flow_type = ? AND instance = ?
              AND status = 'suspended' AND interrupt_count >= suspend_after
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.flow_type.as_str())
        .bind(id.instance.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_flow(&self, id: &FlowId) -> Result<bool, FlowError> {
        let deleted = sqlx::query(r#"DELETE FROM flows WHERE flow_type = ? AND instance = ?"#)
            .bind(id.flow_type.as_str())
            .bind(id.instance.as_str())
            .execute(&self.pool)
            .await?;

        Ok(deleted.rows_affected() == 1)
    }
}
