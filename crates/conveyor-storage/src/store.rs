// SQLite store
//
// One shared handle; all access goes through it. WAL and a busy timeout are
// set at open for reader/writer concurrency. All writes are upserts keyed
// by the primary key; transactions are used only for migration. Marked PII
// fields are encrypted on write and decrypted on read.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use conveyor_core::machine::WorkflowInstance;
use conveyor_core::{DataMap, DataMapExt};

use crate::encryption::FieldEncryptor;
use crate::models::{ResourceRow, UserRecord, UserRow, WorkflowInstanceRow};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    encryptor: FieldEncryptor,
}

impl Store {
    /// Open (creating the file if needed), set WAL + busy timeout and run
    /// the idempotent migrations.
    pub async fn open(url: &str, encryptor: FieldEncryptor) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url '{}'", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        // An in-memory database exists per connection; a larger pool would
        // hand out empty databases after migration.
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open database")?;

        let store = Self { pool, encryptor };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema migration. Tables use CREATE IF NOT EXISTS;
    /// columns added after the initial schema are guarded by a
    /// pragma lookup so re-running is safe.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                workflow_type TEXT NOT NULL,
                current_state TEXT NOT NULL,
                previous_state TEXT,
                data TEXT NOT NULL,
                start_time TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                resource_type TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                state TEXT,
                last_update TEXT NOT NULL,
                PRIMARY KEY (resource_type, id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                data TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // Added after the initial schema shipped
        if !column_exists(&mut tx, "workflow_instances", "error").await? {
            sqlx::query("ALTER TABLE workflow_instances ADD COLUMN error TEXT")
                .execute(&mut *tx)
                .await?;
        }

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_instances_workflow_type ON workflow_instances (workflow_type)",
            "CREATE INDEX IF NOT EXISTS idx_instances_current_state ON workflow_instances (current_state)",
            "CREATE INDEX IF NOT EXISTS idx_instances_completed ON workflow_instances (completed)",
            "CREATE INDEX IF NOT EXISTS idx_resources_resource_type ON resources (resource_type)",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    // ============================================
    // Workflow instances
    // ============================================

    pub async fn save_workflow_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        let data = self.encryptor.encrypt_map(&instance.data)?;
        let data_json = serde_json::to_string(&data)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, workflow_type, current_state, previous_state, data, start_time, last_updated, completed, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                workflow_type = excluded.workflow_type,
                current_state = excluded.current_state,
                previous_state = excluded.previous_state,
                data = excluded.data,
                start_time = excluded.start_time,
                last_updated = excluded.last_updated,
                completed = excluded.completed,
                error = excluded.error
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.workflow_type)
        .bind(&instance.current_state)
        .bind(&instance.previous_state)
        .bind(&data_json)
        .bind(fmt_ts(&instance.start_time))
        .bind(fmt_ts(&instance.last_updated))
        .bind(instance.completed)
        .bind(&instance.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_workflow_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query_as::<_, WorkflowInstanceRow>(
            "SELECT id, workflow_type, current_state, previous_state, data, start_time, last_updated, completed, error
             FROM workflow_instances WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.row_to_instance(r)).transpose()
    }

    pub async fn load_workflow_instances(
        &self,
        workflow_type: &str,
    ) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query_as::<_, WorkflowInstanceRow>(
            "SELECT id, workflow_type, current_state, previous_state, data, start_time, last_updated, completed, error
             FROM workflow_instances WHERE workflow_type = ?1 ORDER BY start_time",
        )
        .bind(workflow_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_instance(r)).collect()
    }

    pub async fn load_all_workflow_instances(&self) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query_as::<_, WorkflowInstanceRow>(
            "SELECT id, workflow_type, current_state, previous_state, data, start_time, last_updated, completed, error
             FROM workflow_instances ORDER BY start_time",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_instance(r)).collect()
    }

    fn row_to_instance(&self, row: WorkflowInstanceRow) -> Result<WorkflowInstance> {
        let data: DataMap = serde_json::from_str(&row.data)?;
        Ok(WorkflowInstance {
            id: row.id,
            workflow_type: row.workflow_type,
            current_state: row.current_state,
            previous_state: row.previous_state,
            data: self.encryptor.decrypt_map(&data)?,
            start_time: parse_ts(&row.start_time)?,
            last_updated: parse_ts(&row.last_updated)?,
            completed: row.completed,
            error: row.error,
        })
    }

    // ============================================
    // Resources
    // ============================================

    pub async fn save_resource(&self, resource_type: &str, id: &str, data: &DataMap) -> Result<()> {
        let state = data.get_str("state").map(|s| s.to_string());
        let encrypted = self.encryptor.encrypt_map(data)?;
        let data_json = serde_json::to_string(&encrypted)?;

        sqlx::query(
            r#"
            INSERT INTO resources (resource_type, id, data, state, last_update)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(resource_type, id) DO UPDATE SET
                data = excluded.data,
                state = excluded.state,
                last_update = excluded.last_update
            "#,
        )
        .bind(resource_type)
        .bind(id)
        .bind(&data_json)
        .bind(&state)
        .bind(fmt_ts(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_resource(&self, resource_type: &str, id: &str) -> Result<Option<DataMap>> {
        let row = sqlx::query_as::<_, ResourceRow>(
            "SELECT resource_type, id, data, state, last_update
             FROM resources WHERE resource_type = ?1 AND id = ?2",
        )
        .bind(resource_type)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let data: DataMap = serde_json::from_str(&row.data)?;
                Ok(Some(self.encryptor.decrypt_map(&data)?))
            }
            None => Ok(None),
        }
    }

    pub async fn load_resources(&self, resource_type: &str) -> Result<HashMap<String, DataMap>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            "SELECT resource_type, id, data, state, last_update
             FROM resources WHERE resource_type = ?1",
        )
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;

        let mut resources = HashMap::with_capacity(rows.len());
        for row in rows {
            let data: DataMap = serde_json::from_str(&row.data)?;
            resources.insert(row.id, self.encryptor.decrypt_map(&data)?);
        }
        Ok(resources)
    }

    pub async fn delete_resource(&self, resource_type: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resources WHERE resource_type = ?1 AND id = ?2")
            .bind(resource_type)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Users
    // ============================================

    pub async fn save_user(&self, user: &UserRecord) -> Result<()> {
        let data = self.encryptor.encrypt_map(&user.data)?;
        let data_json = serde_json::to_string(&data)?;

        sqlx::query(
            r#"
            INSERT INTO users (id, email, name, data, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&data_json)
        .bind(fmt_ts(&user.created_at))
        .bind(fmt_ts(&user.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, name, data, created_at, updated_at FROM users ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_user(r)).collect()
    }

    pub async fn load_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, name, data, created_at, updated_at FROM users WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.row_to_user(r)).transpose()
    }

    pub async fn delete_user(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn row_to_user(&self, row: UserRow) -> Result<UserRecord> {
        let data: DataMap = match row.data {
            Some(json) => serde_json::from_str(&json)?,
            None => DataMap::new(),
        };
        Ok(UserRecord {
            id: row.id,
            email: row.email,
            name: row.name,
            data: self.encryptor.decrypt_map(&data)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

async fn column_exists(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    column: &str,
) -> Result<bool> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column))
}

/// RFC 3339 with nanosecond precision, the on-disk time format.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}
