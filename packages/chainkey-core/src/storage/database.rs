//! # Database
//!
//! SQLite database wrapper and the typed row operations every component
//! builds on.
//!
//! ## Database Operations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────┐                                      │
//! │  │ topology / registry / tasks  │  Domain rules                        │
//! │  └──────────────┬───────────────┘                                      │
//! │                 │  db.run(|s| ..)  or  db.transaction(|s| ..)          │
//! │                 ▼                                                       │
//! │  ┌──────────────────────────────┐                                      │
//! │  │ Store<'c>   (this file)      │  Typed row operations                │
//! │  │  - subsets / devices         │  No business rules beyond            │
//! │  │  - gateways / device_keys    │  uniqueness and compare-and-set      │
//! │  │  - key_tasks                 │                                      │
//! │  └──────────────┬───────────────┘                                      │
//! │                 ▼                                                       │
//! │  ┌──────────────────────────────┐                                      │
//! │  │ rusqlite Connection          │  File in production,                 │
//! │  │ behind Arc<Mutex<_>>         │  in-memory for tests                 │
//! │  └──────────────────────────────┘                                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Multi-step operations (provisioning, refresh fan-out, revocation, child
//! task spawning) run inside `transaction`, so either every row is written or
//! none is.

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;

use super::schema;
use crate::error::{Error, Result};
use crate::model::{
    DeviceStatus, GatewayStatus, KeyStatus, KeyType, Recurrence, TaskStatus, TaskType,
};
use crate::time::now_timestamp;

/// The main database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::DatabaseError(format!("Failed to enable foreign keys: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;

                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| {
                    Error::DatabaseError(format!("Failed to set schema version: {}", e))
                })?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v == schema::SCHEMA_VERSION => {
                tracing::debug!("Database schema is current (version {})", v);
            }
            Some(v) => {
                return Err(Error::DatabaseError(format!(
                    "Unsupported schema version {} (expected {})",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
        }

        Ok(())
    }

    /// Run row operations on the shared connection.
    pub fn run<T>(&self, f: impl FnOnce(&Store<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&Store { conn: &conn })
    }

    /// Run row operations inside one SQLite transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls everything back.
    pub fn transaction<T>(&self, f: impl FnOnce(&Store<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        let out = f(&Store { conn: &tx })?;

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;
        Ok(out)
    }
}

/// Typed row operations over a connection or an open transaction
pub struct Store<'c> {
    conn: &'c Connection,
}

fn db_err(action: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::DatabaseError(format!("Failed to {}: {}", action, e))
}

/// Map a failed INSERT, turning uniqueness violations into `Conflict`
fn insert_err(what: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| match &e {
        rusqlite::Error::SqliteFailure(f, msg)
            if f.code == ErrorCode::ConstraintViolation
                && msg.as_deref().map_or(false, |m| m.contains("UNIQUE")) =>
        {
            Error::Conflict(format!("{} already exists", what))
        }
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
            Error::NotFound(format!("{} references a missing entity", what))
        }
        _ => Error::DatabaseError(format!("Failed to insert {}: {}", what, e)),
    }
}

impl<'c> Store<'c> {
    fn query_all<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
        action: &str,
    ) -> Result<Vec<T>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt.query_map(params, map).map_err(db_err(action))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err(action))?);
        }
        Ok(out)
    }

    // ========================================================================
    // SUBSET OPERATIONS
    // ========================================================================

    /// Insert a subset; duplicate identifiers are a `Conflict`
    pub fn insert_subset(
        &self,
        identifier: &str,
        name: &str,
        description: Option<&str>,
        created_by: i64,
    ) -> Result<i64> {
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO subsets (identifier, name, description, created_by, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![identifier, name, description, created_by, now, now],
            )
            .map_err(insert_err("Subset"))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_subset(&self, id: i64) -> Result<Option<SubsetRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM subsets WHERE id = ?", SUBSET_COLUMNS),
                params![id],
                SubsetRecord::from_row,
            )
            .optional()
            .map_err(db_err("get subset"))
    }

    pub fn get_subset_by_identifier(&self, identifier: &str) -> Result<Option<SubsetRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM subsets WHERE identifier = ?", SUBSET_COLUMNS),
                params![identifier],
                SubsetRecord::from_row,
            )
            .optional()
            .map_err(db_err("get subset"))
    }

    pub fn list_subsets(&self) -> Result<Vec<SubsetRecord>> {
        self.query_all(
            &format!("SELECT {} FROM subsets ORDER BY id", SUBSET_COLUMNS),
            [],
            SubsetRecord::from_row,
            "list subsets",
        )
    }

    /// Set one subset's previous neighbour (one direction only)
    pub fn set_subset_previous(&self, id: i64, previous: Option<i64>) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE subsets SET previous_subset_id = ?, updated_at = ? WHERE id = ?",
                params![previous, now_timestamp(), id],
            )
            .map_err(db_err("update subset link"))?;
        Ok(n > 0)
    }

    /// Set one subset's next neighbour (one direction only)
    pub fn set_subset_next(&self, id: i64, next: Option<i64>) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE subsets SET next_subset_id = ?, updated_at = ? WHERE id = ?",
                params![next, now_timestamp(), id],
            )
            .map_err(db_err("update subset link"))?;
        Ok(n > 0)
    }

    /// Number of devices, gateways and tasks that reference a subset
    pub fn subset_dependents(&self, id: i64) -> Result<(i64, i64, i64)> {
        let devices: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM devices WHERE subset_id = ?", params![id], |r| {
                r.get(0)
            })
            .map_err(db_err("count devices"))?;
        let gateways: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM gateways WHERE subset_id = ?", params![id], |r| {
                r.get(0)
            })
            .map_err(db_err("count gateways"))?;
        let tasks: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM key_tasks WHERE target_subset_id = ?",
                params![id],
                |r| r.get(0),
            )
            .map_err(db_err("count tasks"))?;
        Ok((devices, gateways, tasks))
    }

    pub fn delete_subset(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM subsets WHERE id = ?", params![id])
            .map_err(db_err("delete subset"))?;
        Ok(n > 0)
    }

    // ========================================================================
    // DEVICE OPERATIONS
    // ========================================================================

    pub fn insert_device(&self, device: &NewDevice<'_>) -> Result<i64> {
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO devices (device_guid, subset_id, local_identifier, name, device_type,
                                      initial_secret_enc, security_alpha, status, created_by,
                                      created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    device.device_guid,
                    device.subset_id,
                    device.local_identifier,
                    device.name,
                    device.device_type,
                    device.initial_secret_enc,
                    device.security_alpha,
                    DeviceStatus::Unprovisioned,
                    device.created_by,
                    now,
                    now,
                ],
            )
            .map_err(insert_err("Device"))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_device(&self, id: i64) -> Result<Option<DeviceRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?", DEVICE_COLUMNS),
                params![id],
                DeviceRecord::from_row,
            )
            .optional()
            .map_err(db_err("get device"))
    }

    pub fn get_device_by_guid(&self, guid: &str) -> Result<Option<DeviceRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE device_guid = ?", DEVICE_COLUMNS),
                params![guid],
                DeviceRecord::from_row,
            )
            .optional()
            .map_err(db_err("get device"))
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.query_all(
            &format!("SELECT {} FROM devices ORDER BY subset_id, id", DEVICE_COLUMNS),
            [],
            DeviceRecord::from_row,
            "list devices",
        )
    }

    /// Devices of a subset in insertion order; callers sort by local identifier
    pub fn devices_in_subset(&self, subset_id: i64) -> Result<Vec<DeviceRecord>> {
        self.query_all(
            &format!("SELECT {} FROM devices WHERE subset_id = ? ORDER BY id", DEVICE_COLUMNS),
            params![subset_id],
            DeviceRecord::from_row,
            "list subset devices",
        )
    }

    pub fn set_device_status(&self, id: i64, status: DeviceStatus) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE devices SET status = ?, updated_at = ? WHERE id = ?",
                params![status, now_timestamp(), id],
            )
            .map_err(db_err("update device status"))?;
        Ok(n > 0)
    }

    /// Devices stuck in `provisioning_pending` since before `older_than` with
    /// no open provision task
    pub fn stuck_provisioning(&self, older_than: i64) -> Result<Vec<DeviceRecord>> {
        self.query_all(
            &format!(
                "SELECT {} FROM devices d
                 WHERE d.status = 'provisioning_pending' AND d.updated_at <= ?
                   AND NOT EXISTS (
                       SELECT 1 FROM key_tasks t
                       WHERE t.target_device_id = d.id
                         AND t.task_type = 'provision'
                         AND t.status IN ('pending', 'in_progress')
                   )
                 ORDER BY d.updated_at",
                DEVICE_COLUMNS_D
            ),
            params![older_than],
            DeviceRecord::from_row,
            "find stuck devices",
        )
    }

    // ========================================================================
    // GATEWAY OPERATIONS
    // ========================================================================

    pub fn insert_gateway(
        &self,
        guid: &str,
        name: Option<&str>,
        public_key: Option<&str>,
        subset_id: Option<i64>,
    ) -> Result<i64> {
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO gateways (gateway_guid, name, public_key, subset_id, status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![guid, name, public_key, subset_id, GatewayStatus::Offline, now, now],
            )
            .map_err(insert_err("Gateway"))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_gateway(&self, id: i64) -> Result<Option<GatewayRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM gateways WHERE id = ?", GATEWAY_COLUMNS),
                params![id],
                GatewayRecord::from_row,
            )
            .optional()
            .map_err(db_err("get gateway"))
    }

    pub fn get_gateway_by_guid(&self, guid: &str) -> Result<Option<GatewayRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM gateways WHERE gateway_guid = ?", GATEWAY_COLUMNS),
                params![guid],
                GatewayRecord::from_row,
            )
            .optional()
            .map_err(db_err("get gateway"))
    }

    pub fn list_gateways(&self) -> Result<Vec<GatewayRecord>> {
        self.query_all(
            &format!("SELECT {} FROM gateways ORDER BY id", GATEWAY_COLUMNS),
            [],
            GatewayRecord::from_row,
            "list gateways",
        )
    }

    /// Gateways serving a subset, online ones first
    pub fn gateways_for_subset(&self, subset_id: i64) -> Result<Vec<GatewayRecord>> {
        self.query_all(
            &format!(
                "SELECT {} FROM gateways WHERE subset_id = ?
                 ORDER BY CASE status WHEN 'online' THEN 0 ELSE 1 END, id",
                GATEWAY_COLUMNS
            ),
            params![subset_id],
            GatewayRecord::from_row,
            "list subset gateways",
        )
    }

    pub fn mark_gateway_online(&self, id: i64, ip_address: Option<&str>) -> Result<bool> {
        let now = now_timestamp();
        let n = self
            .conn
            .execute(
                "UPDATE gateways SET status = ?, last_seen_at = ?, ip_address = ?, updated_at = ?
                 WHERE id = ?",
                params![GatewayStatus::Online, now, ip_address, now, id],
            )
            .map_err(db_err("update gateway"))?;
        Ok(n > 0)
    }

    pub fn set_gateway_status(&self, id: i64, status: GatewayStatus) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE gateways SET status = ?, updated_at = ? WHERE id = ?",
                params![status, now_timestamp(), id],
            )
            .map_err(db_err("update gateway"))?;
        Ok(n > 0)
    }

    // ========================================================================
    // DEVICE KEY OPERATIONS
    // ========================================================================

    /// Insert a key record at version 1, or update the existing
    /// (owner, peer, type) row and bump its version.
    pub fn upsert_device_key(
        &self,
        owner_device_id: i64,
        peer_device_id: Option<i64>,
        key_type: KeyType,
        key_hash: &str,
        key_status: KeyStatus,
    ) -> Result<DeviceKeyRecord> {
        let now = now_timestamp();
        let peer = peer_device_id.unwrap_or(0);

        self.conn
            .execute(
                "INSERT INTO device_keys (owner_device_id, peer_device_id, key_type, key_hash,
                                          key_version, key_status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)
                 ON CONFLICT (owner_device_id, peer_device_id, key_type) DO UPDATE SET
                     key_hash = excluded.key_hash,
                     key_status = excluded.key_status,
                     key_version = device_keys.key_version + 1,
                     updated_at = excluded.updated_at",
                params![owner_device_id, peer, key_type, key_hash, key_status, now],
            )
            .map_err(insert_err("Device key"))?;

        self.get_device_key(owner_device_id, peer_device_id, key_type)?
            .ok_or_else(|| Error::DatabaseError("Device key vanished after upsert".into()))
    }

    pub fn get_device_key(
        &self,
        owner_device_id: i64,
        peer_device_id: Option<i64>,
        key_type: KeyType,
    ) -> Result<Option<DeviceKeyRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM device_keys
                     WHERE owner_device_id = ? AND peer_device_id = ? AND key_type = ?",
                    DEVICE_KEY_COLUMNS
                ),
                params![owner_device_id, peer_device_id.unwrap_or(0), key_type],
                DeviceKeyRecord::from_row,
            )
            .optional()
            .map_err(db_err("get device key"))
    }

    /// Mark every key the device owns or is peer of as revoked
    pub fn revoke_keys_for_device(&self, device_id: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE device_keys SET key_status = ?1, updated_at = ?2
                 WHERE (owner_device_id = ?3 OR peer_device_id = ?3) AND key_status != ?1",
                params![KeyStatus::Revoked, now_timestamp(), device_id],
            )
            .map_err(db_err("revoke device keys"))
    }

    /// Active pairwise rows where the device is owner or peer
    pub fn active_pairwise_for_device(&self, device_id: i64) -> Result<Vec<DeviceKeyRecord>> {
        self.query_all(
            &format!(
                "SELECT {} FROM device_keys
                 WHERE (owner_device_id = ?1 OR peer_device_id = ?1)
                   AND key_type = 'pairwise' AND key_status = 'active'
                 ORDER BY id",
                DEVICE_KEY_COLUMNS
            ),
            params![device_id],
            DeviceKeyRecord::from_row,
            "list pairwise keys",
        )
    }

    /// Active pairwise rows between two devices, in either direction
    pub fn active_pairwise_between(&self, a: i64, b: i64) -> Result<Vec<DeviceKeyRecord>> {
        self.query_all(
            &format!(
                "SELECT {} FROM device_keys
                 WHERE ((owner_device_id = ?1 AND peer_device_id = ?2)
                     OR (owner_device_id = ?2 AND peer_device_id = ?1))
                   AND key_type = 'pairwise' AND key_status = 'active'
                 ORDER BY id",
                DEVICE_KEY_COLUMNS
            ),
            params![a, b],
            DeviceKeyRecord::from_row,
            "list pairwise keys",
        )
    }

    /// Record a refresh on an active key row: version + 1, optional new hash.
    ///
    /// With a `rotation` marker the bump happens at most once per marker;
    /// a row already carrying it is left alone and `false` is returned.
    pub fn bump_key_version(
        &self,
        key_id: i64,
        new_hash: Option<&str>,
        rotation: Option<&str>,
    ) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE device_keys
                 SET key_version = key_version + 1,
                     key_hash = COALESCE(?1, key_hash),
                     last_refresh = COALESCE(?2, last_refresh),
                     updated_at = ?3
                 WHERE id = ?4 AND key_status = 'active'
                   AND (?2 IS NULL OR last_refresh IS NULL OR last_refresh != ?2)",
                params![new_hash, rotation, now_timestamp(), key_id],
            )
            .map_err(db_err("refresh device key"))?;
        Ok(n > 0)
    }

    pub fn list_device_keys(&self, device_id: Option<i64>) -> Result<Vec<DeviceKeyRecord>> {
        match device_id {
            Some(id) => self.query_all(
                &format!(
                    "SELECT {} FROM device_keys
                     WHERE owner_device_id = ?1 OR peer_device_id = ?1 ORDER BY id",
                    DEVICE_KEY_COLUMNS
                ),
                params![id],
                DeviceKeyRecord::from_row,
                "list device keys",
            ),
            None => self.query_all(
                &format!("SELECT {} FROM device_keys ORDER BY id", DEVICE_KEY_COLUMNS),
                [],
                DeviceKeyRecord::from_row,
                "list device keys",
            ),
        }
    }

    // ========================================================================
    // TASK OPERATIONS
    // ========================================================================

    pub fn insert_task(&self, task: &NewTask) -> Result<i64> {
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO key_tasks (task_type, target_device_id, target_subset_id,
                                        target_gateway_id, parent_task_id, initiated_by, status,
                                        scheduled_at, recurrence, payload, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    task.task_type,
                    task.target_device_id,
                    task.target_subset_id,
                    task.target_gateway_id,
                    task.parent_task_id,
                    task.initiated_by,
                    task.status,
                    task.scheduled_at,
                    task.recurrence,
                    task.payload,
                    now,
                    now,
                ],
            )
            .map_err(insert_err("Task"))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM key_tasks WHERE id = ?", TASK_COLUMNS),
                params![id],
                TaskRecord::from_row,
            )
            .optional()
            .map_err(db_err("get task"))
    }

    /// Most recent tasks first
    pub fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        self.query_all(
            &format!("SELECT {} FROM key_tasks ORDER BY id DESC LIMIT ?", TASK_COLUMNS),
            params![limit as i64],
            TaskRecord::from_row,
            "list tasks",
        )
    }

    pub fn child_tasks(&self, parent_id: i64) -> Result<Vec<TaskRecord>> {
        self.query_all(
            &format!(
                "SELECT {} FROM key_tasks WHERE parent_task_id = ? ORDER BY id",
                TASK_COLUMNS
            ),
            params![parent_id],
            TaskRecord::from_row,
            "list child tasks",
        )
    }

    pub fn pending_tasks_for_gateway(&self, gateway_id: i64) -> Result<Vec<TaskRecord>> {
        self.query_all(
            &format!(
                "SELECT {} FROM key_tasks WHERE target_gateway_id = ? AND status = 'pending'
                 ORDER BY id",
                TASK_COLUMNS
            ),
            params![gateway_id],
            TaskRecord::from_row,
            "list gateway tasks",
        )
    }

    /// Scheduled tasks whose time has come, oldest first
    pub fn due_tasks(&self, now: i64) -> Result<Vec<TaskRecord>> {
        self.query_all(
            &format!(
                "SELECT {} FROM key_tasks
                 WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
                 ORDER BY scheduled_at, id",
                TASK_COLUMNS
            ),
            params![now],
            TaskRecord::from_row,
            "list due tasks",
        )
    }

    /// Compare-and-set a task's status.
    ///
    /// Returns false when the task is no longer in `from` (someone else moved
    /// it first). Entering `in_progress` stamps `started_at`; entering a
    /// terminal state stamps `completed_at`.
    pub fn transition_task(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        result_message: Option<&str>,
    ) -> Result<bool> {
        let now = now_timestamp();
        let started = (to == TaskStatus::InProgress).then_some(now);
        let completed = to.is_terminal().then_some(now);

        let n = self
            .conn
            .execute(
                "UPDATE key_tasks
                 SET status = ?1,
                     result_message = COALESCE(?2, result_message),
                     started_at = COALESCE(?3, started_at),
                     completed_at = COALESCE(?4, completed_at),
                     updated_at = ?5
                 WHERE id = ?6 AND status = ?7",
                params![to, result_message, started, completed, now, id, from],
            )
            .map_err(db_err("update task status"))?;
        Ok(n > 0)
    }

    /// Move an in-progress recurring task back to `scheduled` at `next_at`
    pub fn reschedule_task(&self, id: i64, next_at: i64, result_message: &str) -> Result<bool> {
        let now = now_timestamp();
        let n = self
            .conn
            .execute(
                "UPDATE key_tasks
                 SET status = ?, scheduled_at = ?, result_message = ?, completed_at = ?, updated_at = ?
                 WHERE id = ? AND status = ?",
                params![
                    TaskStatus::Scheduled,
                    next_at,
                    result_message,
                    now,
                    now,
                    id,
                    TaskStatus::InProgress
                ],
            )
            .map_err(db_err("reschedule task"))?;
        Ok(n > 0)
    }
}

// ============================================================================
// RECORD TYPES
// ============================================================================

const SUBSET_COLUMNS: &str = "id, identifier, name, description, previous_subset_id, \
     next_subset_id, created_by, created_at, updated_at";

const DEVICE_COLUMNS: &str = "id, device_guid, subset_id, local_identifier, name, device_type, \
     initial_secret_enc, security_alpha, status, created_by, created_at, updated_at";

const DEVICE_COLUMNS_D: &str = "d.id, d.device_guid, d.subset_id, d.local_identifier, d.name, \
     d.device_type, d.initial_secret_enc, d.security_alpha, d.status, d.created_by, \
     d.created_at, d.updated_at";

const GATEWAY_COLUMNS: &str = "id, gateway_guid, name, public_key, subset_id, status, \
     last_seen_at, ip_address, created_at, updated_at";

const DEVICE_KEY_COLUMNS: &str = "id, owner_device_id, peer_device_id, key_type, key_hash, \
     key_version, key_status, created_at, updated_at";

const TASK_COLUMNS: &str = "id, task_type, target_device_id, target_subset_id, \
     target_gateway_id, parent_task_id, initiated_by, status, scheduled_at, recurrence, \
     payload, result_message, created_at, updated_at, started_at, completed_at";

/// A subset record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetRecord {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    pub description: Option<String>,
    pub previous_subset_id: Option<i64>,
    pub next_subset_id: Option<i64>,
    pub created_by: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SubsetRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identifier: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            previous_subset_id: row.get(4)?,
            next_subset_id: row.get(5)?,
            created_by: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

/// A device record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: i64,
    pub device_guid: String,
    pub subset_id: i64,
    #[serde(rename = "localIdentifierInSubset")]
    pub local_identifier: String,
    pub name: Option<String>,
    pub device_type: Option<String>,
    /// Sealed under the master key; never serialized
    #[serde(skip_serializing)]
    pub initial_secret_enc: String,
    #[serde(rename = "securityParameterAlpha")]
    pub security_alpha: i64,
    pub status: DeviceStatus,
    pub created_by: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeviceRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_guid: row.get(1)?,
            subset_id: row.get(2)?,
            local_identifier: row.get(3)?,
            name: row.get(4)?,
            device_type: row.get(5)?,
            initial_secret_enc: row.get(6)?,
            security_alpha: row.get(7)?,
            status: row.get(8)?,
            created_by: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

/// Fields for a new device row
#[derive(Debug, Clone)]
pub struct NewDevice<'a> {
    pub device_guid: &'a str,
    pub subset_id: i64,
    pub local_identifier: &'a str,
    pub name: Option<&'a str>,
    pub device_type: Option<&'a str>,
    pub initial_secret_enc: &'a str,
    pub security_alpha: i64,
    pub created_by: i64,
}

/// A gateway record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRecord {
    pub id: i64,
    pub gateway_guid: String,
    pub name: Option<String>,
    pub public_key: Option<String>,
    pub subset_id: Option<i64>,
    pub status: GatewayStatus,
    pub last_seen_at: Option<i64>,
    pub ip_address: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl GatewayRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            gateway_guid: row.get(1)?,
            name: row.get(2)?,
            public_key: row.get(3)?,
            subset_id: row.get(4)?,
            status: row.get(5)?,
            last_seen_at: row.get(6)?,
            ip_address: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

/// A device key record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyRecord {
    pub id: i64,
    pub owner_device_id: i64,
    pub peer_device_id: Option<i64>,
    pub key_type: KeyType,
    pub key_hash: String,
    pub key_version: i64,
    pub key_status: KeyStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeviceKeyRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let peer: i64 = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            owner_device_id: row.get(1)?,
            peer_device_id: (peer != 0).then_some(peer),
            key_type: row.get(3)?,
            key_hash: row.get(4)?,
            key_version: row.get(5)?,
            key_status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    /// The other device in this row, seen from `device_id`
    pub fn counterpart(&self, device_id: i64) -> Option<i64> {
        if self.owner_device_id == device_id {
            self.peer_device_id
        } else {
            Some(self.owner_device_id)
        }
    }
}

/// A task record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(rename = "taskId")]
    pub id: i64,
    pub task_type: TaskType,
    pub target_device_id: Option<i64>,
    pub target_subset_id: Option<i64>,
    pub target_gateway_id: Option<i64>,
    pub parent_task_id: Option<i64>,
    #[serde(rename = "initiatedByUserId")]
    pub initiated_by: i64,
    pub status: TaskStatus,
    pub scheduled_at: Option<i64>,
    pub recurrence: Recurrence,
    /// Sealed under the master key; never serialized
    #[serde(skip_serializing)]
    pub payload: String,
    pub result_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl TaskRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            target_device_id: row.get(2)?,
            target_subset_id: row.get(3)?,
            target_gateway_id: row.get(4)?,
            parent_task_id: row.get(5)?,
            initiated_by: row.get(6)?,
            status: row.get(7)?,
            scheduled_at: row.get(8)?,
            recurrence: row.get(9)?,
            payload: row.get(10)?,
            result_message: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }
}

/// Fields for a new task row
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub target_device_id: Option<i64>,
    pub target_subset_id: Option<i64>,
    pub target_gateway_id: Option<i64>,
    pub parent_task_id: Option<i64>,
    pub initiated_by: i64,
    pub status: TaskStatus,
    pub scheduled_at: Option<i64>,
    pub recurrence: Recurrence,
    pub payload: String,
}

// ============================================================================
// TESTS
// ============================================================================
