//! # Database Schema
//!
//! SQL schema definitions for the chainkey database.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────┐        ┌─────────────────────┐                 │
//! │  │      subsets        │◄──┐    │      gateways       │                 │
//! │  ├─────────────────────┤   │    ├─────────────────────┤                 │
//! │  │ id                  │   ├────│ subset_id           │                 │
//! │  │ identifier (unique) │   │    │ gateway_guid (uniq) │                 │
//! │  │ previous_subset_id ─┼─► │    │ public_key          │                 │
//! │  │ next_subset_id ─────┼─► │    │ status, last_seen_at│                 │
//! │  └─────────────────────┘   │    └─────────────────────┘                 │
//! │                            │                                            │
//! │  ┌─────────────────────┐   │    ┌─────────────────────┐                 │
//! │  │      devices        │   │    │    device_keys      │                 │
//! │  ├─────────────────────┤   │    ├─────────────────────┤                 │
//! │  │ id                  │◄──┼────│ owner_device_id     │                 │
//! │  │ device_guid (uniq)  │   │    │ peer_device_id (0 = │                 │
//! │  │ subset_id ──────────┼───┘    │   none, groupwise)  │                 │
//! │  │ local_identifier    │        │ key_type, key_hash  │                 │
//! │  │ initial_secret_enc  │        │ key_version         │                 │
//! │  │ status              │        │ key_status          │                 │
//! │  └─────────────────────┘        └─────────────────────┘                 │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────┐                │
//! │  │                    key_tasks                        │                │
//! │  ├─────────────────────────────────────────────────────┤                │
//! │  │ id, task_type, status, recurrence, scheduled_at     │                │
//! │  │ target_device_id / target_subset_id / gateway_id    │                │
//! │  │ parent_task_id, initiated_by                        │                │
//! │  │ payload (sealed JSON), result_message, timestamps   │                │
//! │  └─────────────────────────────────────────────────────┘                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Subsets form an administrator-maintained doubly-linked chain
CREATE TABLE IF NOT EXISTS subsets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    previous_subset_id INTEGER REFERENCES subsets(id),
    next_subset_id INTEGER REFERENCES subsets(id),
    created_by INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Devices; the initial secret is only ever stored sealed
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_guid TEXT NOT NULL UNIQUE,
    subset_id INTEGER NOT NULL REFERENCES subsets(id),
    local_identifier TEXT NOT NULL,
    name TEXT,
    device_type TEXT,
    initial_secret_enc TEXT NOT NULL,
    security_alpha INTEGER NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT 'unprovisioned',
    created_by INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (subset_id, local_identifier)
);

CREATE INDEX IF NOT EXISTS idx_devices_subset ON devices(subset_id);
CREATE INDEX IF NOT EXISTS idx_devices_status ON devices(status, updated_at);

-- Gateways; public key registered out of band
CREATE TABLE IF NOT EXISTS gateways (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    gateway_guid TEXT NOT NULL UNIQUE,
    name TEXT,
    public_key TEXT,
    subset_id INTEGER REFERENCES subsets(id),
    status TEXT NOT NULL DEFAULT 'offline',
    last_seen_at INTEGER,
    ip_address TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gateways_subset ON gateways(subset_id, status);

-- Device keys; never the raw key, only its fingerprint.
-- peer_device_id is 0 for groupwise keys so the unique index applies.
CREATE TABLE IF NOT EXISTS device_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_device_id INTEGER NOT NULL REFERENCES devices(id),
    peer_device_id INTEGER NOT NULL DEFAULT 0,
    key_type TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    key_version INTEGER NOT NULL DEFAULT 1,
    key_status TEXT NOT NULL DEFAULT 'active',
    -- fingerprint of the nonce of the last rotation applied to this row
    last_refresh TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (owner_device_id, peer_device_id, key_type)
);

CREATE INDEX IF NOT EXISTS idx_device_keys_peer ON device_keys(peer_device_id);

-- Durable work items addressed to gateways
CREATE TABLE IF NOT EXISTS key_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    target_device_id INTEGER REFERENCES devices(id),
    target_subset_id INTEGER REFERENCES subsets(id),
    target_gateway_id INTEGER REFERENCES gateways(id),
    parent_task_id INTEGER REFERENCES key_tasks(id),
    initiated_by INTEGER NOT NULL,
    status TEXT NOT NULL,
    scheduled_at INTEGER,
    recurrence TEXT NOT NULL DEFAULT 'none',
    payload TEXT NOT NULL,
    result_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_key_tasks_due ON key_tasks(status, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_key_tasks_gateway ON key_tasks(target_gateway_id, status);
CREATE INDEX IF NOT EXISTS idx_key_tasks_device ON key_tasks(target_device_id, task_type);
"#;
