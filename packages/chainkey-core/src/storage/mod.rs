//! # Storage Module
//!
//! SQLite persistence for the control plane.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Tables:                                                                │
//! │  • subsets      - chain of network segments                             │
//! │  • devices      - devices, initial secret sealed under the master key   │
//! │  • gateways     - gateways and their registered public keys             │
//! │  • device_keys  - key fingerprints, one row per (owner, peer, type)     │
//! │  • key_tasks    - durable work items, payload sealed under master key   │
//! │                                                                         │
//! │  Nothing in this layer ever sees a plaintext secret.                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod database;
mod schema;

pub use database::{
    Database, DeviceKeyRecord, DeviceRecord, GatewayRecord, NewDevice, NewTask, Store,
    SubsetRecord, TaskRecord,
};
pub use schema::SCHEMA_VERSION;
