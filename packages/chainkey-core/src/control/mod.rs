//! # Control Module
//!
//! The control-plane side of key management: topology, provisioning,
//! rotation, revocation, scheduling and gateway trust.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CONTROL MODULE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │  Topology   │  │ Provisioning│  │  Registry   │  │  Revocation  │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Subsets   │  │ - Vc/Vp/Vn  │  │ - Upsert    │  │ - Status     │   │
//! │  │ - Chain     │  │ - Rotation  │  │ - Acks      │  │ - Keys       │   │
//! │  │ - Devices   │  │   fan-out   │  │ - List      │  │ - Broadcast  │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │         └────────────────┴───────┬────────┴────────────────┘           │
//! │                                  ▼                                      │
//! │  ┌─────────────┐  ┌─────────────────────────┐  ┌──────────────────┐    │
//! │  │  Handshake  │  │   Tasks / Scheduler     │  │    Reconcile     │    │
//! │  │             │  │                         │  │                  │    │
//! │  │ - Sign-in   │  │ - State machine         │  │ - Stuck          │    │
//! │  │ - Sessions  │  │ - Due sweep, recurrence │  │   provisioning   │    │
//! │  │ - Tokens    │  │ - Gateway hand-off      │  │                  │    │
//! │  └─────────────┘  └─────────────────────────┘  └──────────────────┘    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation is a method on [`KeyService`]; the submodules each add
//! one `impl KeyService` block.

mod service;
mod topology;
mod registry;
mod provisioning;
mod tasks;
mod scheduler;
mod revocation;
mod handshake;
mod reconcile;

pub use service::{KeyService, ServiceConfig};
pub use topology::{DeviceView, DEFAULT_ALPHA};
pub use tasks::ScheduleRequest;
pub use scheduler::{next_occurrence, SweepReport};
pub use revocation::Revocation;
pub use handshake::{signing_bytes, AuthGrant, AuthRequest, SessionRegistry};
