//! # Chainkey Core
//!
//! Key management for IoT devices grouped into subsets that form a chain.
//! Devices in adjacent subsets can derive pairwise keys from the vectors
//! they were provisioned with; the control plane rotates and revokes those
//! keys through one gateway per subset.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CHAINKEY CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   subset A ◄──prev── subset B ──next──► subset C                        │
//! │   (Vp for B)          (Vc)              (Vn for B)                      │
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │  Control    │  │ Derivation  │  │    Wire     │  │    Model     │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Topology  │  │ - Vectors   │  │ - Payloads  │  │ - Statuses   │   │
//! │  │ - Tasks     │  │ - Rotation  │  │ - Topics    │  │ - Task types │   │
//! │  │ - Handshake │  │ - Device    │  │ - Commands  │  │              │   │
//! │  └──────┬──────┘  └──────┬──────┘  └─────────────┘  └──────────────┘   │
//! │         │                │                                              │
//! │  ┌──────┴──────┐  ┌──────┴──────┐                                       │
//! │  │   Storage   │  │   Crypto    │                                       │
//! │  │             │  │             │                                       │
//! │  │ - SQLite    │  │ - AES-GCM   │                                       │
//! │  │ - Records   │  │ - Ed25519   │                                       │
//! │  │             │  │ - X25519    │                                       │
//! │  └─────────────┘  └─────────────┘                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error type shared by every crate in the workspace
//! - [`crypto`] - Envelopes, signatures, session transport, derivations
//! - [`storage`] - SQLite persistence
//! - [`model`] - Status and type enums
//! - [`wire`] - Messages exchanged between server, gateway and devices
//! - [`derivation`] - Vector construction, rotation plans, device key state
//! - [`control`] - The [`KeyService`](control::KeyService) operations
//! - [`time`] - Timestamp helpers

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod control;
pub mod crypto;
pub mod derivation;
pub mod error;
pub mod model;
pub mod storage;
pub mod time;
pub mod wire;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use control::{KeyService, ServiceConfig};
pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
