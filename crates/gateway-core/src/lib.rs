//! # gateway-core
//!
//! Coordination core of the cvmfs publishing gateway.
//!
//! Multiple untrusted release managers push updates to a shared namespace
//! of content-addressed, versioned repositories. This crate arbitrates who
//! may write what subtree and when:
//!
//! - **Leases**: path-scoped, time-bounded exclusive reservations backed by
//!   a persistent store, held via minted bearer tokens.
//! - **Named locks**: per-repository mutual exclusion so commits and
//!   garbage collection never overlap.
//! - **Access configuration**: repository → key → subpath authorization.
//! - **Action controller**: the state transitions linking lease
//!   acquisition, payload submission, commit, cancellation, and garbage
//!   collection, delegating content processing to the external receiver
//!   worker (see the `gateway-receiver` crate).
//!
//! The HTTP adapter, process bootstrap, and request shaping live outside
//! this crate and consume [`ActionController`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gateway_core::access::AccessConfig;
//! use gateway_core::leasedb::SqliteLeaseDb;
//! use gateway_core::{ActionController, GatewayConfig, Receiver};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::default();
//! let access = AccessConfig::from_file(&config.access_config_path)?;
//! let leases = Arc::new(SqliteLeaseDb::open(&config.lease_db_path)?);
//! let receiver = Receiver::spawn_worker(&config.receiver_path)?;
//!
//! let controller = ActionController::new(config, access, leases, receiver);
//! # let _ = controller;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod access;
pub mod actions;
pub mod config;
pub mod leasedb;
pub mod locks;
pub mod path;
pub mod token;

/// Re-export commonly used types at the crate root.
pub use actions::{ActionController, ActionError, GcOptions};
pub use config::GatewayConfig;
pub use gateway_receiver::{MockReceiver, Receiver, ReceiverError, RepositoryTag};
