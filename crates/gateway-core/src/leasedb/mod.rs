//! Durable lease registry.
//!
//! Maps each lease path to its lease record, with a secondary lookup from
//! token identifier to lease path. No two live leases may have conflicting
//! paths; expired leases are reclaimed lazily during the conflict scan, so
//! a path becomes available the moment its incumbent expires, without a
//! background sweeper.

mod sqlite;


use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::token::LeaseToken;

pub use sqlite::SqliteLeaseDb;

/// Errors raised by lease store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeaseDbError {
    /// A live lease conflicts with the requested path.
    #[error("path busy: conflicting lease on {conflicting_path}")]
    PathBusy {
        /// Path of the conflicting live lease.
        conflicting_path: String,
        /// When the conflicting lease expires.
        expiration: DateTime<Utc>,
    },

    /// The token does not correspond to any stored lease.
    #[error("invalid lease")]
    InvalidLease,

    /// The lease exists but its token is past expiration.
    #[error("lease token expired at {expiration}")]
    Expired {
        /// When the token expired.
        expiration: DateTime<Utc>,
    },

    /// Underlying database failure.
    #[error("lease database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored record could not be interpreted.
    #[error("corrupt lease record: {detail}")]
    Corrupt {
        /// What could not be interpreted.
        detail: String,
    },
}

/// A stored lease.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The key that holds the lease.
    pub key_id: String,
    /// Protocol version declared by the client at lease time.
    pub protocol_version: i32,
    /// The bearer token bound to the lease.
    pub token: LeaseToken,
}

/// The durable lease registry.
///
/// Methods are synchronous; each operation is atomic under the store's
/// internal write lock, and conflict detection is linearizable: once a
/// lease is created, any later request for a conflicting path observes it
/// until it expires or is cancelled.
pub trait LeaseDb: Send + Sync {
    /// Registers a new lease if no live lease conflicts with `lease_path`.
    ///
    /// Expired leases encountered during the conflict scan are deleted and
    /// do not conflict.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseDbError::PathBusy`] on a live conflict.
    fn new_lease(
        &self,
        key_id: &str,
        lease_path: &str,
        protocol_version: i32,
        token: &LeaseToken,
    ) -> Result<(), LeaseDbError>;

    /// Looks a lease up by token identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseDbError::InvalidLease`] for an unknown token and
    /// [`LeaseDbError::Expired`] for a known but expired one.
    fn get_lease(&self, token_str: &str) -> Result<(String, Lease), LeaseDbError>;

    /// Returns all live leases, keyed by lease path.
    ///
    /// Expired leases encountered along the way are swept.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    fn get_leases(&self) -> Result<BTreeMap<String, Lease>, LeaseDbError>;

    /// Deletes the lease held under `token_str`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseDbError::InvalidLease`] when no such lease exists,
    /// including one already cancelled.
    fn cancel_lease(&self, token_str: &str) -> Result<(), LeaseDbError>;

    /// Deletes every lease (administrative reset).
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    fn cancel_leases(&self) -> Result<(), LeaseDbError>;

    /// Flushes pending state to durable storage.
    ///
    /// The store itself closes when dropped.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    fn close(&self) -> Result<(), LeaseDbError>;
}
