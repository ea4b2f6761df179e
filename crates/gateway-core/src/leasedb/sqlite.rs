// SQLite returns i64 for timestamps; values we wrote are always in range.
// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(clippy::missing_panics_doc)]

//! `SQLite`-backed lease registry.
//!
//! Uses WAL mode so readers are not blocked by the writer. The connection
//! mutex is the store-internal write lock required by the conflict scan;
//! the scan itself runs inside one IMMEDIATE transaction, which makes
//! conflict detection linearizable.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};

use crate::path;
use crate::token::LeaseToken;

use super::{Lease, LeaseDb, LeaseDbError};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The lease registry backed by `SQLite`.
pub struct SqliteLeaseDb {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLeaseDb {
    /// Opens or creates a lease database at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LeaseDbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory lease database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, LeaseDbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl LeaseDb for SqliteLeaseDb {
    fn new_lease(
        &self,
        key_id: &str,
        lease_path: &str,
        protocol_version: i32,
        token: &LeaseToken,
    ) -> Result<(), LeaseDbError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().timestamp_micros();

        // One scan: expired incumbents are collected for deletion and do
        // not conflict; a live conflicting incumbent aborts the insert.
        let mut stale: Vec<String> = Vec::new();
        {
            let mut stmt =
                tx.prepare("SELECT token_str, lease_path, expiration_micros FROM leases")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            for row in rows {
                let (incumbent_token, incumbent_path, expiration_micros) = row?;
                if expiration_micros <= now {
                    stale.push(incumbent_token);
                } else if path::conflicting(&incumbent_path, lease_path) {
                    return Err(LeaseDbError::PathBusy {
                        conflicting_path: incumbent_path,
                        expiration: instant_from_micros(expiration_micros)?,
                    });
                }
            }
        }

        for token_str in stale {
            tx.execute("DELETE FROM leases WHERE token_str = ?1", params![token_str])?;
        }

        tx.execute(
            "INSERT INTO leases
                 (token_str, lease_path, key_id, protocol_version, secret, expiration_micros)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                token.token_str,
                lease_path,
                key_id,
                protocol_version,
                token.secret,
                token.expiration.timestamp_micros(),
            ],
        )?;
        tx.commit()?;

        Ok(())
    }

    fn get_lease(&self, token_str: &str) -> Result<(String, Lease), LeaseDbError> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                "SELECT lease_path, key_id, protocol_version, secret, expiration_micros
                 FROM leases WHERE token_str = ?1",
                params![token_str],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i32>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((lease_path, key_id, protocol_version, secret, expiration_micros)) = row else {
            return Err(LeaseDbError::InvalidLease);
        };

        let expiration = instant_from_micros(expiration_micros)?;
        if expiration <= Utc::now() {
            return Err(LeaseDbError::Expired { expiration });
        }

        Ok((
            lease_path,
            Lease {
                key_id,
                protocol_version,
                token: LeaseToken {
                    token_str: token_str.to_string(),
                    secret,
                    expiration,
                },
            },
        ))
    }

    fn get_leases(&self) -> Result<BTreeMap<String, Lease>, LeaseDbError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().timestamp_micros();

        let mut live = BTreeMap::new();
        let mut stale: Vec<String> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT token_str, lease_path, key_id, protocol_version, secret,
                        expiration_micros
                 FROM leases",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;

            for row in rows {
                let (token_str, lease_path, key_id, protocol_version, secret, expiration_micros) =
                    row?;
                if expiration_micros <= now {
                    stale.push(token_str);
                    continue;
                }
                live.insert(
                    lease_path,
                    Lease {
                        key_id,
                        protocol_version,
                        token: LeaseToken {
                            token_str,
                            secret,
                            expiration: instant_from_micros(expiration_micros)?,
                        },
                    },
                );
            }
        }

        for token_str in stale {
            tx.execute("DELETE FROM leases WHERE token_str = ?1", params![token_str])?;
        }
        tx.commit()?;

        Ok(live)
    }

    fn cancel_lease(&self, token_str: &str) -> Result<(), LeaseDbError> {
        let conn = self.conn.lock().unwrap();

        let deleted = conn.execute(
            "DELETE FROM leases WHERE token_str = ?1",
            params![token_str],
        )?;
        if deleted == 0 {
            return Err(LeaseDbError::InvalidLease);
        }

        Ok(())
    }

    fn cancel_leases(&self) -> Result<(), LeaseDbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM leases", [])?;
        Ok(())
    }

    fn close(&self) -> Result<(), LeaseDbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

fn instant_from_micros(expiration_micros: i64) -> Result<DateTime<Utc>, LeaseDbError> {
    DateTime::<Utc>::from_timestamp_micros(expiration_micros).ok_or_else(|| {
        LeaseDbError::Corrupt {
            detail: format!("expiration out of range: {expiration_micros}"),
        }
    })
}
