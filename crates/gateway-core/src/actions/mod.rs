//! Action orchestration.
//!
//! [`ActionController`] composes the access configuration, the lease store,
//! the named locks, and the receiver link into the operations the HTTP
//! adapter exposes. All collaborators are injected; nothing here is a
//! process-wide singleton. Every operation is an `async fn` whose future
//! can be dropped to cancel it at the next suspension point.

mod gc;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, error, info};

use gateway_receiver::{Receiver, ReceiverError, RepositoryTag};

use crate::access::{AccessConfig, AuthError};
use crate::config::GatewayConfig;
use crate::leasedb::{Lease, LeaseDb, LeaseDbError};
use crate::locks::NamedLocks;
use crate::path;
use crate::token::{LeaseToken, PresentedToken, TokenError};

pub use gc::GcOptions;

/// Errors surfaced by controller operations, by kind.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ActionError {
    /// Authorization failure (unknown repo, unregistered key, or a lease
    /// path outside the key's allowed subpath).
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Lease store failure (busy path, unknown lease, expired token, or a
    /// storage error).
    #[error(transparent)]
    Lease(#[from] LeaseDbError),

    /// Token verification failure.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Receiver link failure.
    #[error(transparent)]
    Receiver(#[from] ReceiverError),

    /// Garbage collection was requested under a non-root lease.
    #[error("garbage collection requires a lease on the repository root, held lease is on {lease_path}")]
    GcRequiresRootLease {
        /// The path of the presented lease.
        lease_path: String,
    },
}

impl ActionError {
    /// Whether this error is an internal failure (logged at error level)
    /// rather than a user-visible authorization or conflict outcome.
    fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Lease(LeaseDbError::Database(_) | LeaseDbError::Corrupt { .. })
                | Self::Receiver(
                    ReceiverError::Protocol { .. }
                        | ReceiverError::Io(_)
                        | ReceiverError::Spawn(_)
                )
        )
    }
}

/// Structured log record for a completed action.
fn log_action<T>(action: &'static str, started: Instant, result: &Result<T, ActionError>) {
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    match result {
        Ok(_) => info!(action, duration_ms, outcome = "success", "action processed"),
        Err(err) if err.is_internal() => {
            error!(action, duration_ms, outcome = %err, "action failed");
        },
        Err(err) => info!(action, duration_ms, outcome = %err, "action processed"),
    }
}

/// The gateway's business-logic layer.
pub struct ActionController {
    config: GatewayConfig,
    access: AccessConfig,
    leases: Arc<dyn LeaseDb>,
    locks: NamedLocks,
    receiver: Arc<tokio::sync::Mutex<Receiver>>,
}

impl ActionController {
    /// Creates a controller over the injected collaborators.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        access: AccessConfig,
        leases: Arc<dyn LeaseDb>,
        receiver: Receiver,
    ) -> Self {
        Self {
            config,
            access,
            leases,
            locks: NamedLocks::new(),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    /// The access configuration, for read-only repository queries.
    #[must_use]
    pub fn access(&self) -> &AccessConfig {
        &self.access
    }

    /// Requests a new lease on `lease_path` for `key_id`.
    ///
    /// Returns the bearer token the client must present on subsequent
    /// requests.
    ///
    /// # Errors
    ///
    /// Returns an authorization error when the key may not write the path,
    /// or [`LeaseDbError::PathBusy`] when a live lease conflicts.
    pub async fn new_lease(
        &self,
        key_id: &str,
        lease_path: &str,
        protocol_version: i32,
    ) -> Result<String, ActionError> {
        let started = Instant::now();
        let result = self.new_lease_inner(key_id, lease_path, protocol_version);
        log_action("new_lease", started, &result);
        result
    }

    fn new_lease_inner(
        &self,
        key_id: &str,
        lease_path: &str,
        protocol_version: i32,
    ) -> Result<String, ActionError> {
        let (repo, subpath) = split_checked(lease_path)?;
        self.access.check(key_id, subpath, repo)?;

        let mut retried = false;
        loop {
            let token = LeaseToken::new(self.config.max_lease_time)?;
            match self
                .leases
                .new_lease(key_id, lease_path, protocol_version, &token)
            {
                Ok(()) => return Ok(token.bearer(lease_path)),
                Err(LeaseDbError::PathBusy {
                    conflicting_path,
                    expiration,
                }) => {
                    // The conflicting lease may have expired between its
                    // insertion and this scan; one retry lets the store's
                    // lazy sweep clear it. A live conflict propagates.
                    if !retried && expiration <= Utc::now() {
                        retried = true;
                        debug!(
                            conflicting_path = %conflicting_path,
                            "conflicting lease expired, retrying once"
                        );
                        continue;
                    }
                    return Err(LeaseDbError::PathBusy {
                        conflicting_path,
                        expiration,
                    }
                    .into());
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Looks up the lease held under a bearer token and re-verifies the
    /// presented MAC against the stored secret.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseDbError::InvalidLease`] for an unknown token,
    /// [`LeaseDbError::Expired`] past expiration, or
    /// [`TokenError::MacMismatch`] on a bad MAC.
    pub async fn get_lease(&self, bearer: &str) -> Result<(String, Lease), ActionError> {
        let started = Instant::now();
        let result = self
            .resolve_token(bearer)
            .map(|(_, lease_path, lease)| (lease_path, lease));
        log_action("get_lease", started, &result);
        result
    }

    /// Returns all live leases, keyed by lease path.
    ///
    /// # Errors
    ///
    /// Returns a store error on failure.
    pub async fn get_leases(&self) -> Result<BTreeMap<String, Lease>, ActionError> {
        let started = Instant::now();
        let result = self.leases.get_leases().map_err(ActionError::from);
        log_action("get_leases", started, &result);
        result
    }

    /// Cancels the lease held under a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseDbError::InvalidLease`] when no such lease exists.
    pub async fn cancel_lease(&self, bearer: &str) -> Result<(), ActionError> {
        let started = Instant::now();
        let presented = PresentedToken::parse(bearer);
        let result = self
            .leases
            .cancel_lease(&presented.token_str)
            .map_err(ActionError::from);
        log_action("cancel_lease", started, &result);
        result
    }

    /// Streams a payload to the receiver under an existing lease.
    ///
    /// The lease stays in place whatever the outcome; clients may submit
    /// any number of payloads under one lease.
    ///
    /// # Errors
    ///
    /// Returns a token/lease error before the receiver is contacted, or a
    /// receiver error from the submission itself.
    pub async fn submit_payload<P>(
        &self,
        bearer: &str,
        payload: &mut P,
        digest: &str,
        header_size: usize,
    ) -> Result<(), ActionError>
    where
        P: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let result = self
            .submit_payload_inner(bearer, payload, digest, header_size)
            .await;
        log_action("submit_payload", started, &result);
        result
    }

    async fn submit_payload_inner<P>(
        &self,
        bearer: &str,
        payload: &mut P,
        digest: &str,
        header_size: usize,
    ) -> Result<(), ActionError>
    where
        P: AsyncRead + Unpin + Send,
    {
        let (_, lease_path, _) = self.resolve_token(bearer)?;

        let mut receiver = self.receiver.lock().await;
        receiver
            .submit_payload(&lease_path, payload, digest, header_size)
            .await?;

        Ok(())
    }

    /// Commits the changes published under a lease.
    ///
    /// The commit runs under the repository's named lock, so it never
    /// overlaps another commit or a garbage collection of the same
    /// repository. On success the lease is dropped; on receiver failure it
    /// stays in place so the client can retry or cancel.
    ///
    /// # Errors
    ///
    /// Returns a token/lease error before the receiver is contacted
    /// (an expired token never reaches the worker), or the receiver's
    /// rejection.
    pub async fn commit_lease(
        &self,
        bearer: &str,
        old_root_hash: &str,
        new_root_hash: &str,
        tag: &RepositoryTag,
    ) -> Result<(), ActionError> {
        let started = Instant::now();
        let result = self
            .commit_lease_inner(bearer, old_root_hash, new_root_hash, tag)
            .await;
        log_action("commit_lease", started, &result);
        result
    }

    async fn commit_lease_inner(
        &self,
        bearer: &str,
        old_root_hash: &str,
        new_root_hash: &str,
        tag: &RepositoryTag,
    ) -> Result<(), ActionError> {
        let (presented, lease_path, _) = self.resolve_token(bearer)?;
        let (repo, _) = split_checked(&lease_path)?;

        self.locks
            .with_lock(repo, async {
                let mut receiver = self.receiver.lock().await;
                receiver
                    .commit(&lease_path, old_root_hash, new_root_hash, tag)
                    .await
            })
            .await?;

        self.leases.cancel_lease(&presented.token_str)?;
        Ok(())
    }

    /// Resolves a bearer token to its lease and verifies the presentation.
    fn resolve_token(
        &self,
        bearer: &str,
    ) -> Result<(PresentedToken, String, Lease), ActionError> {
        let presented = PresentedToken::parse(bearer);
        let (lease_path, lease) = self.leases.get_lease(&presented.token_str)?;
        presented.verify(&lease.token.secret, &lease_path, lease.token.expiration)?;
        Ok((presented, lease_path, lease))
    }
}

/// Splits a lease path, mapping a malformed path to the invalid-path kind.
fn split_checked(lease_path: &str) -> Result<(&str, &str), ActionError> {
    path::split_lease_path(lease_path).ok_or_else(|| {
        ActionError::Auth(AuthError::InvalidPath {
            lease_path: lease_path.to_string(),
        })
    })
}
