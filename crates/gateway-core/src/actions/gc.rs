//! Garbage collection actions.
//!
//! Collection runs detached: `start_gc` validates the request, launches a
//! background task, and returns. The task holds the repository's named
//! lock (no commit can overlap) and the token-named lock (so
//! [`ActionController::is_doing_gc`] can probe progress) while the external
//! collection tool runs. The fixed 24 h deadline is the only stop
//! condition; no task handle is retained.

use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::token::PresentedToken;

use super::{log_action, ActionController, ActionError};

/// The repository maintenance tool the collection is delegated to.
const GC_TOOL: &str = "cvmfs_server";

/// Upper bound on one collection run, acquisition included.
const GC_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Options for a garbage collection run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcOptions {
    /// The repository to collect.
    #[serde(rename = "repo")]
    pub repository: String,

    /// Number of revisions to preserve (0 = tool default).
    #[serde(default)]
    pub num_revisions: i32,

    /// Delete objects older than this instant, if set.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Report what would be deleted without deleting.
    #[serde(default)]
    pub dry_run: bool,

    /// Verbose tool output.
    #[serde(default)]
    pub verbose: bool,
}

impl ActionController {
    /// Starts garbage collection on a repository.
    ///
    /// The presented lease must cover the repository root (`"<repo>/"`).
    /// Returns as soon as the background task is launched; the lease is
    /// dropped at that point and the collection continues unattended.
    ///
    /// # Errors
    ///
    /// Returns a token/lease error, or
    /// [`ActionError::GcRequiresRootLease`] when the lease does not cover
    /// the repository root.
    pub async fn start_gc(&self, bearer: &str, options: GcOptions) -> Result<(), ActionError> {
        let started = Instant::now();
        let result = self.start_gc_inner(bearer, options);
        log_action("garbage_collection", started, &result);
        result
    }

    fn start_gc_inner(&self, bearer: &str, options: GcOptions) -> Result<(), ActionError> {
        let (presented, lease_path, _) = self.resolve_token(bearer)?;

        if lease_path != format!("{}/", options.repository) {
            return Err(ActionError::GcRequiresRootLease { lease_path });
        }

        let locks = self.locks.clone();
        let token_str = presented.token_str.clone();
        let repository = options.repository.clone();
        let args = gc_command_args(&options);

        tokio::spawn(async move {
            let bounded = tokio::time::timeout(
                GC_TIMEOUT,
                locks.with_lock(&repository, async {
                    // The token-named lock is held for the whole run so the
                    // is-doing-gc probe observes it.
                    locks
                        .with_lock(&token_str, run_gc_tool(&repository, args))
                        .await;
                }),
            )
            .await;

            if bounded.is_err() {
                warn!(repository = %repository, "garbage collection exceeded its deadline");
            }
        });

        // The collection is underway; the lease is no longer needed.
        // Cancellation failures here are logged, not returned.
        if let Err(err) = self.leases.cancel_lease(&presented.token_str) {
            info!(error = %err, "could not cancel lease after starting garbage collection");
        }

        Ok(())
    }

    /// Reports whether the collection started under this token is still
    /// running.
    #[must_use]
    pub fn is_doing_gc(&self, bearer: &str) -> bool {
        let presented = PresentedToken::parse(bearer);
        self.locks.is_locked(&presented.token_str)
    }
}

/// Runs the external collection tool, capturing its combined output.
async fn run_gc_tool(repository: &str, args: Vec<String>) {
    info!(repository, "executing garbage collection");

    let output = Command::new(GC_TOOL)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(false)
        .output()
        .await;

    match output {
        Ok(output) => {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            let combined = String::from_utf8_lossy(&combined);

            if output.status.success() {
                info!(repository, output = %combined, "garbage collection finished");
            } else {
                error!(
                    repository,
                    status = %output.status,
                    output = %combined,
                    "garbage collection failed"
                );
            }
        },
        Err(err) => {
            error!(repository, error = %err, "could not run garbage collection tool");
        },
    }
}

/// Command-line arguments for one collection run.
fn gc_command_args(options: &GcOptions) -> Vec<String> {
    let mut args = vec!["gc".to_string(), "-f".to_string(), "-@".to_string()];

    if options.num_revisions != 0 {
        args.push("-r".to_string());
        args.push(options.num_revisions.to_string());
    }
    if let Some(timestamp) = options.timestamp {
        args.push("-t".to_string());
        args.push(format!("@{}", timestamp.timestamp()));
    }
    if options.dry_run {
        args.push("-d".to_string());
    }
    if options.verbose {
        args.push("-l".to_string());
    }

    args.push(options.repository.clone());
    args
}
