//! Framed RPC link to the `cvmfs_receiver` worker process.
//!
//! The gateway delegates payload verification and catalog commits to an
//! out-of-process worker. This crate owns the wire protocol: length-prefixed
//! binary frames exchanged over two dedicated pipes, distinct from the
//! worker's stdio. Requests flow gateway → worker, replies worker → gateway,
//! in strict pairs; a link carries at most one in-flight request, so callers
//! must serialize access.
//!
//! Two link variants exist behind the [`Receiver`] enum:
//!
//! - [`WorkerReceiver`] spawns the real worker subprocess and speaks the
//!   wire protocol over inherited file descriptors 3 and 4.
//! - [`MockReceiver`] answers in-process and is used by tests.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod frame;
mod mock;
mod worker;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

pub use frame::OpCode;
pub use mock::MockReceiver;
pub use worker::WorkerReceiver;

/// Errors raised by receiver link operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReceiverError {
    /// The worker processed the request and rejected it
    /// (`status != "ok"` in the reply).
    #[error("worker rejected request: {reason}")]
    Rejected {
        /// The `reason` field of the worker reply.
        reason: String,
    },

    /// A malformed frame, short read, or undecodable reply.
    #[error("receiver protocol error: {detail}")]
    Protocol {
        /// What was wrong with the exchange.
        detail: String,
    },

    /// I/O failure on the request or reply pipe.
    #[error("receiver I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker executable could not be found or started.
    #[error("could not start worker process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Repository tag attached to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryTag {
    /// Tag name.
    pub name: String,
    /// Publication channel.
    pub channel: String,
    /// Free-form description.
    pub description: String,
}

/// A link to a receiver, either the real worker subprocess or the
/// in-process mock.
#[derive(Debug)]
pub enum Receiver {
    /// Link to a spawned `cvmfs_receiver` subprocess.
    Worker(WorkerReceiver),
    /// In-process mock for tests.
    Mock(MockReceiver),
}

impl Receiver {
    /// Spawns the worker subprocess at `exec_path` and returns a link to it.
    ///
    /// Must be called from within a Tokio runtime: the pipe ends are
    /// registered with the reactor at creation.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Spawn`] if the executable is missing or the
    /// process cannot be started.
    pub fn spawn_worker(exec_path: impl AsRef<std::path::Path>) -> Result<Self, ReceiverError> {
        Ok(Self::Worker(WorkerReceiver::spawn(exec_path)?))
    }

    /// Returns a mock link that accepts every request.
    #[must_use]
    pub fn mock() -> Self {
        Self::Mock(MockReceiver::new())
    }

    /// Sends an echo request and asserts the worker's `"PID: "` reply.
    ///
    /// # Errors
    ///
    /// Returns an error on pipe failure or an unexpected reply.
    pub async fn echo(&mut self) -> Result<(), ReceiverError> {
        match self {
            Self::Worker(w) => w.echo().await,
            Self::Mock(m) => m.echo(),
        }
    }

    /// Streams a payload to the receiver for verification.
    ///
    /// The lease under which the payload is submitted stays in place no
    /// matter the outcome; callers may submit repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Rejected`] when the worker refuses the
    /// payload, or a protocol/I/O error on a broken exchange.
    pub async fn submit_payload<P>(
        &mut self,
        lease_path: &str,
        payload: &mut P,
        digest: &str,
        header_size: usize,
    ) -> Result<(), ReceiverError>
    where
        P: AsyncRead + Unpin + Send,
    {
        match self {
            Self::Worker(w) => {
                w.submit_payload(lease_path, payload, digest, header_size)
                    .await
            },
            Self::Mock(m) => m.submit_payload(payload).await,
        }
    }

    /// Asks the receiver to commit the changes published under a lease.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Rejected`] when the worker refuses the
    /// commit, or a protocol/I/O error on a broken exchange.
    pub async fn commit(
        &mut self,
        lease_path: &str,
        old_root_hash: &str,
        new_root_hash: &str,
        tag: &RepositoryTag,
    ) -> Result<(), ReceiverError> {
        match self {
            Self::Worker(w) => w.commit(lease_path, old_root_hash, new_root_hash, tag).await,
            Self::Mock(m) => m.commit(),
        }
    }

    /// Shuts the link down: sends `Quit`, closes the pipes, and waits for
    /// the worker to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the quit exchange fails or the worker cannot be
    /// reaped.
    pub async fn quit(self) -> Result<(), ReceiverError> {
        match self {
            Self::Worker(w) => w.quit().await,
            Self::Mock(m) => m.quit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_link_full_exchange() {
        let mut receiver = Receiver::mock();

        receiver.echo().await.unwrap();

        let mut payload: &[u8] = b"pack bytes";
        receiver
            .submit_payload("test.repo.org/path", &mut payload, "digest", 24)
            .await
            .unwrap();

        let tag = RepositoryTag {
            name: "tag".to_string(),
            channel: "channel".to_string(),
            description: "description".to_string(),
        };
        receiver
            .commit("test.repo.org/path", "old", "new", &tag)
            .await
            .unwrap();

        receiver.quit().await.unwrap();
    }
}
