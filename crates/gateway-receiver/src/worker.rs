//! Link to a spawned `cvmfs_receiver` worker subprocess.
//!
//! The worker is launched with two extra inherited descriptors, selected on
//! its command line: it reads requests from FD 3 (`-i 3`) and writes replies
//! to FD 4 (`-o 4`). Stdio stays untouched so the worker's own logging is
//! not entangled with the protocol stream.

use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::Stdio;

use nix::fcntl::OFlag;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::frame::{read_reply, write_request, OpCode};
use crate::{ReceiverError, RepositoryTag};

/// Descriptor on which the worker reads requests.
const WORKER_REQUEST_FD: i32 = 3;

/// Descriptor on which the worker writes replies.
const WORKER_REPLY_FD: i32 = 4;

/// A running worker subprocess and the pipe pair connecting to it.
///
/// Methods take `&mut self`: the link carries at most one in-flight
/// request, and every request is answered by exactly one reply.
#[derive(Debug)]
pub struct WorkerReceiver {
    child: Child,
    requests: pipe::Sender,
    replies: pipe::Receiver,
}

impl WorkerReceiver {
    /// Spawns the worker at `exec_path` and wires up the protocol pipes.
    ///
    /// Must be called from within a Tokio runtime: the gateway-side pipe
    /// ends are registered with the reactor here.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Spawn`] if the executable does not exist or
    /// the process cannot be started.
    pub fn spawn(exec_path: impl AsRef<Path>) -> Result<Self, ReceiverError> {
        let exec_path = exec_path.as_ref();
        if !exec_path.exists() {
            return Err(ReceiverError::Spawn(io::Error::new(
                io::ErrorKind::NotFound,
                format!("worker executable not found: {}", exec_path.display()),
            )));
        }

        // Both pipes are close-on-exec; the only descriptors the worker
        // inherits are the two fixed ones installed in pre_exec below.
        let (worker_reads, gateway_writes) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(spawn_errno)?;
        let (gateway_reads, worker_writes) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(spawn_errno)?;

        let mut cmd = Command::new(exec_path);
        cmd.arg("-i")
            .arg(WORKER_REQUEST_FD.to_string())
            .arg("-o")
            .arg(WORKER_REPLY_FD.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(false);

        let raw_request_fd = worker_reads.as_raw_fd();
        let raw_reply_fd = worker_writes.as_raw_fd();

        // SAFETY: the closure runs in the forked child before exec and only
        // calls async-signal-safe functions (fcntl, dup2). The raw
        // descriptors stay valid: the owning ends live in the parent until
        // after spawn() returns. The fds are first lifted above the target
        // range so dup2 cannot clobber an end that has not been moved yet.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(move || {
                let request_fd = libc::fcntl(raw_request_fd, libc::F_DUPFD_CLOEXEC, 10);
                if request_fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                let reply_fd = libc::fcntl(raw_reply_fd, libc::F_DUPFD_CLOEXEC, 10);
                if reply_fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::dup2(request_fd, WORKER_REQUEST_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::dup2(reply_fd, WORKER_REPLY_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(ReceiverError::Spawn)?;

        // The worker's ends are duplicated into the child; drop ours.
        drop(worker_reads);
        drop(worker_writes);

        let requests = pipe::Sender::from_owned_fd(gateway_writes).map_err(ReceiverError::Spawn)?;
        let replies = pipe::Receiver::from_owned_fd(gateway_reads).map_err(ReceiverError::Spawn)?;

        debug!(command = "start", "worker process ready");

        Ok(Self {
            child,
            requests,
            replies,
        })
    }

    /// Sends an echo request and checks the `"PID: "` reply prefix.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on an unexpected reply.
    pub async fn echo(&mut self) -> Result<(), ReceiverError> {
        let reply = self.call(OpCode::Echo, b"Ping").await?;
        let text = String::from_utf8_lossy(&reply);

        if !text.starts_with("PID: ") {
            return Err(ReceiverError::Protocol {
                detail: format!("invalid echo reply: {text}"),
            });
        }

        debug!(command = "echo", reply = %text, "worker echo");
        Ok(())
    }

    /// Submits a payload stream for verification.
    ///
    /// The JSON request body carries the lease path, the payload digest, and
    /// the header size; the raw payload bytes follow the frame on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Rejected`] when the worker refuses the
    /// payload.
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
        let body = serde_json::json!({
            "path": lease_path,
            "digest": digest,
            "header_size": header_size,
        });
        let msg = serde_json::to_vec(&body).map_err(json_encode_error)?;

        write_request(&mut self.requests, OpCode::SubmitPayload, &msg).await?;
        tokio::io::copy(payload, &mut self.requests).await?;
        self.requests.flush().await?;

        let reply = read_reply(&mut self.replies).await?;
        let result = reply_to_result(&reply);

        debug!(command = "submit payload", result = ?result, "worker reply");
        result
    }

    /// Asks the worker to commit the changes published under a lease.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Rejected`] when the worker refuses the
    /// commit.
    pub async fn commit(
        &mut self,
        lease_path: &str,
        old_root_hash: &str,
        new_root_hash: &str,
        tag: &RepositoryTag,
    ) -> Result<(), ReceiverError> {
        let body = serde_json::json!({
            "lease_path": lease_path,
            "old_root_hash": old_root_hash,
            "new_root_hash": new_root_hash,
            "tag_name": tag.name,
            "tag_channel": tag.channel,
            "tag_description": tag.description,
        });
        let msg = serde_json::to_vec(&body).map_err(json_encode_error)?;

        let reply = self.call(OpCode::Commit, &msg).await?;
        let result = reply_to_result(&reply);

        debug!(command = "commit", result = ?result, "worker reply");
        result
    }

    /// Sends `Quit`, closes the pipes, and waits for the worker to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the quit exchange fails or the child cannot be
    /// reaped.
    pub async fn quit(mut self) -> Result<(), ReceiverError> {
        self.call(OpCode::Quit, &[]).await?;

        drop(self.requests);
        drop(self.replies);

        self.child.wait().await?;

        debug!(command = "quit", "worker process has stopped");
        Ok(())
    }

    /// One request/reply exchange without a payload stream.
    async fn call(&mut self, op: OpCode, msg: &[u8]) -> Result<Vec<u8>, ReceiverError> {
        write_request(&mut self.requests, op, msg).await?;
        self.requests.flush().await?;
        read_reply(&mut self.replies).await
    }
}

/// The JSON reply body shared by `SubmitPayload` and `Commit`.
#[derive(Debug, Deserialize)]
struct WorkerReply {
    status: Option<String>,
    reason: Option<String>,
}

/// Maps a worker reply to the outcome of the request.
fn reply_to_result(reply: &[u8]) -> Result<(), ReceiverError> {
    let parsed: WorkerReply =
        serde_json::from_slice(reply).map_err(|e| ReceiverError::Protocol {
            detail: format!("could not decode worker reply: {e}"),
        })?;

    match parsed.status.as_deref() {
        Some("ok") => Ok(()),
        Some(_) => match parsed.reason {
            Some(reason) => Err(ReceiverError::Rejected { reason }),
            None => Err(ReceiverError::Protocol {
                detail: "worker reply carries no failure reason".to_string(),
            }),
        },
        None => Err(ReceiverError::Protocol {
            detail: "worker reply carries no status".to_string(),
        }),
    }
}

fn spawn_errno(errno: nix::errno::Errno) -> ReceiverError {
    ReceiverError::Spawn(io::Error::from(errno))
}

fn json_encode_error(err: serde_json::Error) -> ReceiverError {
    ReceiverError::Protocol {
        detail: format!("request encoding failed: {err}"),
    }
}
