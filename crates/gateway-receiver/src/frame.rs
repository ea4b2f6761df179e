//! Wire framing for the worker protocol.
//!
//! All integers on the wire are 32-bit signed, little-endian:
//!
//! ```text
//! Request : i32 op_id | i32 msg_len | msg_bytes[msg_len] | optional payload
//! Reply   : i32 reply_len | reply_bytes[reply_len]
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ReceiverError;

/// Upper bound on a single reply frame (16 MB).
const MAX_REPLY_SIZE: i32 = 16 * 1024 * 1024;

/// Operation identifiers shared with the worker's request enum.
///
/// The numbering is a fixed contract; several identifiers are reserved by
/// the worker and never sent by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    /// Shut the worker down.
    Quit = 0,
    /// Liveness probe; the worker answers with its PID.
    Echo = 1,
    /// Reserved by the worker; not sent by the gateway.
    GenerateToken = 2,
    /// Reserved by the worker; not sent by the gateway.
    GetTokenId = 3,
    /// Reserved by the worker; not sent by the gateway.
    CheckToken = 4,
    /// Submit a payload stream for verification.
    SubmitPayload = 5,
    /// Commit the changes published under a lease.
    Commit = 6,
    /// Reserved by the worker; not sent by the gateway.
    Error = 7,
}

/// Writes one request frame (without any trailing payload stream).
pub(crate) async fn write_request<W>(
    writer: &mut W,
    op: OpCode,
    msg: &[u8],
) -> Result<(), ReceiverError>
where
    W: AsyncWrite + Unpin,
{
    let msg_len = i32::try_from(msg.len()).map_err(|_| ReceiverError::Protocol {
        detail: format!("request body too large: {} bytes", msg.len()),
    })?;

    writer.write_all(&(op as i32).to_le_bytes()).await?;
    writer.write_all(&msg_len.to_le_bytes()).await?;
    writer.write_all(msg).await?;

    Ok(())
}

/// Reads one reply frame.
pub(crate) async fn read_reply<R>(reader: &mut R) -> Result<Vec<u8>, ReceiverError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| short_read("reply size", e))?;

    let reply_len = i32::from_le_bytes(len_buf);
    if !(0..=MAX_REPLY_SIZE).contains(&reply_len) {
        return Err(ReceiverError::Protocol {
            detail: format!("invalid reply length: {reply_len}"),
        });
    }

    #[allow(clippy::cast_sign_loss)] // checked non-negative above
    let mut reply = vec![0u8; reply_len as usize];
    reader
        .read_exact(&mut reply)
        .await
        .map_err(|e| short_read("reply body", e))?;

    Ok(reply)
}

fn short_read(what: &str, err: std::io::Error) -> ReceiverError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ReceiverError::Protocol {
            detail: format!("short read while reading {what}"),
        }
    } else {
        ReceiverError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_request_frame_layout() {
        let mut buf = Vec::new();
        write_request(&mut buf, OpCode::SubmitPayload, b"abc")
            .await
            .unwrap();

        assert_eq!(&buf[0..4], &5i32.to_le_bytes());
        assert_eq!(&buf[4..8], &3i32.to_le_bytes());
        assert_eq!(&buf[8..], b"abc");
    }

    #[tokio::test]
    async fn test_reply_round_trip() {
        let (mut near, mut far) = tokio::io::duplex(1024);

        far.write_all(&11i32.to_le_bytes()).await.unwrap();
        far.write_all(b"{\"a\":\"ok\"}x").await.unwrap();

        let reply = read_reply(&mut near).await.unwrap();
        assert_eq!(reply, b"{\"a\":\"ok\"}x");
    }

    #[tokio::test]
    async fn test_reply_short_read_is_protocol_error() {
        let (mut near, mut far) = tokio::io::duplex(1024);

        far.write_all(&100i32.to_le_bytes()).await.unwrap();
        far.write_all(b"only a few bytes").await.unwrap();
        drop(far);

        let err = read_reply(&mut near).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Protocol { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_reply_negative_length_rejected() {
        let (mut near, mut far) = tokio::io::duplex(1024);

        far.write_all(&(-4i32).to_le_bytes()).await.unwrap();

        let err = read_reply(&mut near).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Protocol { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_reply_oversized_length_rejected() {
        let (mut near, mut far) = tokio::io::duplex(1024);

        far.write_all(&(MAX_REPLY_SIZE + 1).to_le_bytes())
            .await
            .unwrap();

        let err = read_reply(&mut near).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Protocol { .. }), "{err:?}");
    }
}
