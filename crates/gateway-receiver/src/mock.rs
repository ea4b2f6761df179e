//! In-process receiver used by tests.

use tokio::io::AsyncRead;

use crate::ReceiverError;

/// A receiver that answers every request in-process.
///
/// By default all requests succeed; a rejection reason can be injected to
/// exercise the failure paths of callers. Payload streams are drained the
/// way the real worker consumes them.
#[derive(Debug, Default)]
pub struct MockReceiver {
    reject_reason: Option<String>,
}

impl MockReceiver {
    /// Returns a mock that accepts every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a mock that rejects submissions and commits with `reason`.
    #[must_use]
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject_reason: Some(reason.into()),
        }
    }

    /// Answers the liveness probe.
    ///
    /// The mock has no worker process, so the probe always succeeds.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn echo(&mut self) -> Result<(), ReceiverError> {
        Ok(())
    }

    /// Drains the payload stream and reports the configured outcome.
    ///
    /// # Errors
    ///
    /// Returns the injected rejection, if any.
    pub async fn submit_payload<P>(&mut self, payload: &mut P) -> Result<(), ReceiverError>
    where
        P: AsyncRead + Unpin + Send,
    {
        tokio::io::copy(payload, &mut tokio::io::sink()).await?;
        self.outcome()
    }

    /// Reports the configured commit outcome.
    ///
    /// # Errors
    ///
    /// Returns the injected rejection, if any.
    pub fn commit(&mut self) -> Result<(), ReceiverError> {
        self.outcome()
    }

    /// Shuts the mock down.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn quit(self) -> Result<(), ReceiverError> {
        Ok(())
    }

    fn outcome(&self) -> Result<(), ReceiverError> {
        match &self.reject_reason {
            Some(reason) => Err(ReceiverError::Rejected {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}
