//! Minting and verification of lease tokens.
//!
//! A token is the bearer credential for a lease: an opaque identifier, a
//! per-lease random secret, and an absolute expiration instant. The client
//! receives the identifier together with a MAC binding the lease path and
//! expiration under the secret; it must present both on every subsequent
//! request. The mint is stateless; all durable state lives in the lease
//! store.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

/// Length of the per-lease secret in bytes.
pub const SECRET_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised by token operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The token is past its expiration. Raised before any MAC work.
    #[error("token expired at {expiration}")]
    Expired {
        /// When the token expired.
        expiration: DateTime<Utc>,
    },

    /// The presented MAC does not verify against the stored secret, or no
    /// MAC was presented at all.
    #[error("token MAC verification failed")]
    MacMismatch,

    /// The requested lease duration cannot be represented.
    #[error("lease duration out of range")]
    DurationOutOfRange,
}

/// A minted lease token.
///
/// Tokens are immutable: a lease is created with its token and the pair
/// lives and dies together.
#[derive(Debug, Clone)]
pub struct LeaseToken {
    /// Opaque token identifier (UUID-shaped).
    pub token_str: String,
    /// Per-lease random secret keying the MAC.
    pub secret: Vec<u8>,
    /// Absolute expiration instant (microsecond precision).
    pub expiration: DateTime<Utc>,
}

impl LeaseToken {
    /// Mints a fresh token valid for `max_lease_time` from now.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::DurationOutOfRange`] when the duration cannot
    /// be represented as a calendar offset.
    pub fn new(max_lease_time: std::time::Duration) -> Result<Self, TokenError> {
        let validity = chrono::Duration::from_std(max_lease_time)
            .map_err(|_| TokenError::DurationOutOfRange)?;

        let mut secret = vec![0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);

        Ok(Self {
            token_str: Uuid::new_v4().to_string(),
            secret,
            expiration: Utc::now() + validity,
        })
    }

    /// Computes the MAC binding `lease_path` and the expiration under this
    /// token's secret.
    #[must_use]
    pub fn mac(&self, lease_path: &str) -> Vec<u8> {
        compute_mac(&self.secret, lease_path, self.expiration)
    }

    /// Returns the client-facing bearer form: `<token_str>.<hex mac>`.
    #[must_use]
    pub fn bearer(&self, lease_path: &str) -> String {
        format!("{}.{}", self.token_str, hex::encode(self.mac(lease_path)))
    }
}

/// A bearer token as presented by a client, split back into its parts.
#[derive(Debug, Clone)]
pub struct PresentedToken {
    /// The token identifier used for store lookups.
    pub token_str: String,
    mac: Option<Vec<u8>>,
}

impl PresentedToken {
    /// Parses a presented bearer string.
    ///
    /// Anything before the first `.` is the token identifier; the remainder
    /// is the hex MAC. A missing or undecodable MAC part is kept as absent
    /// and fails verification later, so lookups by identifier still work
    /// and an unknown token surfaces as such rather than as a MAC failure.
    #[must_use]
    pub fn parse(bearer: &str) -> Self {
        match bearer.split_once('.') {
            Some((token_str, mac_hex)) => Self {
                token_str: token_str.to_string(),
                mac: hex::decode(mac_hex).ok(),
            },
            None => Self {
                token_str: bearer.to_string(),
                mac: None,
            },
        }
    }

    /// Verifies this presentation against the stored secret and lease
    /// attributes.
    ///
    /// Expiration is checked first and rejects regardless of MAC validity;
    /// the MAC comparison is constant-time.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Expired`] or [`TokenError::MacMismatch`].
    pub fn verify(
        &self,
        secret: &[u8],
        lease_path: &str,
        expiration: DateTime<Utc>,
    ) -> Result<(), TokenError> {
        if expiration <= Utc::now() {
            return Err(TokenError::Expired { expiration });
        }

        let presented = self.mac.as_deref().ok_or(TokenError::MacMismatch)?;
        let expected = compute_mac(secret, lease_path, expiration);

        if expected.ct_eq(presented).into() {
            Ok(())
        } else {
            Err(TokenError::MacMismatch)
        }
    }
}

/// HMAC-SHA256 over `lease_path || ":" || expiration_micros`.
fn compute_mac(secret: &[u8], lease_path: &str, expiration: DateTime<Utc>) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .expect("HMAC can take a key of any size; this cannot fail");

    mac.update(lease_path.as_bytes());
    mac.update(b":");
    mac.update(expiration.timestamp_micros().to_string().as_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const PATH: &str = "test.repo.org/some/path";

    #[test]
    fn test_mint_and_verify() {
        let token = LeaseToken::new(Duration::from_secs(60)).unwrap();
        let presented = PresentedToken::parse(&token.bearer(PATH));

        assert_eq!(presented.token_str, token.token_str);
        presented
            .verify(&token.secret, PATH, token.expiration)
            .unwrap();
    }

    #[test]
    fn test_expired_rejected_before_mac() {
        let token = LeaseToken::new(Duration::from_micros(1)).unwrap();
        let presented = PresentedToken::parse(&token.bearer(PATH));
        std::thread::sleep(Duration::from_millis(2));

        // The MAC itself is valid; expiry must still win.
        let err = presented
            .verify(&token.secret, PATH, token.expiration)
            .unwrap_err();
        assert!(matches!(err, TokenError::Expired { .. }), "{err:?}");
    }

    #[test]
    fn test_wrong_secret_fails() {
        let token = LeaseToken::new(Duration::from_secs(60)).unwrap();
        let presented = PresentedToken::parse(&token.bearer(PATH));

        let err = presented
            .verify(&vec![0u8; SECRET_LEN], PATH, token.expiration)
            .unwrap_err();
        assert!(matches!(err, TokenError::MacMismatch), "{err:?}");
    }

    #[test]
    fn test_wrong_path_fails() {
        let token = LeaseToken::new(Duration::from_secs(60)).unwrap();
        let presented = PresentedToken::parse(&token.bearer(PATH));

        let err = presented
            .verify(&token.secret, "test.repo.org/other", token.expiration)
            .unwrap_err();
        assert!(matches!(err, TokenError::MacMismatch), "{err:?}");
    }

    #[test]
    fn test_missing_mac_fails() {
        let token = LeaseToken::new(Duration::from_secs(60)).unwrap();
        let presented = PresentedToken::parse(&token.token_str);

        let err = presented
            .verify(&token.secret, PATH, token.expiration)
            .unwrap_err();
        assert!(matches!(err, TokenError::MacMismatch), "{err:?}");
    }

    #[test]
    fn test_verification_depends_only_on_stored_attributes() {
        // Re-deriving the MAC from (secret, path, expiration) alone must
        // succeed: no other mint state may be involved.
        let token = LeaseToken::new(Duration::from_secs(60)).unwrap();
        let bearer = token.bearer(PATH);
        let stored_secret = token.secret.clone();
        let stored_expiration = token.expiration;
        drop(token);

        PresentedToken::parse(&bearer)
            .verify(&stored_secret, PATH, stored_expiration)
            .unwrap();
    }

    #[test]
    fn test_secret_length() {
        let token = LeaseToken::new(Duration::from_secs(60)).unwrap();
        assert_eq!(token.secret.len(), SECRET_LEN);
    }
}
