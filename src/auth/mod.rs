//! Connect-time credentials
//!
//! A `CredentialProvider` produces the identity and secret presented in the
//! MQTT CONNECT packet. Static providers hand back a fixed password; the
//! signed-token provider mints a JWT bounded by a validity window, which the
//! session controller renews before it lapses.

use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;

pub mod clock;
pub mod credential;
pub mod token;

pub use clock::{Clock, SystemClock};
pub use credential::{Credential, Validity};
pub use token::{SignedTokenProvider, TokenAlgorithm, TokenClaims, TokenSettings};

/// Produces credentials for a connect attempt
pub trait CredentialProvider: Send + Sync {
    /// Issue a credential valid at the clock's current time
    fn issue(&self, clock: &dyn Clock) -> Result<Credential, CredentialError>;

    /// Short label for logs
    fn kind(&self) -> &'static str;
}

/// Credential issuance failures
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Time source is not synchronized")]
    UntrustedTime,

    #[error("Private key is malformed: {0}")]
    KeyMalformed(String),

    #[error("Cannot read key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Token needs {needed} bytes but the buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Credential expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },

    #[error("Token lifetime {0}s is out of range")]
    InvalidLifetime(i64),

    #[error("Token signing failed: {0}")]
    Signing(String),
}

/// Fixed username and password, no expiry
#[derive(Clone)]
pub struct StaticCredentials {
    credential: Credential,
}

impl StaticCredentials {
    pub fn new<C, U, P>(client_id: C, username: U, password: P) -> Self
    where
        C: Into<String>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            credential: Credential::new(client_id, username, password),
        }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("credential", &self.credential)
            .finish()
    }
}

impl CredentialProvider for StaticCredentials {
    /// Static credentials do not consult the clock
    fn issue(&self, _clock: &dyn Clock) -> Result<Credential, CredentialError> {
        Ok(self.credential.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}
