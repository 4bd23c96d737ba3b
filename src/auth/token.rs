//! Signed, time-bounded device tokens (JWT)
//!
//! Cloud IoT brokers that authenticate devices by key pair expect the MQTT
//! password to be a JWT signed with the device private key. The token
//! carries issuer, issued-at and expires-at claims and optionally an
//! audience.

use super::{Clock, Credential, CredentialError, CredentialProvider, Validity};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{errors::ErrorKind, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Default capacity for a serialized token
pub const DEFAULT_MAX_TOKEN_LEN: usize = 1024;

/// Signing algorithms accepted for device tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenAlgorithm {
    Rs256,
    Es256,
    Hs256,
}

impl TokenAlgorithm {
    fn jwt_algorithm(self) -> Algorithm {
        match self {
            TokenAlgorithm::Rs256 => Algorithm::RS256,
            TokenAlgorithm::Es256 => Algorithm::ES256,
            TokenAlgorithm::Hs256 => Algorithm::HS256,
        }
    }
}

/// Claims carried by a device token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aud: Option<String>,
}

/// Token issuance parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSettings {
    pub issuer: String,
    pub audience: Option<String>,
    pub lifetime: Duration,
    /// Largest serialized token the connect path can carry
    pub max_token_len: usize,
}

impl TokenSettings {
    pub fn new<S: Into<String>>(issuer: S, lifetime: Duration) -> Self {
        Self {
            issuer: issuer.into(),
            audience: None,
            lifetime,
            max_token_len: DEFAULT_MAX_TOKEN_LEN,
        }
    }

    pub fn with_audience<S: Into<String>>(mut self, audience: S) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_max_token_len(mut self, max_token_len: usize) -> Self {
        self.max_token_len = max_token_len;
        self
    }
}

/// Issues JWT credentials signed with the device key
pub struct SignedTokenProvider {
    client_id: String,
    username: String,
    algorithm: TokenAlgorithm,
    key: EncodingKey,
    settings: TokenSettings,
}

impl std::fmt::Debug for SignedTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedTokenProvider")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("algorithm", &self.algorithm)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SignedTokenProvider {
    /// Build a provider from PEM key material (or the raw secret for HS256).
    ///
    /// The key is exercised once with a probe signature so a malformed key is
    /// reported here rather than on the first connect.
    pub fn from_pem<C, U>(
        client_id: C,
        username: U,
        algorithm: TokenAlgorithm,
        key_material: &[u8],
        settings: TokenSettings,
    ) -> Result<Self, CredentialError>
    where
        C: Into<String>,
        U: Into<String>,
    {
        if settings.lifetime <= Duration::zero() {
            return Err(CredentialError::InvalidLifetime(settings.lifetime.num_seconds()));
        }

        let key = match algorithm {
            TokenAlgorithm::Rs256 => EncodingKey::from_rsa_pem(key_material),
            TokenAlgorithm::Es256 => EncodingKey::from_ec_pem(key_material),
            TokenAlgorithm::Hs256 => {
                if key_material.is_empty() {
                    return Err(CredentialError::KeyMalformed(
                        "HS256 secret is empty".to_string(),
                    ));
                }
                Ok(EncodingKey::from_secret(key_material))
            }
        }
        .map_err(|e| CredentialError::KeyMalformed(e.to_string()))?;

        let provider = Self {
            client_id: client_id.into(),
            username: username.into(),
            algorithm,
            key,
            settings,
        };
        provider.probe()?;
        Ok(provider)
    }

    /// Load key material from a file
    pub fn from_key_file<C, U>(
        client_id: C,
        username: U,
        algorithm: TokenAlgorithm,
        path: &Path,
        settings: TokenSettings,
    ) -> Result<Self, CredentialError>
    where
        C: Into<String>,
        U: Into<String>,
    {
        let material = std::fs::read(path).map_err(|source| CredentialError::KeyFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_pem(client_id, username, algorithm, &material, settings)
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    pub fn algorithm(&self) -> TokenAlgorithm {
        self.algorithm
    }

    /// Sign a token for an explicit, already trusted instant
    pub fn issue_at(&self, now: DateTime<Utc>) -> Result<Credential, CredentialError> {
        let expires_at = now
            .checked_add_signed(self.settings.lifetime)
            .ok_or(CredentialError::InvalidLifetime(
                self.settings.lifetime.num_seconds(),
            ))?;
        if expires_at <= now {
            return Err(CredentialError::Expired {
                expired_at: expires_at,
            });
        }

        let claims = TokenClaims {
            iss: self.settings.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            aud: self.settings.audience.clone(),
        };
        let token = self.sign(&claims)?;

        if token.len() > self.settings.max_token_len {
            return Err(CredentialError::BufferTooSmall {
                needed: token.len(),
                capacity: self.settings.max_token_len,
            });
        }

        debug!(
            issuer = %claims.iss,
            iat = claims.iat,
            exp = claims.exp,
            len = token.len(),
            "Issued device token"
        );

        Ok(
            Credential::new(&self.client_id, &self.username, token).with_validity(Validity {
                issued_at: now,
                expires_at,
            }),
        )
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String, CredentialError> {
        let header = Header::new(self.algorithm.jwt_algorithm());
        jsonwebtoken::encode(&header, claims, &self.key).map_err(|e| match e.kind() {
            ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::RsaFailedSigning => CredentialError::KeyMalformed(e.to_string()),
            _ => CredentialError::Signing(e.to_string()),
        })
    }

    fn probe(&self) -> Result<(), CredentialError> {
        let claims = TokenClaims {
            iss: self.settings.issuer.clone(),
            iat: 0,
            exp: 1,
            aud: None,
        };
        self.sign(&claims).map(|_| ())
    }
}

impl CredentialProvider for SignedTokenProvider {
    fn issue(&self, clock: &dyn Clock) -> Result<Credential, CredentialError> {
        let now = clock.now().ok_or(CredentialError::UntrustedTime)?;
        self.issue_at(now)
    }

    fn kind(&self) -> &'static str {
        "signed-token"
    }
}
