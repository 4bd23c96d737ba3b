//! Issued connect-time credentials

use super::CredentialError;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Validity window of a time-bounded credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Identity and secret presented in the MQTT CONNECT packet
///
/// Immutable once issued. Static credentials carry no validity window.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    client_id: String,
    username: String,
    secret: String,
    validity: Option<Validity>,
}

impl Credential {
    pub fn new<C, U, S>(client_id: C, username: U, secret: S) -> Self
    where
        C: Into<String>,
        U: Into<String>,
        S: Into<String>,
    {
        Self {
            client_id: client_id.into(),
            username: username.into(),
            secret: secret.into(),
            validity: None,
        }
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = Some(validity);
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password or signed token
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn validity(&self) -> Option<Validity> {
        self.validity
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.validity.map(|v| v.expires_at)
    }

    /// True for credentials without an expiry, or when `now` is before it.
    /// The expiry instant itself is already invalid.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.validity {
            None => true,
            Some(v) => now < v.expires_at,
        }
    }

    pub fn ensure_valid(&self, now: DateTime<Utc>) -> Result<(), CredentialError> {
        match self.validity {
            Some(v) if now >= v.expires_at => Err(CredentialError::Expired {
                expired_at: v.expires_at,
            }),
            _ => Ok(()),
        }
    }

    /// True once `now` is within `margin` of expiry
    pub fn renewal_due(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.validity {
            None => false,
            Some(v) => now >= v.expires_at - margin,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("secret", &"***")
            .field("validity", &self.validity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn token(issued: i64, expires: i64) -> Credential {
        Credential::new("device-123", "unused", "eyJ.token.sig").with_validity(Validity {
            issued_at: at(issued),
            expires_at: at(expires),
        })
    }

    #[test]
    fn test_static_credential_never_expires() {
        let cred = Credential::new("device-123", "device-123", "hunter2");
        assert!(cred.is_valid_at(at(i64::from(i32::MAX))));
        assert!(cred.ensure_valid(at(0)).is_ok());
        assert!(!cred.renewal_due(at(0), Duration::seconds(300)));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let cred = token(1000, 87400);
        assert!(cred.is_valid_at(at(87399)));
        assert!(!cred.is_valid_at(at(87400)));
        assert!(matches!(
            cred.ensure_valid(at(87400)),
            Err(CredentialError::Expired { .. })
        ));
        assert!(cred.ensure_valid(at(87500)).is_err());
    }

    #[test]
    fn test_renewal_due_before_expiry() {
        let cred = token(1000, 87400);
        let margin = Duration::seconds(300);
        assert!(!cred.renewal_due(at(87099), margin));
        assert!(cred.renewal_due(at(87100), margin));
        assert!(cred.renewal_due(at(87399), margin));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let cred = Credential::new("device-123", "user", "super-secret-password");
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("super-secret-password"));
        assert!(rendered.contains("***"));
        assert!(rendered.contains("device-123"));
    }
}
