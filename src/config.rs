//! Device configuration loaded from TOML
//!
//! Secrets can be referenced through environment variables
//! (`password_env`), which are resolved when credentials are built, not at
//! load time.

use crate::auth::{
    CredentialError, CredentialProvider, SignedTokenProvider, StaticCredentials, TokenAlgorithm,
    TokenSettings,
};
use crate::backend::{Backend, BackendProfile};
use crate::protocol::{validate_device_id, validate_filter, validate_publish_topic};
use crate::session::{SessionConfig, MAX_SUBSCRIPTIONS};
use crate::transport::{PemSource, TrustConfig};
use rumqttc::mqttbytes::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub server: ServerSection,
    pub identity: IdentitySection,
    pub credentials: CredentialsSection,
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub backend: Backend,
}

fn default_port() -> u16 {
    8883
}

/// Device identity. Client id and username default per backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IdentitySection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub device_id: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub project: Option<String>,
    pub region: Option<String>,
    pub registry: Option<String>,
}

/// How the device authenticates in CONNECT
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CredentialsSection {
    Static {
        password: Option<String>,
        /// Environment variable holding the password
        password_env: Option<String>,
    },
    Token {
        private_key_file: PathBuf,
        #[serde(default = "default_algorithm")]
        algorithm: TokenAlgorithm,
        /// Defaults to the backend audience or the device id
        issuer: Option<String>,
        audience: Option<String>,
        #[serde(default = "default_lifetime_secs")]
        lifetime_secs: u64,
        #[serde(default = "default_renew_margin_secs")]
        renew_margin_secs: u64,
        #[serde(default = "default_max_token_len")]
        max_token_len: usize,
    },
}

fn default_algorithm() -> TokenAlgorithm {
    TokenAlgorithm::Rs256
}

/// Longest token lifetime a config may ask for (one year)
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 365 * 86_400;

fn default_lifetime_secs() -> u64 {
    86_400
}

fn default_renew_margin_secs() -> u64 {
    300
}

fn seconds(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

fn default_max_token_len() -> usize {
    crate::auth::token::DEFAULT_MAX_TOKEN_LEN
}

/// PEM files for server verification and mutual TLS
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    pub root_ca_file: Option<PathBuf>,
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
}

/// Topic overrides. Unset topics fall back to the backend defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    pub publish: Option<String>,
    pub subscribe: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    /// 0 or 1
    #[serde(default)]
    pub qos: u8,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            tick_ms: default_tick_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            max_subscriptions: default_max_subscriptions(),
            qos: 0,
        }
    }
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_tick_ms() -> u64 {
    100
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

fn default_max_payload_bytes() -> usize {
    1024
}

fn default_max_subscriptions() -> usize {
    MAX_SUBSCRIPTIONS
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Credential setup failed: {0}")]
    Credential(#[from] CredentialError),
}

impl DeviceConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("server.host is empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidConfig("server.port must be > 0".to_string()));
        }
        validate_device_id(&self.identity.device_id)
            .map_err(|e| ConfigError::InvalidDeviceId(e.to_string()))?;

        let session = &self.session;
        if session.tick_ms == 0 {
            return Err(ConfigError::InvalidConfig("session.tick_ms must be > 0".to_string()));
        }
        if session.ack_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.ack_timeout_ms must be > 0".to_string(),
            ));
        }
        if session.keep_alive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(format!(
                "session.keep_alive_secs must be <= {}",
                u16::MAX
            )));
        }
        if session.max_subscriptions == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.max_subscriptions must be > 0".to_string(),
            ));
        }
        if session.qos > 1 {
            return Err(ConfigError::InvalidConfig(format!(
                "session.qos {} is not supported, use 0 or 1",
                session.qos
            )));
        }

        if let CredentialsSection::Token {
            lifetime_secs,
            renew_margin_secs,
            ..
        } = &self.credentials
        {
            if *lifetime_secs == 0 || *lifetime_secs > MAX_TOKEN_LIFETIME_SECS {
                return Err(ConfigError::InvalidConfig(format!(
                    "credentials.lifetime_secs must be between 1 and {MAX_TOKEN_LIFETIME_SECS}"
                )));
            }
            if *renew_margin_secs == 0 || renew_margin_secs >= lifetime_secs {
                return Err(ConfigError::InvalidConfig(
                    "credentials.renew_margin_secs must be > 0 and less than lifetime_secs"
                        .to_string(),
                ));
            }
        }

        if let Some(tls) = &self.tls {
            if tls.client_cert_file.is_some() != tls.client_key_file.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "tls.client_cert_file and tls.client_key_file must be set together"
                        .to_string(),
                ));
            }
        }

        let profile = self.profile()?;
        if let Some(topic) = self.topics.publish.as_ref().or(profile.publish_topic.as_ref()) {
            validate_publish_topic(topic)
                .map_err(|e| ConfigError::InvalidConfig(format!("topics.publish: {e}")))?;
        }
        if let Some(filter) = self
            .topics
            .subscribe
            .as_ref()
            .or(profile.subscribe_filter.as_ref())
        {
            validate_filter(filter)
                .map_err(|e| ConfigError::InvalidConfig(format!("topics.subscribe: {e}")))?;
        }

        Ok(())
    }

    /// Identity and topics derived from the backend
    pub fn profile(&self) -> Result<BackendProfile, ConfigError> {
        self.server
            .backend
            .profile(&self.server.host, &self.identity)
    }

    pub fn client_id(&self) -> Result<String, ConfigError> {
        match &self.identity.client_id {
            Some(id) => Ok(id.clone()),
            None => Ok(self.profile()?.client_id),
        }
    }

    pub fn username(&self) -> Result<String, ConfigError> {
        match &self.identity.username {
            Some(name) => Ok(name.clone()),
            None => Ok(self.profile()?.username),
        }
    }

    pub fn publish_topic(&self) -> Result<Option<String>, ConfigError> {
        match &self.topics.publish {
            Some(topic) => Ok(Some(topic.clone())),
            None => Ok(self.profile()?.publish_topic),
        }
    }

    pub fn subscribe_filter(&self) -> Result<Option<String>, ConfigError> {
        match &self.topics.subscribe {
            Some(filter) => Ok(Some(filter.clone())),
            None => Ok(self.profile()?.subscribe_filter),
        }
    }

    pub fn qos(&self) -> QoS {
        if self.session.qos == 1 {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        }
    }

    /// Trust material, if a `[tls]` section is present
    pub fn trust_config(&self) -> Option<TrustConfig> {
        self.tls.as_ref().map(|tls| TrustConfig {
            root_ca: tls.root_ca_file.clone().map(PemSource::File),
            client_cert: tls.client_cert_file.clone().map(PemSource::File),
            client_key: tls.client_key_file.clone().map(PemSource::File),
        })
    }

    /// Margin before expiry at which tokens are renewed
    pub fn renew_margin(&self) -> chrono::Duration {
        match &self.credentials {
            CredentialsSection::Token {
                renew_margin_secs, ..
            } => seconds(*renew_margin_secs)
                .unwrap_or_else(|| chrono::Duration::seconds(default_renew_margin_secs() as i64)),
            CredentialsSection::Static { .. } => {
                chrono::Duration::seconds(default_renew_margin_secs() as i64)
            }
        }
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        Ok(SessionConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            trust: self.trust_config(),
            keep_alive: Duration::from_secs(self.session.keep_alive_secs),
            tick: Duration::from_millis(self.session.tick_ms),
            ack_timeout: Duration::from_millis(self.session.ack_timeout_ms),
            renew_margin: self.renew_margin(),
            qos: self.qos(),
            max_payload_bytes: self.session.max_payload_bytes,
            max_subscriptions: self.session.max_subscriptions,
            publish_topic: self.publish_topic()?,
        })
    }

    /// Resolve the static password, reading `password_env` if set
    pub fn get_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.credentials {
            CredentialsSection::Static {
                password_env: Some(name),
                ..
            } => Self::get_env_var_required(name).map(Some),
            CredentialsSection::Static { password, .. } => Ok(password.clone()),
            CredentialsSection::Token { .. } => Ok(None),
        }
    }

    /// Build the credential provider described by `[credentials]`
    pub fn credential_provider(&self) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
        let client_id = self.client_id()?;
        let username = self.username()?;

        match &self.credentials {
            CredentialsSection::Static { .. } => {
                let password = self.get_password()?.unwrap_or_default();
                Ok(Arc::new(StaticCredentials::new(client_id, username, password)))
            }
            CredentialsSection::Token {
                private_key_file,
                algorithm,
                issuer,
                audience,
                lifetime_secs,
                max_token_len,
                ..
            } => {
                let profile = self.profile()?;
                let issuer = issuer
                    .clone()
                    .or_else(|| profile.audience.clone())
                    .unwrap_or_else(|| self.identity.device_id.clone());
                let lifetime = seconds(*lifetime_secs)
                    .filter(|_| *lifetime_secs <= MAX_TOKEN_LIFETIME_SECS)
                    .ok_or_else(|| {
                        ConfigError::InvalidConfig(format!(
                            "credentials.lifetime_secs {lifetime_secs} is out of range"
                        ))
                    })?;
                let mut settings =
                    TokenSettings::new(issuer, lifetime).with_max_token_len(*max_token_len);
                if let Some(audience) = audience.clone().or(profile.audience) {
                    settings = settings.with_audience(audience);
                }
                let provider = SignedTokenProvider::from_key_file(
                    client_id,
                    username,
                    *algorithm,
                    private_key_file,
                    settings,
                )?;
                Ok(Arc::new(provider))
            }
        }
    }

    /// TOML rendering with secrets masked, for `config --show`
    pub fn redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if let CredentialsSection::Static { password, .. } = &mut shown.credentials {
            if password.is_some() {
                *password = Some("***".to_string());
            }
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[server]
host = "broker.example.com"

[identity]
device_id = "123"

[credentials]
mode = "static"
password = "secret"

[topics]
publish = "devices/123/events"
subscribe = "devices/123/config"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
