//! Cloud backend identity and topic policy
//!
//! The session core is backend-agnostic. A `Backend` only derives the
//! connect identity and default topics each broker family expects.

use crate::config::{ConfigError, IdentitySection};
use serde::{Deserialize, Serialize};

/// API version presented in the Azure IoT Hub username
pub const AZURE_API_VERSION: &str = "2021-04-12";

/// Username Google Cloud IoT Core ignores but requires
pub const GOOGLE_USERNAME: &str = "unused";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Plain MQTT broker; client id and username are the device id
    #[default]
    Generic,
    /// Azure IoT Hub with a SAS token as the password
    Azure,
    /// Google Cloud IoT Core with a JWT as the password
    Google,
}

/// Identity and topics derived for a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub client_id: String,
    pub username: String,
    pub publish_topic: Option<String>,
    pub subscribe_filter: Option<String>,
    /// Token audience the backend checks, if any
    pub audience: Option<String>,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Generic => "generic",
            Backend::Azure => "azure",
            Backend::Google => "google",
        }
    }

    /// Default identity and topics for `identity` on a broker at `host`
    pub fn profile(self, host: &str, identity: &IdentitySection) -> Result<BackendProfile, ConfigError> {
        let id = identity.device_id.as_str();
        match self {
            Backend::Generic => Ok(BackendProfile {
                client_id: id.to_string(),
                username: id.to_string(),
                publish_topic: None,
                subscribe_filter: None,
                audience: None,
            }),
            Backend::Azure => Ok(BackendProfile {
                client_id: id.to_string(),
                username: format!("{host}/{id}/?api-version={AZURE_API_VERSION}"),
                publish_topic: Some(format!("devices/{id}/messages/events/")),
                subscribe_filter: Some(format!("devices/{id}/messages/devicebound/#")),
                audience: None,
            }),
            Backend::Google => {
                let project = required(&identity.project, "identity.project")?;
                let region = required(&identity.region, "identity.region")?;
                let registry = required(&identity.registry, "identity.registry")?;
                Ok(BackendProfile {
                    client_id: format!(
                        "projects/{project}/locations/{region}/registries/{registry}/devices/{id}"
                    ),
                    username: GOOGLE_USERNAME.to_string(),
                    publish_topic: Some(format!("/devices/{id}/events")),
                    subscribe_filter: Some(format!("/devices/{id}/config")),
                    audience: Some(project.to_string()),
                })
            }
        }
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, ConfigError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::InvalidConfig(format!(
            "google backend requires {field}"
        ))),
    }
}
