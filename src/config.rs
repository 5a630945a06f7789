//! # Link Configuration
//!
//! TOML file describing which broker to use, who the device is and how its
//! session is journaled. Every section is optional and falls back to the
//! defaults documented on its fields; only the identity has to be filled in.
//!
//! ```toml
//! [broker]
//! host = "mqtt.googleapis.com"
//! port = 8883
//!
//! [identity]
//! project_id = "my-project"
//! device_id = "dev-1"
//! client_id = "projects/my-project/locations/europe-west1/registries/reg/devices/dev-1"
//! private_key_path = "rsa_private.pem"
//!
//! [store]
//! persist_in = true
//! persist_out = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::mqtt::config::{
    BrokerEndpoint, StoreSettings, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE,
    DEFAULT_RECONNECT_PERIOD,
};
use crate::mqtt::connection::{ManagerOptions, DEFAULT_CLOSE_TIMEOUT};
use crate::mqtt::credential::CredentialIssuer;
use crate::mqtt::endpoints::OutboundSettings;
use crate::mqtt::message::{Message, Qos};

const MIN_KEEP_ALIVE_SECS: u64 = 5;
const APP_DIR: &str = "iotcore-link";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub broker: BrokerConfig,
    pub identity: IdentityConfig,
    pub store: StoreConfig,
    pub inbound: InboundConfig,
    pub outbound: OutboundConfig,
    /// Published after every connect
    pub birth: Option<MessageConfig>,
    /// Published by the broker when the session dies uncleanly
    pub will: Option<MessageConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub verify_server_cert: bool,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub reconnect_period_ms: u64,
    pub connect_timeout_secs: u64,
    pub close_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            tls: true,
            verify_server_cert: false,
            keep_alive_secs: DEFAULT_KEEP_ALIVE.as_secs(),
            clean_session: true,
            reconnect_period_ms: DEFAULT_RECONNECT_PERIOD.as_millis() as u64,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Token audience
    pub project_id: String,
    pub device_id: String,
    pub client_id: String,
    /// PEM encoded RSA key; takes precedence over `private_key_path`
    pub private_key: Option<String>,
    pub private_key_path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Defaults to a per-client directory below the user's local data dir
    pub dir: Option<PathBuf>,
    pub persist_in: bool,
    pub persist_out: bool,
    pub compact_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            persist_in: false,
            persist_out: false,
            compact_interval_secs: 60,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct InboundConfig {
    pub qos: u8,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self { qos: 1 }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct OutboundConfig {
    pub subfolder: Option<String>,
    pub qos: Option<u8>,
    pub retain: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct MessageConfig {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

impl MessageConfig {
    fn to_message(&self, section: &str) -> Result<Message> {
        if self.topic.is_empty() {
            return Err(BridgeError::Config(format!("{} message needs a topic", section)));
        }
        let qos = Qos::try_from(self.qos)
            .map_err(|e| BridgeError::Config(format!("{} message: {}", section, e)))?;
        Ok(Message::new(self.topic.clone(), self.payload.clone())
            .with_qos(qos)
            .with_retain(self.retain))
    }
}

impl LinkConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        info!("Loading link configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that can never produce a working session.
    pub fn validate(&self) -> Result<()> {
        let identity = &self.identity;
        if identity.client_id.trim().is_empty() {
            return Err(BridgeError::Config("identity.client_id is required".to_string()));
        }
        if identity.project_id.trim().is_empty() {
            return Err(BridgeError::Config("identity.project_id is required".to_string()));
        }
        if identity.device_id.trim().is_empty() {
            return Err(BridgeError::Config("identity.device_id is required".to_string()));
        }
        if identity.private_key.is_none() && identity.private_key_path.is_none() {
            return Err(BridgeError::Config(
                "identity.private_key or identity.private_key_path is required".to_string(),
            ));
        }
        if self.broker.host.trim().is_empty() || self.broker.port == 0 {
            return Err(BridgeError::Config("broker host and port must be set".to_string()));
        }
        if self.broker.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(BridgeError::Config(format!(
                "broker.keep_alive_secs must be at least {}",
                MIN_KEEP_ALIVE_SECS
            )));
        }
        if let Some(birth) = &self.birth {
            birth.to_message("birth")?;
        }
        if let Some(will) = &self.will {
            will.to_message("will")?;
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<BrokerEndpoint> {
        let broker = &self.broker;
        let mut endpoint =
            BrokerEndpoint::new(&broker.host, broker.port, &self.identity.client_id);
        endpoint.tls = broker.tls;
        endpoint.verify_server_cert = broker.verify_server_cert;
        endpoint.keep_alive = Duration::from_secs(broker.keep_alive_secs);
        endpoint.clean_session = broker.clean_session;
        endpoint.reconnect_period = Duration::from_millis(broker.reconnect_period_ms);
        endpoint.connect_timeout = Duration::from_secs(broker.connect_timeout_secs);
        endpoint.will = self
            .will
            .as_ref()
            .map(|will| will.to_message("will"))
            .transpose()?;
        Ok(endpoint)
    }

    /// Builds the token issuer, reading the key file if no inline key is set.
    pub async fn issuer(&self) -> Result<CredentialIssuer> {
        let identity = &self.identity;
        let pem = match (&identity.private_key, &identity.private_key_path) {
            (Some(inline), _) => inline.clone().into_bytes(),
            (None, Some(path)) => tokio::fs::read(path).await.map_err(|e| {
                BridgeError::Config(format!("cannot read key {}: {}", path.display(), e))
            })?,
            (None, None) => {
                return Err(BridgeError::Config("no private key configured".to_string()))
            }
        };
        CredentialIssuer::from_rsa_pem(&identity.project_id, &pem)
    }

    /// `None` when neither direction is journaled.
    pub fn store_settings(&self) -> Option<StoreSettings> {
        let store = &self.store;
        if !store.persist_in && !store.persist_out {
            return None;
        }
        let dir = store
            .dir
            .clone()
            .unwrap_or_else(|| default_store_dir(&self.identity.client_id));
        debug!("Session store directory: {}", dir.display());
        Some(StoreSettings {
            dir,
            persist_in: store.persist_in,
            persist_out: store.persist_out,
            compact_interval: Duration::from_secs(store.compact_interval_secs),
        })
    }

    pub fn outbound_settings(&self) -> OutboundSettings {
        OutboundSettings {
            device_id: self.identity.device_id.clone(),
            subfolder: self.outbound.subfolder.clone(),
            qos: self.outbound.qos,
            retain: self.outbound.retain,
        }
    }

    pub async fn manager_options(&self) -> Result<ManagerOptions> {
        Ok(ManagerOptions {
            endpoint: self.endpoint()?,
            issuer: self.issuer().await?,
            birth: self
                .birth
                .as_ref()
                .map(|birth| birth.to_message("birth"))
                .transpose()?,
            store: self.store_settings(),
            close_timeout: Duration::from_secs(self.broker.close_timeout_secs),
        })
    }
}

fn default_store_dir(client_id: &str) -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    let name: String = client_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    base.join(APP_DIR).join(name)
}
