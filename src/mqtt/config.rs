use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::message::Message;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONNECT_PERIOD: Duration = Duration::from_millis(5000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how the shared session connects
///
/// Built once from configuration and never changed; a different endpoint means
/// a different connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub tls: bool,
    pub verify_server_cert: bool,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub reconnect_period: Duration,
    pub connect_timeout: Duration,
    pub will: Option<Message>,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            tls: true,
            verify_server_cert: false,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            reconnect_period: DEFAULT_RECONNECT_PERIOD,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            will: None,
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Identity under which connections to this endpoint are shared.
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.client_id, self.url())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

/// On-disk journal settings for one session identity
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub dir: PathBuf,
    pub persist_in: bool,
    pub persist_out: bool,
    pub compact_interval: Duration,
}

impl StoreSettings {
    pub fn enabled(&self) -> bool {
        self.persist_in || self.persist_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_and_display() {
        let mut endpoint = BrokerEndpoint::new("mqtt.googleapis.com", 8883, "projects/p/devices/d");
        assert_eq!(endpoint.url(), "mqtts://mqtt.googleapis.com:8883");
        assert_eq!(
            endpoint.to_string(),
            "projects/p/devices/d@mqtts://mqtt.googleapis.com:8883"
        );
        endpoint.tls = false;
        assert_eq!(endpoint.url(), "mqtt://mqtt.googleapis.com:8883");
    }

    #[test]
    fn key_ignores_tuning_options() {
        let a = BrokerEndpoint::new("h", 1, "c");
        let mut b = a.clone();
        b.keep_alive = Duration::from_secs(5);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), BrokerEndpoint::new("h", 1, "other").key());
    }
}
