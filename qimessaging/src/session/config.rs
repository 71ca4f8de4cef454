//! Configuration of a [`Session`](super::Session).

use std::time::Duration;

use qimessaging_core::DEFAULT_PORT;
use qimessaging_transport::{Protocol, ServerConfig, SocketConfig, Url};

/// Environment variable naming the service directory url.
pub const ENV_URL: &str = "QI_URL";

/// Environment variable listing listen urls, comma separated.
pub const ENV_LISTEN_URL: &str = "QI_LISTEN_URL";

/// Directory url used when nothing is configured.
pub const DEFAULT_URL: &str = "tcp://127.0.0.1:9559";

/// Listen url used when nothing is configured.
pub const DEFAULT_LISTEN_URL: &str = "tcp://0.0.0.0:0";

/// Configuration for sessions.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Configuration of every socket the session opens or accepts
    pub socket: SocketConfig,

    /// Service directory reached by [`Session::start`](super::Session::start)
    pub directory_url: Url,

    /// Urls the object server listens on in [`Session::start`](super::Session::start)
    pub listen_urls: Vec<Url>,

    /// How often endpoints of unspecified binds are recomputed
    pub endpoint_refresh_interval: Duration,

    /// Extra host names or addresses advertised for unspecified binds
    pub advertised_hosts: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            socket: SocketConfig::default(),
            directory_url: Url::new(Protocol::Tcp, "127.0.0.1", DEFAULT_PORT),
            listen_urls: vec![Url::new(Protocol::Tcp, "0.0.0.0", 0)],
            endpoint_refresh_interval: server.endpoint_refresh_interval,
            advertised_hosts: server.advertised_hosts,
        }
    }
}

impl SessionConfig {
    /// Defaults with the environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().apply_env(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`, socket settings included.
    ///
    /// Unparsable urls are logged and ignored.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self.socket = self.socket.apply_env(&lookup);
        if let Some(value) = lookup(ENV_URL) {
            match Url::parse(value.trim()) {
                Ok(url) => self.directory_url = url,
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", ENV_URL, value, e),
            }
        }
        if let Some(value) = lookup(ENV_LISTEN_URL) {
            let urls: Vec<Url> = value
                .split(',')
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .filter_map(|text| match Url::parse(text) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!("Ignoring {} entry {:?}: {}", ENV_LISTEN_URL, text, e);
                        None
                    }
                })
                .collect();
            if !urls.is_empty() {
                self.listen_urls = urls;
            }
        }
        self
    }

    /// Change the directory url.
    pub fn with_directory_url(mut self, url: Url) -> Self {
        self.directory_url = url;
        self
    }

    /// Replace the listen urls.
    pub fn with_listen_urls(mut self, urls: Vec<Url>) -> Self {
        self.listen_urls = urls;
        self
    }

    /// Change the socket configuration.
    pub fn with_socket(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }

    /// Configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            socket: SocketConfig::local_network(),
            ..Self::default()
        }
    }

    /// Configuration of the object server.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            socket: self.socket.clone(),
            advertised_hosts: self.advertised_hosts.clone(),
            endpoint_refresh_interval: self.endpoint_refresh_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_the_documented_urls() {
        let config = SessionConfig::default();
        assert_eq!(config.directory_url.to_string(), DEFAULT_URL);
        assert_eq!(config.listen_urls.len(), 1);
        assert_eq!(config.listen_urls[0].to_string(), DEFAULT_LISTEN_URL);
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            (ENV_URL, "tcp://10.0.0.1:9600"),
            (ENV_LISTEN_URL, "tcp://0.0.0.0:9601, tcps://0.0.0.0:9602"),
            ("QI_MAX_MESSAGE_PAYLOAD", "1000"),
        ]);
        let config = SessionConfig::default().apply_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.directory_url.to_string(), "tcp://10.0.0.1:9600");
        assert_eq!(config.listen_urls.len(), 2);
        assert!(config.listen_urls[1].protocol().is_tls());
        assert_eq!(config.socket.max_payload_size, 1000);
    }

    #[test]
    fn test_bad_urls_are_ignored() {
        let env = HashMap::from([(ENV_URL, "not a url"), (ENV_LISTEN_URL, "also bad")]);
        let config = SessionConfig::default().apply_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.directory_url.to_string(), DEFAULT_URL);
        assert_eq!(config.listen_urls[0].to_string(), DEFAULT_LISTEN_URL);
    }
}
