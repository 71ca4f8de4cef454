//! Configuration structures for socket behavior.

use std::time::Duration;

use qimessaging_core::{CapabilityMap, default_capabilities};

use super::tls::TlsConfig;

/// Environment variable overriding [`SocketConfig::max_payload_size`].
pub const ENV_MAX_PAYLOAD: &str = "QI_MAX_MESSAGE_PAYLOAD";

/// Environment variable enabling IPv6 when set to a non-empty value.
pub const ENV_ENABLE_IPV6: &str = "QIMESSAGING_ENABLE_IPV6";

/// Environment variable setting the slow dispatch warning, in microseconds.
pub const ENV_DISPATCH_WARN_THRESHOLD: &str = "QIMESSAGING_SOCKET_DISPATCH_TIME_WARN_THRESHOLD";

/// Configuration for socket behavior.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Largest payload accepted from the network; 0 disables the check
    pub max_payload_size: usize,

    /// Whether IPv6 addresses may be used when connecting or listening
    pub ipv6_enabled: bool,

    /// Timeout for resolving, connecting and the TLS handshake together
    pub connect_timeout: Duration,

    /// Bound on the graceful shutdown when disconnecting
    pub disconnect_timeout: Duration,

    /// Warn when handing one message to the dispatcher takes longer.
    ///
    /// Set to `Duration::ZERO` to disable the warning.
    pub dispatch_warn_threshold: Duration,

    /// Capabilities advertised right after the connection is established
    pub capabilities: CapabilityMap,

    /// Certificate and key for the server role of `tcps` endpoints
    pub tls: Option<TlsConfig>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 50_000_000,
            ipv6_enabled: false,
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(1),
            dispatch_warn_threshold: Duration::ZERO, // Disabled by default
            capabilities: default_capabilities(),
            tls: None,
        }
    }
}

impl SocketConfig {
    /// Defaults with the environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().apply_env(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`.
    ///
    /// Unparsable values are logged and ignored.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(ENV_MAX_PAYLOAD) {
            match value.trim().parse::<usize>() {
                Ok(max) => self.max_payload_size = max,
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", ENV_MAX_PAYLOAD, value, e),
            }
        }
        if let Some(value) = lookup(ENV_ENABLE_IPV6) {
            self.ipv6_enabled = !value.is_empty();
        }
        if let Some(value) = lookup(ENV_DISPATCH_WARN_THRESHOLD) {
            match value.trim().parse::<u64>() {
                Ok(micros) => self.dispatch_warn_threshold = Duration::from_micros(micros),
                Err(e) => tracing::warn!(
                    "Ignoring {}={:?}: {}",
                    ENV_DISPATCH_WARN_THRESHOLD,
                    value,
                    e
                ),
            }
        }
        self
    }

    /// Change the largest accepted payload.
    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    /// Allow or forbid IPv6.
    pub fn with_ipv6(mut self, enabled: bool) -> Self {
        self.ipv6_enabled = enabled;
        self
    }

    /// Serve `tcps` endpoints with the given certificate.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            disconnect_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            (ENV_MAX_PAYLOAD, "10000000"),
            (ENV_ENABLE_IPV6, "1"),
            (ENV_DISPATCH_WARN_THRESHOLD, "2500"),
        ]);
        let config =
            SocketConfig::default().apply_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.max_payload_size, 10_000_000);
        assert!(config.ipv6_enabled);
        assert_eq!(config.dispatch_warn_threshold, Duration::from_micros(2500));
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let config = SocketConfig::default().apply_env(|name| {
            (name == ENV_MAX_PAYLOAD).then(|| "lots".to_string())
        });
        assert_eq!(config.max_payload_size, SocketConfig::default().max_payload_size);
        assert!(!config.ipv6_enabled);
    }
}
