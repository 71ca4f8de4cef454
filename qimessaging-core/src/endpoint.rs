//! Endpoint urls (`tcp://host:port`, `tcps://host:port`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Port used when a url does not name one.
pub const DEFAULT_PORT: u16 = 9559;

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Plain TCP.
    Tcp,
    /// TCP wrapped in TLS.
    Tcps,
}

impl Protocol {
    /// Scheme string used in urls.
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tcps => "tcps",
        }
    }

    /// True when the protocol requires a TLS handshake.
    pub fn is_tls(self) -> bool {
        matches!(self, Protocol::Tcps)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Protocol {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "tcps" => Ok(Protocol::Tcps),
            other => Err(UrlError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

/// Error parsing an endpoint url.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    /// The text is not a url.
    #[error("invalid url {url:?}: {reason}")]
    Invalid {
        /// Text that was parsed.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The scheme is neither `tcp` nor `tcps`.
    #[error("unsupported scheme {scheme:?}")]
    UnsupportedScheme {
        /// Scheme found in the url.
        scheme: String,
    },

    /// The url has no host.
    #[error("url {url:?} has no host")]
    MissingHost {
        /// Text that was parsed.
        url: String,
    },
}

/// Network endpoint of a socket or server.
///
/// A missing scheme means `tcp`, a missing port means [`DEFAULT_PORT`].
///
/// ```rust
/// use qimessaging_core::{Protocol, Url};
///
/// let url: Url = "tcps://example.org".parse().expect("url");
/// assert_eq!(url.protocol(), Protocol::Tcps);
/// assert_eq!(url.port(), 9559);
/// assert_eq!(url.to_string(), "tcps://example.org:9559");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Url {
    protocol: Protocol,
    host: String,
    port: u16,
}

impl Url {
    /// Build a url from its parts.
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    /// Parse a url.
    pub fn parse(text: &str) -> Result<Self, UrlError> {
        let with_scheme = if text.contains("://") {
            text.to_string()
        } else {
            format!("tcp://{text}")
        };
        let parsed = url::Url::parse(&with_scheme).map_err(|e| UrlError::Invalid {
            url: text.to_string(),
            reason: e.to_string(),
        })?;
        let protocol = parsed.scheme().parse()?;
        let host = match parsed.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(UrlError::MissingHost {
                    url: text.to_string(),
                })
            }
        };
        Ok(Self {
            protocol,
            host,
            port: parsed.port().unwrap_or(DEFAULT_PORT),
        })
    }

    /// Transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Host name or address, without brackets for IPv6.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same url with another port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Same url with another host.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..self.clone()
        }
    }

    /// True for `localhost` and `127.x.x.x` hosts.
    pub fn is_loopback(&self) -> bool {
        self.host == "localhost" || self.host.starts_with("127.") || self.host == "::1"
    }

    /// `host:port` form accepted by socket address resolution.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.authority())
    }
}

impl FromStr for Url {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::parse(s)
    }
}

impl Serialize for Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Url {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Url::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let url = Url::parse("tcp://127.0.0.1:4242").expect("parse");
        assert_eq!(url.protocol(), Protocol::Tcp);
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), 4242);
        assert!(url.is_loopback());
    }

    #[test]
    fn test_parse_defaults() {
        let url = Url::parse("robot.local").expect("parse");
        assert_eq!(url.protocol(), Protocol::Tcp);
        assert_eq!(url.port(), DEFAULT_PORT);
        assert!(!url.is_loopback());
    }

    #[test]
    fn test_parse_ipv6() {
        let url = Url::parse("tcp://[::1]:0").expect("parse");
        assert_eq!(url.host(), "::1");
        assert_eq!(url.port(), 0);
        assert_eq!(url.to_string(), "tcp://[::1]:0");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Url::parse("udp://1.2.3.4:5"),
            Err(UrlError::UnsupportedScheme { .. })
        ));
        assert!(Url::parse("tcp://:99999").is_err());
    }

    #[test]
    fn test_url_codec_round_trip() {
        let url = Url::new(Protocol::Tcps, "10.0.0.2", 9443);
        let buffer = crate::to_buffer(&url).expect("encode");
        let decoded: Url = crate::from_buffer(&buffer).expect("decode");
        assert_eq!(decoded, url);
    }
}
