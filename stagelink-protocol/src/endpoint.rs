//! Channel endpoint addresses
//!
//! Addresses are written as URLs: `tcp://host:port` or `unix:///path/to.sock`.
//! A bare `host:port` is read as TCP.

use std::fmt;
use std::path::PathBuf;

use url::Url;

/// Error parsing an endpoint address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid address '{address}': {reason}")]
    Invalid { address: String, reason: String },

    #[error("unsupported scheme '{0}' (expected tcp or unix)")]
    UnsupportedScheme(String),
}

/// A parsed channel endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP endpoint as `host:port`
    Tcp { host: String, port: u16 },
    /// Unix domain socket path
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse an address string
    pub fn parse(address: &str) -> Result<Self, EndpointError> {
        let address = address.trim();
        let invalid = |reason: &str| EndpointError::Invalid {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if !address.contains("://") {
            let url = Url::parse(&format!("tcp://{}", address)).map_err(|e| invalid(&e.to_string()))?;
            return Self::from_tcp_url(&url).map_err(|reason| invalid(reason));
        }

        let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "tcp" => Self::from_tcp_url(&url).map_err(|reason| invalid(reason)),
            "unix" => {
                // unix:///tmp/x.sock has an empty host and the path in the path part
                let path = match url.host_str() {
                    Some(host) if !host.is_empty() => format!("{}{}", host, url.path()),
                    _ => url.path().to_string(),
                };
                if path.is_empty() || path == "/" {
                    return Err(invalid("missing socket path"));
                }
                Ok(Endpoint::Unix(PathBuf::from(path)))
            }
            other => Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
    }

    fn from_tcp_url(url: &Url) -> Result<Self, &'static str> {
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or("missing host")?;
        let port = url.port().ok_or("missing port")?;
        // Url keeps IPv6 literals bracketed, which is what socket addresses expect too
        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Loopback TCP endpoint on an ephemeral port
    pub fn ephemeral_loopback() -> Self {
        Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        }
    }

    /// `host:port` form for socket APIs, `None` for Unix endpoints
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } => Some(format!("{}:{}", host, port)),
            Endpoint::Unix(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}
