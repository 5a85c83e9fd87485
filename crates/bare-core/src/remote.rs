//! Remote tuple `(protocol, host, port, path)` ↔ URL (spec.md §4.C).

use std::fmt;

use url::Url;

use crate::error::BareError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http:",
            Self::Https => "https:",
            Self::Ws => "ws:",
            Self::Wss => "wss:",
        }
    }

    pub fn parse(s: &str) -> Result<Self, BareError> {
        match s {
            "http:" => Ok(Self::Http),
            "https:" => Ok(Self::Https),
            "ws:" => Ok(Self::Ws),
            "wss:" => Ok(Self::Wss),
            other => Err(BareError::invalid(format!("invalid x-bare-protocol: {other}"))),
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http | Self::Ws => 80,
            Self::Https | Self::Wss => 443,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Https | Self::Wss)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }

    /// `ws:`→`http:`, `wss:`→`https:`, used when dialing the outbound
    /// upgrade request (spec.md §4.D bareUpgradeFetch).
    pub fn to_http_equivalent(&self) -> Self {
        match self {
            Self::Ws => Self::Http,
            Self::Wss => Self::Https,
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub protocol: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}//{}:{}{}", self.protocol.as_str(), self.host, self.port, self.path)
    }
}

impl Remote {
    pub fn new(protocol: Scheme, host: String, port: u16, path: String) -> Result<Self, BareError> {
        if host.is_empty() {
            return Err(BareError::invalid("x-bare-host must not be empty"));
        }
        if !path.starts_with('/') {
            return Err(BareError::invalid("x-bare-path must start with '/'"));
        }
        Ok(Self { protocol, host, port, path })
    }

    pub fn to_url(&self) -> Result<Url, BareError> {
        let raw = format!("{}//{}:{}{}", self.protocol.as_str(), self.host, self.port, self.path);
        Url::parse(&raw).map_err(|e| BareError::invalid(format!("invalid remote: {e}")))
    }

    pub fn from_url(url: &Url) -> Result<Self, BareError> {
        let protocol = Scheme::parse(url.scheme())
            .or_else(|_| Scheme::parse(&format!("{}:", url.scheme())))?;
        let host = url
            .host_str()
            .ok_or_else(|| BareError::invalid("x-bare-url has no host"))?
            .to_string();
        let port = url.port().unwrap_or_else(|| protocol.default_port());
        let mut path = url[url::Position::BeforePath..].to_string();
        if path.is_empty() {
            path.push('/');
        }
        Remote::new(protocol, host, port, path)
    }
}

/// Validates a port supplied as either an integer or its string form
/// (spec.md §4.C: "integer in [1,65535], accept string form, parse").
pub fn parse_port(raw: &str) -> Result<u16, BareError> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|p| *p >= 1 && *p <= 65535)
        .map(|p| p as u16)
        .ok_or_else(|| BareError::invalid(format!("x-bare-port must be an integer in [1,65535], got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_url() {
        let remote = Remote::new(Scheme::Https, "example.com".to_string(), 443, "/a/b".to_string()).unwrap();
        let url = remote.to_url().unwrap();
        let back = Remote::from_url(&url).unwrap();
        assert_eq!(remote, back);
    }

    #[test]
    fn defaults_port_when_absent_in_url() {
        let url = Url::parse("wss://echo.example/socket").unwrap();
        let remote = Remote::from_url(&url).unwrap();
        assert_eq!(remote.port, 443);
    }

    #[test]
    fn rejects_empty_host() {
        assert!(Remote::new(Scheme::Http, String::new(), 80, "/".to_string()).is_err());
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        assert!(Remote::new(Scheme::Http, "h".to_string(), 80, "rel".to_string()).is_err());
    }

    #[test]
    fn parse_port_accepts_string_and_rejects_out_of_range() {
        assert_eq!(parse_port("443").unwrap(), 443);
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("abc").is_err());
    }
}
