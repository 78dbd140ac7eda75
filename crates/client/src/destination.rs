use crate::ClientError;
use http::HeaderValue;
use http::Uri;
use http::uri::Scheme;
use std::fmt;

/// The resolved target of a request: scheme, host and port. Keys the pool cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self { scheme, host: host.into(), port }
    }

    /// Derive the destination from an absolute uri, filling the scheme's default port.
    pub fn from_uri(uri: &Uri) -> Result<Self, ClientError> {
        let scheme = uri.scheme().ok_or_else(|| ClientError::invalid_request(format!("uri {uri} has no scheme")))?;
        if *scheme != Scheme::HTTP && *scheme != Scheme::HTTPS {
            return Err(ClientError::invalid_request(format!("unsupported scheme {scheme}")));
        }
        let host = uri.host().ok_or_else(|| ClientError::invalid_request(format!("uri {uri} has no host")))?;
        let port = uri.port_u16().unwrap_or_else(|| default_port(scheme));
        Ok(Self { scheme: scheme.clone(), host: host.to_ascii_lowercase(), port })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The host as written in the uri, IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The host in the form a resolver expects.
    pub fn resolve_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// `host[:port]`, the port omitted when it is the scheme's default.
    pub fn authority(&self) -> String {
        if self.port == default_port(&self.scheme) {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn host_header(&self) -> Result<HeaderValue, ClientError> {
        HeaderValue::try_from(self.authority()).map_err(|e| ClientError::invalid_request(format!("invalid host: {e}")))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn default_port(scheme: &Scheme) -> u16 {
    if *scheme == Scheme::HTTPS { 443 } else { 80 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_filled_and_omitted() {
        let destination = Destination::from_uri(&Uri::from_static("https://Example.com/a")).unwrap();
        assert_eq!(destination.port(), 443);
        assert!(destination.is_secure());
        assert_eq!(destination.authority(), "example.com");

        let destination = Destination::from_uri(&Uri::from_static("http://example.com:8080/")).unwrap();
        assert_eq!(destination.authority(), "example.com:8080");
        assert_eq!(destination.host_header().unwrap(), "example.com:8080");
    }

    #[test]
    fn ipv6_host() {
        let destination = Destination::from_uri(&Uri::from_static("http://[::1]:9000/")).unwrap();
        assert_eq!(destination.resolve_host(), "::1");
        assert_eq!(destination.authority(), "[::1]:9000");
    }

    #[test]
    fn relative_or_foreign_uris_are_rejected() {
        assert!(Destination::from_uri(&Uri::from_static("/only/path")).is_err());
        assert!(Destination::from_uri(&Uri::from_static("ftp://example.com/")).is_err());
    }
}
