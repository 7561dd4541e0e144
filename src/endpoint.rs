//! Transport addresses.
//!
//! An [`Endpoint`] is an opaque string owned by whichever transport produced
//! it. The IP transports share one grammar:
//!
//! ```text
//! /ipv4/<A>.<B>.<C>.<D>:<port>/
//! /ipv6/[<addr>]:<port>/
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const IPV4_PREFIX: &str = "/ipv4/";
const IPV6_PREFIX: &str = "/ipv6/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("not an ip endpoint: {0:?}")]
    Malformed(String),
    #[error("invalid address in endpoint {0:?}")]
    InvalidAddress(String),
    #[error("invalid port in endpoint {0:?}")]
    InvalidPort(String),
}

#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this endpoint follows the ip grammar.
    pub fn is_ip(&self) -> bool {
        self.to_socket_addr().is_ok()
    }

    pub fn to_socket_addr(&self) -> Result<SocketAddr, EndpointError> {
        let malformed = || EndpointError::Malformed(self.0.clone());
        let s = self.0.as_str();

        if let Some(rest) = s.strip_prefix(IPV4_PREFIX) {
            let body = rest.strip_suffix('/').ok_or_else(malformed)?;
            let (ip, port) = body.rsplit_once(':').ok_or_else(malformed)?;
            let ip = Ipv4Addr::from_str(ip)
                .map_err(|_| EndpointError::InvalidAddress(self.0.clone()))?;
            Ok(SocketAddr::new(IpAddr::V4(ip), self.parse_port(port)?))
        } else if let Some(rest) = s.strip_prefix(IPV6_PREFIX) {
            let body = rest.strip_suffix('/').ok_or_else(malformed)?;
            let body = body.strip_prefix('[').ok_or_else(malformed)?;
            let (ip, port) = body.rsplit_once("]:").ok_or_else(malformed)?;
            let ip = Ipv6Addr::from_str(ip)
                .map_err(|_| EndpointError::InvalidAddress(self.0.clone()))?;
            Ok(SocketAddr::new(IpAddr::V6(ip), self.parse_port(port)?))
        } else {
            Err(malformed())
        }
    }

    fn parse_port(&self, port: &str) -> Result<u16, EndpointError> {
        // u16::from_str accepts a leading '+'
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EndpointError::InvalidPort(self.0.clone()));
        }
        port.parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(self.0.clone()))
    }

    /// Keeps the port of this endpoint and swaps in `ip`.
    ///
    /// Used when a peer reports an address we can observe better ourselves,
    /// e.g. a NAT-translated one.
    pub fn with_ip(&self, ip: IpAddr) -> Result<Endpoint, EndpointError> {
        let addr = self.to_socket_addr()?;
        Ok(Endpoint::from(SocketAddr::new(ip, addr.port())))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self(format!("{IPV4_PREFIX}{}:{}/", v4.ip(), v4.port())),
            SocketAddr::V6(v6) => Self(format!("{IPV6_PREFIX}[{}]:{}/", v6.ip(), v6.port())),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Accepts either the endpoint grammar or a plain `ip:port` socket address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(Endpoint::from(addr));
        }
        let endpoint = Endpoint::new(s);
        endpoint.to_socket_addr()?;
        Ok(endpoint)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint({})", self.0)
    }
}
