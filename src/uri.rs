//! `coap://` addresses
use std::{
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs},
    str::FromStr,
};

use crate::error::{Error, Result};

pub const COAP_SCHEME: &str = "coap://";
pub const DEFAULT_PORT: u16 = 5683;

/// Separates an IPv6 zone in the textual host, written `%25` inside a URI
const ZONE_SEPARATOR: char = '%';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoapUri {
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
}

impl CoapUri {
    pub fn new(host: &str, port: u16, path: &str, query: Option<&str>) -> Self {
        Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            path: normalise_path(path),
            query: query.filter(|q| !q.is_empty()).map(String::from),
        }
    }

    /// Address of a resource served by the peer that sent a datagram
    pub fn from_source(source: SocketAddr, href: &str) -> Self {
        let (path, query) = match href.find('?') {
            Some(idx) => (&href[..idx], Some(&href[idx + 1..])),
            None => (href, None),
        };
        let host = match source {
            SocketAddr::V6(v6) if v6.scope_id() != 0 => {
                format!("{}{}{}", v6.ip(), ZONE_SEPARATOR, v6.scope_id())
            }
            _ => source.ip().to_string(),
        };
        Self::new(&host, source.port(), path, query)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Values of the `Uri-Path` options
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// Values of the `Uri-Query` options
    pub fn query_params(&self) -> impl Iterator<Item = &str> {
        self.query
            .as_deref()
            .unwrap_or("")
            .split('&')
            .filter(|s| !s.is_empty())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if let Some((ip, zone)) = split_zone(&self.host) {
            let ip = Ipv6Addr::from_str(ip)
                .map_err(|_| Error::invalid_uri(&self.to_string(), "zone on a non-IPv6 host"))?;
            let scope_id = zone
                .parse::<u32>()
                .map_err(|_| Error::invalid_uri(&self.to_string(), "zone is not an interface index"))?;
            return Ok(SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, scope_id)));
        }
        if let Ok(ip) = IpAddr::from_str(&self.host) {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Other(format!("Could not resolve {}", self.host)))
    }
}

fn split_zone(host: &str) -> Option<(&str, &str)> {
    host.find(ZONE_SEPARATOR)
        .map(|idx| (&host[..idx], &host[idx + ZONE_SEPARATOR.len_utf8()..]))
}

fn is_forbidden(c: char) -> bool {
    c.is_whitespace() || c.is_control() || c == '#'
}

fn normalise_path(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

impl FromStr for CoapUri {
    type Err = Error;

    fn from_str(uri: &str) -> Result<Self> {
        let rest = match uri.get(..COAP_SCHEME.len()) {
            Some(scheme) if scheme.eq_ignore_ascii_case(COAP_SCHEME) => &uri[COAP_SCHEME.len()..],
            _ => return Err(Error::invalid_uri(uri, "expected coap:// scheme")),
        };

        let authority_end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        let (path, query) = match tail.find('?') {
            Some(idx) => (&tail[..idx], Some(&tail[idx + 1..])),
            None => (tail, None),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let end = bracketed
                .find(']')
                .ok_or_else(|| Error::invalid_uri(uri, "unterminated IPv6 literal"))?;
            let port = match &bracketed[end + 1..] {
                "" => None,
                p => Some(
                    p.strip_prefix(':')
                        .ok_or_else(|| Error::invalid_uri(uri, "garbage after IPv6 literal"))?,
                ),
            };
            (bracketed[..end].replacen("%25", "%", 1), port)
        } else {
            match authority.rfind(':') {
                Some(idx) => (authority[..idx].to_string(), Some(&authority[idx + 1..])),
                None => (authority.to_string(), None),
            }
        };

        if path.contains(is_forbidden) || query.map_or(false, |q| q.contains(is_forbidden)) {
            return Err(Error::invalid_uri(uri, "whitespace, control character or fragment"));
        }

        if host.is_empty() {
            return Err(Error::invalid_uri(uri, "missing host"));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::invalid_uri(uri, "invalid port"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self::new(&host, port, path, query))
    }
}

impl fmt::Display for CoapUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            let host = self.host.replacen(ZONE_SEPARATOR, "%25", 1);
            write!(f, "{}[{}]:{}{}", COAP_SCHEME, host, self.port, self.path)?;
        } else {
            write!(f, "{}{}:{}{}", COAP_SCHEME, self.host, self.port, self.path)?;
        }
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}
