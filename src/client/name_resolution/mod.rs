//! Name resolution: converting a channel's target into network addresses and
//! an optional service config.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use url::Host;

use crate::client::service_config::ServiceConfig;
use crate::status::Status;

pub mod dns;

pub const DEFAULT_PORT: u16 = 443;

/// A resolved backend address: `ip:port` for IPv4, `[ip]:port` for IPv6.
/// Carried as an opaque string through the rest of the core.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Address {
        Address(address.into())
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Address {
        match ip {
            IpAddr::V4(v4) => Address(format!("{v4}:{port}")),
            IpAddr::V6(v6) => Address(format!("[{v6}]:{port}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The host portion of a parsed target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetHost {
    Domain(String),
    Ip(IpAddr),
}

/// A parsed channel target.
///
/// The accepted grammar is `[dns:][//authority/]host[:port]` where host is a
/// DNS name, an IPv4 literal, or a (possibly bracketed) IPv6 literal. Targets
/// outside this grammar are rejected at construction time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    raw: String,
    /// The name resolution authority (a DNS server), if the target named one.
    authority: Option<String>,
    host: TargetHost,
    port: Option<u16>,
}

/// The error produced when a target string does not match the grammar.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidTarget {
    target: String,
    reason: String,
}

impl fmt::Display for InvalidTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid target {:?}: {}", self.target, self.reason)
    }
}

impl std::error::Error for InvalidTarget {}

impl FromStr for Target {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| InvalidTarget {
            target: s.to_owned(),
            reason: reason.to_owned(),
        };

        let mut rest = s.strip_prefix("dns:").unwrap_or(s);

        let mut authority = None;
        if let Some(after) = rest.strip_prefix("//") {
            let Some((auth, endpoint)) = after.split_once('/') else {
                return Err(invalid("authority present but no endpoint follows it"));
            };
            if !auth.is_empty() {
                authority = Some(auth.to_owned());
            }
            rest = endpoint;
        }

        if rest.is_empty() {
            return Err(invalid("empty endpoint"));
        }

        let (host, port) = split_host_port(rest).ok_or_else(|| invalid("unparsable endpoint"))?;
        let host = classify_host(&host).ok_or_else(|| invalid("unparsable host"))?;

        Ok(Target {
            raw: s.to_owned(),
            authority,
            host,
            port,
        })
    }
}

impl Target {
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn host(&self) -> &TargetHost {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// The default `:authority` for calls on a channel with this target:
    /// the DNS hostname, or the IP literal itself.
    pub fn default_authority(&self) -> String {
        match &self.host {
            TargetHost::Domain(domain) => domain.clone(),
            TargetHost::Ip(IpAddr::V4(v4)) => v4.to_string(),
            TargetHost::Ip(IpAddr::V6(v6)) => format!("[{v6}]"),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Splits `host[:port]`, handling bracketed and bare IPv6 literals.
fn split_host_port(endpoint: &str) -> Option<(String, Option<u16>)> {
    if let Some(after_bracket) = endpoint.strip_prefix('[') {
        let (inside, after) = after_bracket.split_once(']')?;
        // Brackets must contain an IPv6 literal.
        inside.parse::<Ipv6Addr>().ok()?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((format!("[{inside}]"), port));
    }

    // A bare IPv6 literal carries colons but no port.
    if endpoint.parse::<Ipv6Addr>().is_ok() {
        return Some((format!("[{endpoint}]"), None));
    }

    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() || host.contains(':') {
                return None;
            }
            Some((host.to_owned(), Some(port.parse().ok()?)))
        }
        None => Some((endpoint.to_owned(), None)),
    }
}

fn classify_host(host: &str) -> Option<TargetHost> {
    match Host::parse(host).ok()? {
        Host::Domain(domain) => {
            if domain.is_empty() {
                return None;
            }
            Some(TargetHost::Domain(domain))
        }
        Host::Ipv4(ip) => Some(TargetHost::Ip(IpAddr::V4(ip))),
        Host::Ipv6(ip) => Some(TargetHost::Ip(IpAddr::V6(ip))),
    }
}

/// Receives the outcome of a resolution request.
///
/// Each `start_resolution`/`update_resolution` request produces at most one
/// call to exactly one of these methods.
pub trait ResolutionListener: Send + Sync {
    /// The resolver produced addresses. `service_config_error` is set when
    /// address lookup succeeded but the service config could not be obtained.
    fn on_successful_resolution(
        &self,
        addresses: Vec<Address>,
        service_config: Option<ServiceConfig>,
        service_config_error: Option<Status>,
    );

    /// Resolution failed entirely.
    fn on_error(&self, error: Status);
}

/// Watches a target and reports address and service config updates to its
/// listener.
pub trait Resolver: Send + Sync {
    /// Begins resolution. Delivers one outcome asynchronously.
    fn start_resolution(&self);

    /// Requests a re-resolution. A no-op while a request is in flight.
    fn update_resolution(&self);

    /// Stops the resolver; no further outcomes are delivered.
    fn destroy(&self);
}

/// Creates resolvers for parsed targets. The channel holds one factory; tests
/// substitute their own.
pub trait ResolverFactory: Send + Sync {
    fn create(&self, target: &Target, listener: Arc<dyn ResolutionListener>) -> Box<dyn Resolver>;
}
