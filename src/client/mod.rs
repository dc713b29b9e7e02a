//! The client-side channel runtime: name resolution, connection management,
//! load balancing, and per-call stream drivers.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub mod backoff;
pub mod call;
pub mod channel;
pub mod filter;
pub mod filters;
pub mod load_balancing;
pub mod name_resolution;
pub mod resolving_load_balancer;
pub mod service_config;
pub mod subchannel;
pub mod subchannel_pool;
pub mod transport;

/// The connectivity state of a channel or subchannel.
///
/// See <https://github.com/grpc/grpc/blob/master/doc/connectivity-semantics-and-api.md>.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "IDLE"),
            ConnectivityState::Connecting => write!(f, "CONNECTING"),
            ConnectivityState::Ready => write!(f, "READY"),
            ConnectivityState::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
            ConnectivityState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// A loosely typed channel option value, as supplied by callers.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    Int(i64),
    Str(String),
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_owned())
    }
}

/// The channel options recognized by this runtime. Unrecognized option keys
/// are ignored rather than rejected.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelOptions {
    /// Overrides the target name used for TLS host name verification, and is
    /// used as the SNI value on secure connections.
    pub ssl_target_name_override: Option<String>,
    /// A string prepended to the default user agent.
    pub primary_user_agent: Option<String>,
    /// A string appended to the default user agent.
    pub secondary_user_agent: Option<String>,
    /// Overrides the `:authority` derived from the target.
    pub default_authority: Option<String>,
    /// Interval between keepalive pings while calls are active. Unset means
    /// keepalive is disabled.
    pub keepalive_time: Option<Duration>,
    /// How long to wait for a keepalive ping acknowledgement before treating
    /// the connection as dead.
    pub keepalive_timeout: Option<Duration>,
    /// A JSON service config used when the resolver does not supply one.
    pub service_config_json: Option<String>,
}

impl ChannelOptions {
    /// Builds options from a loosely typed map, taking the recognized keys
    /// and silently skipping everything else.
    pub fn from_map(options: &HashMap<String, OptionValue>) -> ChannelOptions {
        let str_opt = |key: &str| match options.get(key) {
            Some(OptionValue::Str(s)) => Some(s.clone()),
            _ => None,
        };
        let ms_opt = |key: &str| match options.get(key) {
            Some(OptionValue::Int(ms)) if *ms > 0 => Some(Duration::from_millis(*ms as u64)),
            _ => None,
        };
        ChannelOptions {
            ssl_target_name_override: str_opt("ssl_target_name_override"),
            primary_user_agent: str_opt("primary_user_agent"),
            secondary_user_agent: str_opt("secondary_user_agent"),
            default_authority: str_opt("default_authority"),
            keepalive_time: ms_opt("keepalive_time_ms"),
            keepalive_timeout: ms_opt("keepalive_timeout_ms"),
            service_config_json: str_opt("service_config"),
        }
    }

    /// Composes the wire user agent: `<primary> grpc-x/<version> <secondary>`
    /// with empty parts dropped.
    pub fn user_agent(&self) -> String {
        let library = concat!("grpc-x/", env!("CARGO_PKG_VERSION"));
        [
            self.primary_user_agent.as_deref(),
            Some(library),
            self.secondary_user_agent.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// A stable rendering of the option set, used as part of the subchannel
    /// pool key so that channels with differing options do not share
    /// connections.
    pub(crate) fn fingerprint(&self) -> String {
        format!(
            "sni={:?};ua={:?}/{:?};auth={:?};ka={:?}/{:?}",
            self.ssl_target_name_override,
            self.primary_user_agent,
            self.secondary_user_agent,
            self.default_authority,
            self.keepalive_time,
            self.keepalive_timeout,
        )
    }
}
