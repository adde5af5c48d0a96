//! Outbound proxies used by crawl sessions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::errors::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

impl ProxyKind {
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

impl FromStr for ProxyKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" => Ok(Self::Socks5),
            other => Err(TaskError::precondition(format!("unsupported proxy type '{other}'"))),
        }
    }
}

/// How the selector picks among active proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStrategy {
    #[default]
    RoundRobin,
    Random,
    /// Always the oldest active proxy; deactivated proxies fall through to the next one.
    Failover,
}

impl ProxyStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Failover => "failover",
        }
    }
}

impl FromStr for ProxyStrategy {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "failover" => Ok(Self::Failover),
            other => Err(TaskError::precondition(format!("unknown proxy strategy '{other}'"))),
        }
    }
}

impl fmt::Display for ProxyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
    pub kind: ProxyKind,
    /// `host:port`, unique across the pool.
    pub address: String,
    pub active: bool,
    pub strategy: ProxyStrategy,
}

impl Proxy {
    pub fn url(&self) -> String {
        format!("{}://{}", self.kind.scheme(), self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProxy {
    pub kind: ProxyKind,
    pub address: String,
    pub strategy: ProxyStrategy,
}
