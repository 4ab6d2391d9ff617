// Broker and lookup addresses, usable as map keys.
use std::fmt;

use crate::error::{Error, Result};

/// A `host:port` pair with structural equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `"host:port"`, or a bare `"host"` using `default_port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidArgument("empty host"));
        }
        match input.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(Error::InvalidArgument("empty host"));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidArgument("invalid port"))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(input, default_port)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
