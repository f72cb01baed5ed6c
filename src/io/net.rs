use std::fmt::Display;
use std::str::FromStr;

use anyhow::bail;

pub const DEFAULT_PORT: Port = 6379;

pub type Port = u16;
pub type Hostname = String;

/// A `host:port` pair identifying one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding(pub Hostname, pub Port);

impl Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

impl FromStr for Binding {
    type Err = anyhow::Error;

    /// Accepts both `"host port"` and `"host:port"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = s.split_once(' ').or_else(|| s.rsplit_once(':')) else {
            bail!("invalid binding: {}", s);
        };
        if host.is_empty() {
            bail!("invalid binding: {}", s);
        }
        Ok(Binding(host.to_string(), port.parse::<Port>()?))
    }
}
