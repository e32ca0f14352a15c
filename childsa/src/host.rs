//! Address/port pairs describing IKE endpoints and virtual IPs

use std::fmt;
use std::net::IpAddr;

use serde::Deserialize;
use serde::Serialize;

/// One endpoint of the IKE_SA or a virtual IP assigned to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// IP address of the endpoint
    pub addr: IpAddr,
    /// UDP port the endpoint exchanges IKE traffic on
    pub port: u16,
}

impl Host {
    /// Construct a host from address and port
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}
