//! TCP port probing.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use super::PortProbe;

/// Probes by binding the wildcard address, then falls back to a loopback
/// connect so ports bound only on loopback by another user still count.
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    connect_timeout: Duration,
}

impl TcpPortProbe {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_millis(250),
        }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProbe for TcpPortProbe {
    fn in_use(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => {
                drop(listener);
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                TcpStream::connect_timeout(&addr, self.connect_timeout).is_ok()
            }
            Err(_) => true,
        }
    }
}
