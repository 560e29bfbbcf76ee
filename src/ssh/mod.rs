use log::debug;
use std::net::SocketAddr;
use tokio::net::lookup_host;

mod pool;

pub use pool::{SshClientError, SshPool};

/// Everything needed to open one SSH session, including an optional
/// jump host to chain through.
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    pub host_name: String,
    pub address: SocketAddr,
    pub port: u16,
    pub login: String,
    pub jump_via: Option<i32>,
}

impl ConnectionDetails {
    pub async fn new(
        host_name: String,
        address: String,
        port: u16,
        login: String,
        jump_via: Option<i32>,
    ) -> Result<Self, SshClientError> {
        let lookup = format!("{address}:{port}");
        debug!("{host_name}: Trying to resolve address {lookup}");
        match lookup_host(lookup.clone()).await {
            Ok(mut socket) => {
                let resolved_addr = socket.next().ok_or(SshClientError::LookupFailure)?;
                debug!("{host_name}: Resolved {lookup} to {resolved_addr}");

                Ok(Self {
                    host_name,
                    address: resolved_addr,
                    port,
                    login,
                    jump_via,
                })
            }
            Err(e) => {
                debug!("{host_name}: Lookup failed: {e}");
                Err(SshClientError::LookupFailure)
            }
        }
    }

    pub fn log_connection(&self) {
        match self.jump_via {
            Some(jumphost) => {
                debug!(
                    "{}: Connection attempt to {} via server {} as {}",
                    self.host_name, self.address, jumphost, self.login
                );
            }
            None => debug!(
                "{}: Connection attempt to {} as {}",
                self.host_name, self.address, self.login
            ),
        }
    }

    pub fn log_channel_open(&self, target: &SocketAddr) {
        debug!("{}: Trying to open jump channel to {target}", self.host_name);
    }
}
