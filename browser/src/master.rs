//! Client for the master server's `getservers` query

use crate::connection::connect_udp;
use log::{debug, info, warn};
use shared::{
    decode_master_fragment, encode_master_query, DEFAULT_MASTER_ADDRESS, MASTER_FRAGMENT_THRESHOLD,
    MASTER_PORT, MAX_DATAGRAM,
};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterClient {
    address: String,
    port: u16,
}

impl Default for MasterClient {
    fn default() -> Self {
        Self::new(DEFAULT_MASTER_ADDRESS, MASTER_PORT)
    }
}

impl MasterClient {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Asks the master for every server speaking `protocol_version`
    ///
    /// Pairs come back in arrival order. An unreachable or silent master
    /// yields an empty list.
    pub async fn fetch(&self, protocol_version: u32, wait: Duration) -> Vec<(String, u16)> {
        match self.try_fetch(protocol_version, wait).await {
            Ok(servers) => servers,
            Err(e) => {
                warn!("Master server {} unavailable: {}", self, e);
                Vec::new()
            }
        }
    }

    /// Like [`fetch`](Self::fetch), but reports a master that could not be
    /// reached or never answered instead of treating it as an empty list
    pub async fn try_fetch(
        &self,
        protocol_version: u32,
        wait: Duration,
    ) -> io::Result<Vec<(String, u16)>> {
        let fragments = self.fetch_fragments(protocol_version, wait).await?;

        let mut servers = Vec::new();
        for (index, fragment) in fragments.iter().enumerate() {
            match decode_master_fragment(fragment) {
                Ok(mut list) => servers.append(&mut list),
                Err(e) => warn!("Skipping fragment {} from {}: {}", index, self, e),
            }
        }

        info!(
            "Master server {} listed {} servers in {} fragments",
            self,
            servers.len(),
            fragments.len()
        );
        Ok(servers)
    }

    /// Collects raw fragments until a short one arrives
    async fn fetch_fragments(
        &self,
        protocol_version: u32,
        wait: Duration,
    ) -> io::Result<Vec<Vec<u8>>> {
        debug!("Connecting to master server {} (timeout {:?})", self, wait);
        let socket = connect_udp(&self.address, self.port).await?;
        socket.send(&encode_master_query(protocol_version)).await?;

        let mut fragments = Vec::new();
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = match timeout(wait, socket.recv(&mut buffer)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) if fragments.is_empty() => return Err(e),
                Ok(Err(e)) => {
                    warn!("Master server {} stream cut short: {}", self, e);
                    break;
                }
                Err(_) if fragments.is_empty() => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reply within {:?}", wait),
                    ));
                }
                Err(_) => {
                    debug!("Master server {} went quiet after {} fragments", self, fragments.len());
                    break;
                }
            };

            debug!("Master fragment of {} bytes", len);
            fragments.push(buffer[..len].to_vec());
            if len < MASTER_FRAGMENT_THRESHOLD {
                break;
            }
        }
        Ok(fragments)
    }
}

impl fmt::Display for MasterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
