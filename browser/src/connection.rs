//! UDP connection to a single game server
//!
//! A connection owns at most one socket at a time. Every request phase opens
//! a fresh socket connected to the server, so replies from an earlier phase
//! can never be mistaken for the current one.

use log::debug;
use shared::{encode_info_query, encode_status_query, Identity, MAX_DATAGRAM};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Binds an ephemeral socket of the peer's address family and connects it
pub(crate) async fn connect_udp(host: &str, port: u16) -> io::Result<UdpSocket> {
    let peer = lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {}:{}", host, port),
        )
    })?;
    let local = match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

pub struct ServerConnection {
    ip: String,
    port: u16,
    timeout: Duration,
    socket: Option<UdpSocket>,
}

impl ServerConnection {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            socket: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Identity of the configured address
    pub fn identity(&self) -> Identity {
        Identity::new(&self.ip, self.port)
    }

    /// Identity rebuilt from the address the socket is connected to
    ///
    /// Differs from [`identity`](Self::identity) only when the server was
    /// configured by host name.
    pub fn peer_identity(&self) -> Option<Identity> {
        let socket = self.socket.as_ref()?;
        socket.peer_addr().ok().map(Identity::from_addr)
    }

    pub fn socket(&self) -> Option<&UdpSocket> {
        self.socket.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Replaces any previous socket with a new one connected to the server
    pub async fn open(&mut self) -> io::Result<()> {
        self.close();
        self.socket = Some(connect_udp(&self.ip, self.port).await?);
        Ok(())
    }

    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, format!("{} is not open", self))
        })?;
        socket.send(data).await?;
        Ok(())
    }

    pub async fn request_info(&mut self) -> io::Result<()> {
        self.open().await?;
        self.send(&encode_info_query()).await
    }

    pub async fn request_status(&mut self) -> io::Result<()> {
        self.open().await?;
        self.send(&encode_status_query()).await
    }

    /// Performs one non-blocking receive
    ///
    /// Returns `None` when nothing is queued or the socket reports an error.
    /// Refused and unreachable peers end up here: a server listed by the
    /// master may have gone away since.
    pub fn receive_ready(&self) -> Option<Vec<u8>> {
        let socket = self.socket.as_ref()?;
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        match socket.try_recv(&mut buffer) {
            Ok(len) => {
                buffer.truncate(len);
                Some(buffer)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                debug!("Receive from {} failed: {}", self, e);
                None
            }
        }
    }

    /// Waits up to `wait` for the socket to become readable, then receives once
    pub async fn try_receive(&self, wait: Duration) -> Option<Vec<u8>> {
        let socket = self.socket.as_ref()?;

        match timeout(wait, socket.readable()).await {
            Ok(Ok(())) => self.receive_ready(),
            Ok(Err(e)) => {
                debug!("Readiness wait on {} failed: {}", self, e);
                None
            }
            Err(_) => {
                debug!("No reply from {} within {:?}", self, wait);
                None
            }
        }
    }

    /// Releases the socket; harmless when already closed
    pub fn close(&mut self) {
        self.socket = None;
    }

    /// Same address and timeout, without a socket
    pub fn detached(&self) -> Self {
        Self {
            ip: self.ip.clone(),
            port: self.port,
            timeout: self.timeout,
            socket: None,
        }
    }
}

impl fmt::Display for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("address", &format_args!("{}:{}", self.ip, self.port))
            .field("timeout", &self.timeout)
            .field("open", &self.is_open())
            .finish()
    }
}
