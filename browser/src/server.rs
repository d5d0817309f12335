//! Per-server record: cached info, cached status and the request cycle state

use crate::connection::ServerConnection;
use crate::filter::Filter;
use log::{debug, warn};
use serde::Serialize;
use shared::{
    decode_info_response, decode_status_response, gametype_label, strip_color_codes, Identity,
    Player,
};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::time::{Duration, Instant};

/// Where a record is within the current fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Idle,
    InfoRequested,
    StatusRequested,
    InfoReceived,
    StatusReceived,
    Closed,
}

/// Live state reported by `getstatus`
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub fields: HashMap<String, String>,
    pub players: Vec<Player>,
    pub updated_at: Instant,
}

/// Flattened view of a record for display and JSON output
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub address: String,
    pub hostname: String,
    pub map: String,
    pub gametype: String,
    pub players: Vec<Player>,
    pub info: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct ServerRecord {
    connection: ServerConnection,
    identity: Identity,
    info: HashMap<String, String>,
    info_updated_at: Option<Instant>,
    status: Option<ServerStatus>,
    state: RecordState,
}

impl ServerRecord {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        let connection = ServerConnection::new(ip, port);
        let identity = connection.identity();
        Self {
            connection,
            identity,
            info: HashMap::new(),
            info_updated_at: None,
            status: None,
            state: RecordState::Idle,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connection.set_timeout(timeout);
        self
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn address(&self) -> (&str, u16) {
        (self.connection.ip(), self.connection.port())
    }

    pub fn connection(&self) -> &ServerConnection {
        &self.connection
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn info(&self) -> &HashMap<String, String> {
        &self.info
    }

    pub fn info_updated_at(&self) -> Option<Instant> {
        self.info_updated_at
    }

    pub fn status(&self) -> Option<&ServerStatus> {
        self.status.as_ref()
    }

    pub fn status_updated_at(&self) -> Option<Instant> {
        self.status.as_ref().map(|status| status.updated_at)
    }

    pub fn has_info(&self) -> bool {
        !self.info.is_empty()
    }

    pub fn has_status(&self) -> bool {
        self.has_info() && self.status.is_some()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.info.get("hostname").map(String::as_str)
    }

    pub fn map_name(&self) -> Option<&str> {
        self.info.get("mapname").map(String::as_str)
    }

    /// Gametype label such as `"CTF"`, empty when unknown
    pub fn gametype(&self) -> &'static str {
        self.info
            .get("gametype")
            .map_or("", |code| gametype_label(code))
    }

    pub fn players(&self) -> &[Player] {
        self.status
            .as_ref()
            .map(|status| status.players.as_slice())
            .unwrap_or(&[])
    }

    /// Replaces the info map; an empty map also drops the status
    pub fn update_info(&mut self, info: HashMap<String, String>, at: Instant) {
        self.info = info;
        self.info_updated_at = Some(at);
        if self.info.is_empty() {
            self.status = None;
        }
    }

    /// Stores a status snapshot; refused while there is no info
    pub fn update_status(
        &mut self,
        fields: HashMap<String, String>,
        players: Vec<Player>,
        at: Instant,
    ) -> bool {
        if !self.has_info() {
            return false;
        }
        self.status = Some(ServerStatus {
            fields,
            players,
            updated_at: at,
        });
        true
    }

    /// Opens a fresh socket and sends `getinfo`
    pub async fn request_info(&mut self) -> io::Result<()> {
        self.state = RecordState::InfoRequested;
        debug!("Requesting info from {}", self.connection);
        self.connection.request_info().await
    }

    /// Opens a fresh socket and sends `getstatus`
    pub async fn request_status(&mut self) -> io::Result<()> {
        if !self.has_info() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no info to attach a status to", self.connection),
            ));
        }
        self.state = RecordState::StatusRequested;
        debug!("Requesting status from {}", self.connection);
        self.connection.request_status().await
    }

    /// Absorbs whatever the socket holds as the info reply
    ///
    /// Meant to be called once the socket is known to be readable.
    pub fn read_info(&mut self) -> bool {
        let data = self.connection.receive_ready();
        self.absorb_info(data.as_deref())
    }

    /// Absorbs whatever the socket holds as the status reply
    pub fn read_status(&mut self) -> bool {
        let data = self.connection.receive_ready();
        self.absorb_status(data.as_deref())
    }

    /// Requests info and waits up to the connection timeout for the reply
    pub async fn fetch_info(&mut self) -> bool {
        if let Err(e) = self.request_info().await {
            debug!("Info request to {} failed: {}", self.connection, e);
            self.abandon_request();
            return false;
        }
        let data = self.connection.try_receive(self.connection.timeout()).await;
        self.absorb_info(data.as_deref())
    }

    /// Requests status and waits up to the connection timeout for the reply
    pub async fn fetch_status(&mut self) -> bool {
        if let Err(e) = self.request_status().await {
            debug!("Status request to {} failed: {}", self.connection, e);
            self.abandon_request();
            return false;
        }
        let data = self.connection.try_receive(self.connection.timeout()).await;
        self.absorb_status(data.as_deref())
    }

    fn absorb_info(&mut self, data: Option<&[u8]>) -> bool {
        if self.state != RecordState::InfoRequested {
            debug!("Ignoring info from {} in state {:?}", self.connection, self.state);
            return false;
        }

        let info = match decode_info_response(data.unwrap_or_default()) {
            Ok(info) => info,
            Err(e) => {
                warn!("Bad info response from {}: {}", self.connection, e);
                HashMap::new()
            }
        };
        self.update_info(info, Instant::now());
        self.state = RecordState::InfoReceived;
        self.has_info()
    }

    fn absorb_status(&mut self, data: Option<&[u8]>) -> bool {
        if self.state != RecordState::StatusRequested {
            debug!("Ignoring status from {} in state {:?}", self.connection, self.state);
            return false;
        }
        self.state = RecordState::StatusReceived;

        match decode_status_response(data.unwrap_or_default()) {
            Ok((fields, players)) if !fields.is_empty() || !players.is_empty() => {
                self.update_status(fields, players, Instant::now())
            }
            Ok(_) => {
                self.status = None;
                false
            }
            Err(e) => {
                warn!("Bad status response from {}: {}", self.connection, e);
                self.status = None;
                false
            }
        }
    }

    /// Strips colour codes from the stored hostname
    pub fn sanitize_hostname(&mut self) {
        if let Some(hostname) = self.info.get_mut("hostname") {
            *hostname = strip_color_codes(hostname);
        }
    }

    /// Decides whether this record belongs in the result set
    ///
    /// A record still waiting for its info reply counts as having no info.
    /// An empty filter accepts the record without touching its hostname.
    pub fn filter_info(&mut self, filter: &Filter) -> bool {
        if !self.has_info() || self.state == RecordState::InfoRequested {
            return false;
        }
        if filter.is_empty() {
            return true;
        }
        self.sanitize_hostname();
        filter.matches(&self.info)
    }

    /// Gives up on an unanswered request as if the reply had been empty
    ///
    /// Info left pending is cleared, a pending status is dropped. Records
    /// with nothing outstanding are left alone.
    pub fn abandon_request(&mut self) {
        match self.state {
            RecordState::InfoRequested => {
                debug!("No info reply from {}", self.connection);
                self.absorb_info(None);
            }
            RecordState::StatusRequested => {
                debug!("No status reply from {}", self.connection);
                self.absorb_status(None);
            }
            _ => {}
        }
    }

    /// Ends the cycle and releases the socket
    pub fn close(&mut self) {
        self.connection.close();
        self.state = RecordState::Closed;
    }

    /// Socket-less copy that a worker task can own
    pub fn detached(&self) -> Self {
        Self {
            connection: self.connection.detached(),
            identity: self.identity,
            info: self.info.clone(),
            info_updated_at: self.info_updated_at,
            status: self.status.clone(),
            state: self.state,
        }
    }

    /// Takes over the data gathered by a detached copy of this record
    pub fn merge(&mut self, other: ServerRecord) {
        if other.identity != self.identity {
            warn!("Refusing to merge {} into {}", other.connection, self.connection);
            return;
        }
        self.info = other.info;
        self.info_updated_at = other.info_updated_at;
        self.status = other.status;
        self.state = other.state;
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            address: self.connection.to_string(),
            hostname: self.hostname().map(strip_color_codes).unwrap_or_default(),
            map: self.map_name().unwrap_or_default().to_string(),
            gametype: self.gametype().to_string(),
            players: self.players().to_vec(),
            info: self
                .info
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}
