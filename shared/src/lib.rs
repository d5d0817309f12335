//! Out-of-band wire protocol shared by the browser and the local responder
//!
//! Covers the three connectionless exchanges spoken by Quake3-derived engines
//! such as Urban Terror: `getservers` against the master, and `getinfo` /
//! `getstatus` against individual game servers. Everything here is pure
//! framing and parsing; sockets live in the `browser` and `responder` crates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Prefix of every connectionless datagram
pub const OOB_MARKER: [u8; 4] = [0xFF; 4];
/// Engine protocol version advertised in `getservers`
pub const PROTOCOL_VERSION: u32 = 68;
pub const MASTER_PORT: u16 = 27_900;
pub const DEFAULT_MASTER_ADDRESS: &str = "master.urbanterror.info";
/// The master sends fragments of at least this size while more are coming
pub const MASTER_FRAGMENT_THRESHOLD: usize = 1394;
pub const MAX_DATAGRAM: usize = 65_536;
pub const MAP_IMAGE_URL: &str = "https://www.urbanterror.info/files/static/images/levels/wide/";

pub const MASTER_RESPONSE_TAG: &str = "getserversResponse";
pub const INFO_RESPONSE_TAG: &str = "infoResponse";
pub const STATUS_RESPONSE_TAG: &str = "statusResponse";

/// Derived info key holding the map preview URL
pub const MAP_IMAGE_KEY: &str = "map_image_url";

const INFO_CHALLENGE: &str = "xxx";
const SEPARATOR: u8 = b'\\';
const MASTER_RECORD_LEN: usize = 7;
const MASTER_FULL_FRAGMENT_RECORDS: usize = 196;
const EOT_TRAILER: &[u8] = b"EOT\0\0\0";

const GAMETYPES: &[(&str, &str)] = &[
    ("0", "FFA"),
    ("1", "LMS"),
    ("3", "TDM"),
    ("4", "TS"),
    ("5", "FTL"),
    ("6", "CAH"),
    ("7", "CTF"),
    ("8", "BOMB"),
    ("9", "JMP"),
    ("10", "FREEZE"),
    ("11", "GUNGAME"),
];

/// Errors raised while decoding a response datagram
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("response truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("datagram does not start with the out-of-band marker")]
    MissingMarker,

    #[error("unexpected response tag, wanted {expected:?}")]
    UnexpectedTag { expected: &'static str },

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Stable identity of a game server, derived from `"<ip>:<port>"`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn new(ip: &str, port: u16) -> Self {
        let key = format!("{}:{}", ip, port);
        Identity(*blake3::hash(key.as_bytes()).as_bytes())
    }

    /// Rebuilds the identity of whoever sits behind a socket address
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(&addr.ip().to_string(), addr.port())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub frags: i32,
    pub ping: i32,
}

impl Player {
    pub fn new(name: impl Into<String>, frags: i32, ping: i32) -> Self {
        Self {
            name: name.into(),
            frags,
            ping,
        }
    }

    /// Parses a status line of the form `<frags> <ping> "<name>"`
    ///
    /// The name is everything after the ping, so names containing spaces
    /// survive. Surrounding quotes are stripped and escaped quotes unescaped.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (frags, rest) = next_token(line)
            .ok_or_else(|| ProtocolError::MalformedResponse("empty player line".to_string()))?;
        let (ping, rest) = next_token(rest).ok_or_else(|| {
            ProtocolError::MalformedResponse(format!("player line without ping: {:?}", line))
        })?;

        let name = rest.trim();
        if name.is_empty() {
            return Err(ProtocolError::MalformedResponse(format!(
                "player line without name: {:?}",
                line
            )));
        }
        let name = name.strip_prefix('"').unwrap_or(name);
        let name = name.strip_suffix('"').unwrap_or(name);

        Ok(Self {
            name: name.replace("\\\"", "\""),
            frags: parse_number(frags, "frags")?,
            ping: parse_number(ping, "ping")?,
        })
    }

    pub fn to_line(&self) -> String {
        format!("{} {} \"{}\"", self.frags, self.ping, self.name.replace('"', "\\\""))
    }
}

fn next_token(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    match text.find(char::is_whitespace) {
        Some(end) => Some((&text[..end], &text[end..])),
        None => Some((text, "")),
    }
}

fn parse_number(token: &str, what: &str) -> Result<i32, ProtocolError> {
    token
        .parse()
        .map_err(|_| ProtocolError::MalformedResponse(format!("invalid {} {:?}", what, token)))
}

/// Queries a responder may receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetServers { protocol: u32 },
    GetInfo { challenge: String },
    GetStatus,
}

impl Request {
    pub fn parse(bytes: &[u8]) -> Option<Request> {
        let command = bytes.strip_prefix(&OOB_MARKER[..])?;
        let command = String::from_utf8_lossy(command);
        let mut words = command.split_whitespace();

        match words.next()? {
            "getservers" => {
                let protocol = words.next()?.parse().ok()?;
                Some(Request::GetServers { protocol })
            }
            "getinfo" => Some(Request::GetInfo {
                challenge: words.next().unwrap_or_default().to_string(),
            }),
            "getstatus" => Some(Request::GetStatus),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::GetServers { protocol } => encode_master_query(*protocol),
            Request::GetInfo { challenge } => oob(&format!("getinfo {}", challenge)),
            Request::GetStatus => encode_status_query(),
        }
    }
}

fn oob(command: &str) -> Vec<u8> {
    let mut data = OOB_MARKER.to_vec();
    data.extend_from_slice(command.as_bytes());
    data
}

pub fn encode_master_query(protocol_version: u32) -> Vec<u8> {
    oob(&format!("getservers {} full empty", protocol_version))
}

pub fn encode_info_query() -> Vec<u8> {
    oob(&format!("getinfo {}", INFO_CHALLENGE))
}

pub fn encode_status_query() -> Vec<u8> {
    oob("getstatus")
}

fn strip_header<'a>(bytes: &'a [u8], tag: &'static str) -> Result<&'a [u8], ProtocolError> {
    let expected = OOB_MARKER.len() + tag.len();
    if bytes.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    if bytes[..OOB_MARKER.len()] != OOB_MARKER {
        return Err(ProtocolError::MissingMarker);
    }
    if &bytes[OOB_MARKER.len()..expected] != tag.as_bytes() {
        return Err(ProtocolError::UnexpectedTag { expected: tag });
    }
    Ok(&bytes[expected..])
}

/// Decodes one master datagram into `(ip, port)` pairs, in wire order
pub fn decode_master_fragment(bytes: &[u8]) -> Result<Vec<(String, u16)>, ProtocolError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    // The tag is followed by the separator that opens the first record.
    let body = strip_header(bytes, MASTER_RESPONSE_TAG)?;
    let mut body = body.get(1..).unwrap_or_default();

    let mut servers = Vec::with_capacity(body.len() / MASTER_RECORD_LEN);
    while body.len() >= MASTER_RECORD_LEN {
        if body.starts_with(EOT_TRAILER) {
            break;
        }
        let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
        let port = u16::from_be_bytes([body[4], body[5]]);
        servers.push((ip.to_string(), port));
        body = &body[MASTER_RECORD_LEN..];
    }
    Ok(servers)
}

/// Decodes an `infoResponse` into its key/value map
pub fn decode_info_response(bytes: &[u8]) -> Result<HashMap<String, String>, ProtocolError> {
    if bytes.is_empty() {
        return Ok(HashMap::new());
    }

    let body = strip_header(bytes, INFO_RESPONSE_TAG)?;
    let text = String::from_utf8_lossy(body);
    let text = text.trim_start_matches('\n').trim_end_matches('\n');

    let mut info = parse_key_values(text)?;
    if let Some(map) = info.get("mapname") {
        let url = map_image_url(map);
        info.insert(MAP_IMAGE_KEY.to_string(), url);
    }
    Ok(info)
}

/// Decodes a `statusResponse` into its server variables and player list
pub fn decode_status_response(
    bytes: &[u8],
) -> Result<(HashMap<String, String>, Vec<Player>), ProtocolError> {
    if bytes.is_empty() {
        return Ok((HashMap::new(), Vec::new()));
    }

    let body = strip_header(bytes, STATUS_RESPONSE_TAG)?;
    let text = String::from_utf8_lossy(body);
    let body = text.strip_prefix('\n').unwrap_or(&text[..]);
    let mut lines = body.split('\n');

    let fields = parse_key_values(lines.next().unwrap_or_default())?;
    let players = lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Player::parse)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((fields, players))
}

fn parse_key_values(line: &str) -> Result<HashMap<String, String>, ProtocolError> {
    let line = line.strip_prefix('\\').unwrap_or(line);
    if line.is_empty() {
        return Ok(HashMap::new());
    }

    let tokens: Vec<&str> = line.split('\\').collect();
    if tokens.len() % 2 != 0 {
        return Err(ProtocolError::MalformedResponse(format!(
            "odd number of key/value tokens ({})",
            tokens.len()
        )));
    }

    Ok(tokens
        .chunks(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect())
}

fn write_key_values(data: &mut Vec<u8>, values: &HashMap<String, String>) {
    // Sorted so that identical maps always produce identical datagrams
    let sorted: BTreeMap<_, _> = values.iter().collect();
    for (key, value) in sorted {
        data.push(SEPARATOR);
        data.extend_from_slice(key.as_bytes());
        data.push(SEPARATOR);
        data.extend_from_slice(value.as_bytes());
    }
}

/// Builds the datagrams a master sends for the given server list
///
/// Every fragment but the last is at least [`MASTER_FRAGMENT_THRESHOLD`]
/// bytes long. The last one is shorter and carries the `EOT` trailer when
/// it fits below the threshold.
pub fn encode_master_response(servers: &[(Ipv4Addr, u16)]) -> Vec<Vec<u8>> {
    let fragment = |records: &[(Ipv4Addr, u16)]| {
        let mut data = oob(MASTER_RESPONSE_TAG);
        data.push(SEPARATOR);
        for (ip, port) in records {
            data.extend_from_slice(&ip.octets());
            data.extend_from_slice(&port.to_be_bytes());
            data.push(SEPARATOR);
        }
        data
    };

    let mut fragments = Vec::new();
    let mut remaining = servers;
    while remaining.len() >= MASTER_FULL_FRAGMENT_RECORDS {
        let (chunk, rest) = remaining.split_at(MASTER_FULL_FRAGMENT_RECORDS);
        fragments.push(fragment(chunk));
        remaining = rest;
    }

    let mut last = fragment(remaining);
    if last.len() + EOT_TRAILER.len() < MASTER_FRAGMENT_THRESHOLD {
        last.extend_from_slice(EOT_TRAILER);
    }
    fragments.push(last);
    fragments
}

pub fn encode_info_response(info: &HashMap<String, String>) -> Vec<u8> {
    let mut data = oob(INFO_RESPONSE_TAG);
    data.push(b'\n');
    write_key_values(&mut data, info);
    data
}

pub fn encode_status_response(fields: &HashMap<String, String>, players: &[Player]) -> Vec<u8> {
    let mut data = oob(STATUS_RESPONSE_TAG);
    data.push(b'\n');
    write_key_values(&mut data, fields);
    data.push(b'\n');
    for player in players {
        data.extend_from_slice(player.to_line().as_bytes());
        data.push(b'\n');
    }
    data
}

pub fn map_image_url(map_name: &str) -> String {
    format!("{}{}.jpg", MAP_IMAGE_URL, map_name)
}

/// Removes `^<digit>` colour sequences from a display name
pub fn strip_color_codes(text: &str) -> String {
    let mut clean = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '^' && chars.peek().map_or(false, |next| next.is_ascii_digit()) {
            chars.next();
            continue;
        }
        clean.push(c);
    }
    clean
}

/// Short label for a numeric gametype code, empty when unknown
pub fn gametype_label(code: &str) -> &'static str {
    GAMETYPES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, label)| *label)
        .unwrap_or("")
}
