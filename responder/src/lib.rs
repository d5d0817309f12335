//! # Out-of-Band Responder
//!
//! A small UDP endpoint that speaks the server side of the out-of-band
//! protocol. It plays either a master server, answering `getservers` with a
//! fixed list, or a game server, answering `getinfo` and `getstatus` from a
//! fixed description.
//!
//! It exists so the browser can be exercised end to end on a single host:
//! the integration tests start one master and a handful of game servers on
//! `127.0.0.1` and point the browser at them. The `q3-responder` binary
//! runs the same thing from the command line for manual testing.
//!
//! Every query received is counted, which lets tests assert how often the
//! browser actually hit the network.

use log::{debug, info, warn};
use shared::{
    encode_info_response, encode_master_response, encode_status_response, Player, Request,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Description of the game server a responder pretends to be
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameServer {
    pub info: HashMap<String, String>,
    pub fields: HashMap<String, String>,
    pub players: Vec<Player>,
}

impl GameServer {
    pub fn new(hostname: &str, map: &str, gametype: &str) -> Self {
        let mut server = Self::default();
        server.info.insert("hostname".to_string(), hostname.to_string());
        server.info.insert("mapname".to_string(), map.to_string());
        server.info.insert("gametype".to_string(), gametype.to_string());
        server.info.insert("protocol".to_string(), PROTOCOL_VERSION.to_string());
        server.info.insert("clients".to_string(), "0".to_string());

        server.fields.insert("sv_hostname".to_string(), hostname.to_string());
        server.fields.insert("mapname".to_string(), map.to_string());
        server.fields.insert("g_gametype".to_string(), gametype.to_string());
        server
    }

    pub fn with_player(mut self, player: Player) -> Self {
        self.players.push(player);
        self.info
            .insert("clients".to_string(), self.players.len().to_string());
        self
    }

    /// Sets a variable in both the info and the status reply
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.info.insert(key.to_string(), value.to_string());
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    /// Info reply; real servers echo the challenge back
    pub fn info_reply(&self, challenge: &str) -> Vec<u8> {
        if challenge.is_empty() {
            return encode_info_response(&self.info);
        }
        let mut info = self.info.clone();
        info.insert("challenge".to_string(), challenge.to_string());
        encode_info_response(&info)
    }

    pub fn status_reply(&self) -> Vec<u8> {
        encode_status_response(&self.fields, &self.players)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    Master { servers: Vec<(Ipv4Addr, u16)> },
    Game(GameServer),
}

/// Counts of the queries a responder has seen
#[derive(Debug, Default)]
pub struct ResponderStats {
    master_queries: AtomicUsize,
    info_queries: AtomicUsize,
    status_queries: AtomicUsize,
    ignored: AtomicUsize,
}

impl ResponderStats {
    pub fn master_queries(&self) -> usize {
        self.master_queries.load(Ordering::Relaxed)
    }

    pub fn info_queries(&self) -> usize {
        self.info_queries.load(Ordering::Relaxed)
    }

    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::Relaxed)
    }

    /// Datagrams that were not a query this role answers
    pub fn ignored(&self) -> usize {
        self.ignored.load(Ordering::Relaxed)
    }

    fn record(&self, request: Option<&Request>) {
        let counter = match request {
            Some(Request::GetServers { .. }) => &self.master_queries,
            Some(Request::GetInfo { .. }) => &self.info_queries,
            Some(Request::GetStatus) => &self.status_queries,
            None => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Responder {
    socket: UdpSocket,
    role: Role,
    stats: Arc<ResponderStats>,
}

impl Responder {
    pub async fn bind(addr: &str, role: Role) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Responder listening on {}", socket.local_addr()?);

        Ok(Responder {
            socket,
            role,
            stats: Arc::new(ResponderStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn stats(&self) -> Arc<ResponderStats> {
        Arc::clone(&self.stats)
    }

    /// Datagrams to send back for `request`, empty when it goes unanswered
    pub fn replies(&self, request: &Request) -> Vec<Vec<u8>> {
        match (&self.role, request) {
            (Role::Master { servers }, Request::GetServers { protocol })
                if *protocol == PROTOCOL_VERSION =>
            {
                encode_master_response(servers)
            }
            (Role::Game(server), Request::GetInfo { challenge }) => {
                vec![server.info_reply(challenge)]
            }
            (Role::Game(server), Request::GetStatus) => vec![server.status_reply()],
            _ => Vec::new(),
        }
    }

    /// Answers queries until the socket fails for good
    pub async fn run(self) -> io::Result<()> {
        let mut buffer = [0u8; 2048];

        loop {
            let (len, addr) = match self.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("Peer went away: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let request = Request::parse(&buffer[..len]);
            let replies = match &request {
                Some(request) => self.replies(request),
                None => Vec::new(),
            };
            if replies.is_empty() {
                self.stats.record(None);
                debug!("Ignoring {} bytes from {}", len, addr);
                continue;
            }
            self.stats.record(request.as_ref());
            debug!("{:?} from {}, sending {} datagrams", request, addr, replies.len());

            for reply in replies {
                if let Err(e) = self.socket.send_to(&reply, addr).await {
                    warn!("Failed to reply to {}: {}", addr, e);
                    break;
                }
            }
        }
    }

    /// Runs the responder in the background
    pub fn spawn(self) -> JoinHandle<io::Result<()>> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{
        decode_info_response, decode_master_fragment, decode_status_response, encode_info_query,
        encode_master_query, encode_status_query,
    };
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    fn game() -> GameServer {
        GameServer::new("TestServer", "ut4_abbey", "4").with_player(Player::new("Alpha", 5, 42))
    }

    async fn ask(addr: SocketAddr, query: &[u8]) -> Option<Vec<u8>> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(query, addr).await.unwrap();
        let mut buffer = vec![0u8; 4096];
        match timeout(Duration::from_millis(300), socket.recv(&mut buffer)).await {
            Ok(Ok(len)) => Some(buffer[..len].to_vec()),
            _ => None,
        }
    }

    #[test]
    fn test_game_server_description() {
        let server = game();
        assert_eq!(server.info["clients"], "1");
        assert_eq!(server.info["protocol"], "68");
        assert_eq!(server.fields["sv_hostname"], "TestServer");

        let server = server.with_var("g_needpass", "0");
        assert_eq!(server.info["g_needpass"], "0");
        assert_eq!(server.fields["g_needpass"], "0");
    }

    #[test]
    fn test_info_reply_echoes_challenge() {
        let info = decode_info_response(&game().info_reply("xxx")).unwrap();
        assert_eq!(info["challenge"], "xxx");
        assert_eq!(info["hostname"], "TestServer");

        let info = decode_info_response(&game().info_reply("")).unwrap();
        assert!(!info.contains_key("challenge"));
    }

    #[tokio::test]
    async fn test_game_role_answers_info_and_status() {
        let responder = assert_ok!(Responder::bind("127.0.0.1:0", Role::Game(game())).await);
        let addr = responder.local_addr().unwrap();
        let stats = responder.stats();
        responder.spawn();

        let info = ask(addr, &encode_info_query()).await.unwrap();
        let info = decode_info_response(&info).unwrap();
        assert_eq!(info["gametype"], "4");

        let status = ask(addr, &encode_status_query()).await.unwrap();
        let (fields, players) = decode_status_response(&status).unwrap();
        assert_eq!(fields["mapname"], "ut4_abbey");
        assert_eq!(players, vec![Player::new("Alpha", 5, 42)]);

        assert!(ask(addr, &encode_master_query(68)).await.is_none());
        assert_eq!(stats.info_queries(), 1);
        assert_eq!(stats.status_queries(), 1);
        assert_eq!(stats.ignored(), 1);
    }

    #[tokio::test]
    async fn test_master_role_lists_servers() {
        let servers = vec![(Ipv4Addr::new(127, 0, 0, 1), 27960)];
        let responder = assert_ok!(Responder::bind("127.0.0.1:0", Role::Master { servers }).await);
        let addr = responder.local_addr().unwrap();
        let stats = responder.stats();
        responder.spawn();

        let reply = ask(addr, &encode_master_query(PROTOCOL_VERSION)).await.unwrap();
        assert_eq!(
            decode_master_fragment(&reply).unwrap(),
            vec![("127.0.0.1".to_string(), 27960)]
        );

        assert!(ask(addr, &encode_master_query(71)).await.is_none());
        assert!(ask(addr, b"garbage").await.is_none());
        assert_eq!(stats.master_queries(), 1);
        assert_eq!(stats.ignored(), 2);
    }
}
