//! Multiplexed readiness polling over many outstanding UDP requests
//!
//! Instead of one blocking wait per server, each round performs a single
//! readiness wait across every socket that has not answered yet. Ready
//! sockets are mapped back to their record through the identity of the peer
//! the socket is connected to, so replies may arrive in any order.
//!
//! The run ends when every socket has answered, when too many consecutive
//! rounds came back empty, or after as many rounds as there are sockets.

use crate::server::ServerRecord;
use log::{debug, info};
use shared::Identity;
use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;
use tokio::time::timeout;

pub const DEFAULT_MAX_EMPTY_ROUNDS: u32 = 2;
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a polling run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AllCompleted,
    RetriesExhausted,
    RoundLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// Identities whose socket became ready, in completion order
    pub answered: Vec<Identity>,
    pub rounds: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingEngine {
    max_consecutive_empty_rounds: u32,
    round_timeout: Duration,
}

impl Default for PollingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ROUND_TIMEOUT)
    }
}

impl PollingEngine {
    pub fn new(round_timeout: Duration) -> Self {
        Self {
            max_consecutive_empty_rounds: DEFAULT_MAX_EMPTY_ROUNDS,
            round_timeout,
        }
    }

    pub fn with_max_empty_rounds(mut self, rounds: u32) -> Self {
        self.max_consecutive_empty_rounds = rounds;
        self
    }

    pub fn round_timeout(&self) -> Duration {
        self.round_timeout
    }

    pub fn max_consecutive_empty_rounds(&self) -> u32 {
        self.max_consecutive_empty_rounds
    }

    /// Waits for replies on the open sockets of `records`
    ///
    /// `on_ready` runs exactly once for every record whose socket becomes
    /// readable. Records without an open socket are skipped, as are later
    /// records connected to a peer that is already being waited on.
    pub async fn run<'a, I, F>(&self, records: I, mut on_ready: F) -> PollReport
    where
        I: IntoIterator<Item = &'a mut ServerRecord>,
        F: FnMut(&mut ServerRecord),
    {
        let mut pending: HashMap<Identity, &'a mut ServerRecord> = HashMap::new();
        for record in records {
            match record.connection().peer_identity() {
                Some(identity) if pending.contains_key(&identity) => {
                    debug!("Already waiting on {}, skipping duplicate", record.connection());
                }
                Some(identity) => {
                    pending.insert(identity, record);
                }
                None => {
                    debug!("{} has no open socket, skipping", record.connection());
                }
            }
        }

        let total = pending.len();
        let mut answered = Vec::with_capacity(total);
        let mut rounds = 0;
        let mut empty_rounds = 0;

        for _ in 0..total {
            if pending.is_empty() || empty_rounds >= self.max_consecutive_empty_rounds {
                break;
            }
            rounds += 1;

            let ready = timeout(self.round_timeout, wait_readable(&pending))
                .await
                .unwrap_or_default();

            if ready.is_empty() {
                empty_rounds += 1;
                info!("Retry n {}", empty_rounds);
                continue;
            }

            empty_rounds = 0;
            for identity in ready {
                if let Some(record) = pending.remove(&identity) {
                    on_ready(record);
                    answered.push(identity);
                }
            }
        }

        let termination = if pending.is_empty() {
            Termination::AllCompleted
        } else if empty_rounds >= self.max_consecutive_empty_rounds {
            Termination::RetriesExhausted
        } else {
            Termination::RoundLimit
        };
        debug!(
            "Polling finished after {} rounds: {}/{} answered ({:?})",
            rounds,
            answered.len(),
            total,
            termination
        );

        PollReport {
            answered,
            rounds,
            termination,
        }
    }
}

/// Resolves once at least one pending socket is readable
///
/// Every socket is polled on each wakeup so that all of them register
/// interest, and each ready one is reported by its peer identity.
async fn wait_readable(pending: &HashMap<Identity, &mut ServerRecord>) -> Vec<Identity> {
    poll_fn(|cx| {
        let mut ready = Vec::new();
        for record in pending.values() {
            let Some(socket) = record.connection().socket() else {
                continue;
            };
            if socket.poll_recv_ready(cx).is_ready() {
                if let Ok(peer) = socket.peer_addr() {
                    ready.push(Identity::from_addr(peer));
                }
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    })
    .await
}
