//! # Server Browser Library
//!
//! This library discovers Quake3 / Urban Terror game servers through the
//! master server and polls each of them over the connectionless
//! out-of-band UDP protocol, producing a filterable, cached roster suitable
//! for a server browser.
//!
//! ## Core Responsibilities
//!
//! ### Discovery
//! The master server answers a single `getservers` query with one or more
//! datagrams listing `(ip, port)` pairs. Fragments are collected until a
//! short one arrives, then decoded in order.
//!
//! ### Polling
//! Every server is asked for its `getinfo` reply and, when it passes the
//! filter, for its `getstatus` reply with the player list. Hundreds of
//! requests are in flight at the same time and replies are matched back to
//! the server that sent them by the peer address of the socket they
//! arrived on.
//!
//! ### Caching
//! Master lists, info maps and status snapshots each carry a timestamp and
//! are reused until their time to live runs out, so repeated fetches only
//! touch the network for what is stale.
//!
//! ## Architecture Design
//!
//! ### One Socket Per Request Phase
//! Each server gets a fresh UDP socket connected to it for every request
//! phase. A connected socket only delivers datagrams from its peer, which
//! makes the peer address a reliable key for the reply.
//!
//! ### Two Concurrency Modes
//! - **Multiplexed** (default): a single task waits on all outstanding
//!   sockets at once, one readiness wait per round, giving up after a
//!   number of consecutive silent rounds.
//! - **Per-server tasks**: one tokio task per server, bounded by a
//!   semaphore, each running its own request and wait cycle on a detached
//!   copy of the record that is merged back when the task finishes.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! One UDP socket connected to one server: open, send, non-blocking and
//! timed receives.
//!
//! ### Server Module (`server`)
//! Per-server record with its cached info, status and request cycle state.
//!
//! ### Filter Module (`filter`)
//! Case-insensitive `key => pattern` criteria matched against info maps.
//!
//! ### Polling Module (`polling`)
//! The readiness-driven engine shared by the info and status phases.
//!
//! ### Master Module (`master`)
//! The `getservers` client.
//!
//! ### Registry Module (`registry`)
//! The roster of servers and favorites plus the full fetch pipeline.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use browser::{ConcurrencyMode, Filter, Registry, RegistryConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RegistryConfig::default().with_timeout(Duration::from_millis(800));
//!     let mut registry = Registry::new(config);
//!     registry.add_favorite("127.0.0.1", 27960);
//!
//!     let filter = Filter::new().with("gametype", "4");
//!     for server in registry.fetch(&filter, ConcurrencyMode::Multiplexed).await {
//!         println!("{} {}", server.connection(), server.hostname().unwrap_or_default());
//!     }
//! }
//! ```

pub mod connection;
pub mod filter;
pub mod master;
pub mod polling;
pub mod registry;
pub mod server;

pub use connection::ServerConnection;
pub use filter::Filter;
pub use master::MasterClient;
pub use polling::{PollReport, PollingEngine, Termination};
pub use registry::{ConcurrencyMode, Registry, RegistryConfig};
pub use server::{RecordState, ServerRecord, ServerStatus, ServerSummary};
