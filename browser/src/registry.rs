//! Server roster: master discovery, favorites, caching and the fetch pipeline

use crate::filter::Filter;
use crate::master::MasterClient;
use crate::polling::PollingEngine;
use crate::server::ServerRecord;
use log::{debug, info, warn};
use shared::{Identity, DEFAULT_MASTER_ADDRESS, MASTER_PORT, PROTOCOL_VERSION};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DEFAULT_MASTER_CACHE: Duration = Duration::from_secs(600);
pub const DEFAULT_INFO_CACHE: Duration = Duration::from_secs(60);
pub const DEFAULT_WORKER_LIMIT: usize = 64;

/// How the per-server request cycles are driven
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// One task waits on every socket of a phase at once
    #[default]
    Multiplexed,
    /// One task per server, each doing its own blocking-style waits
    PerServerTask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub cache: bool,
    pub master_cache: Duration,
    /// Lifetime of both info and status snapshots
    pub info_cache: Duration,
    /// Socket timeout, also the length of one polling round
    pub timeout: Duration,
    pub favorites_only: bool,
    pub master_address: String,
    pub master_port: u16,
    pub protocol_version: u32,
    pub max_empty_rounds: u32,
    pub worker_limit: usize,
    /// Drop master entries that repeat an already known server
    pub deduplicate: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache: true,
            master_cache: DEFAULT_MASTER_CACHE,
            info_cache: DEFAULT_INFO_CACHE,
            timeout: Duration::from_secs(1),
            favorites_only: false,
            master_address: DEFAULT_MASTER_ADDRESS.to_string(),
            master_port: MASTER_PORT,
            protocol_version: PROTOCOL_VERSION,
            max_empty_rounds: crate::polling::DEFAULT_MAX_EMPTY_ROUNDS,
            worker_limit: DEFAULT_WORKER_LIMIT,
            deduplicate: true,
        }
    }
}

impl RegistryConfig {
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_master_cache(mut self, ttl: Duration) -> Self {
        self.master_cache = ttl;
        self
    }

    pub fn with_info_cache(mut self, ttl: Duration) -> Self {
        self.info_cache = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_favorites_only(mut self, favorites_only: bool) -> Self {
        self.favorites_only = favorites_only;
        self
    }

    pub fn with_master(mut self, address: impl Into<String>, port: u16) -> Self {
        self.master_address = address.into();
        self.master_port = port;
        self
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_max_empty_rounds(mut self, rounds: u32) -> Self {
        self.max_empty_rounds = rounds;
        self
    }

    pub fn with_worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = limit;
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn master_outdated(&self, fetched_at: Option<Instant>, now: Instant) -> bool {
        match fetched_at {
            Some(at) => now.saturating_duration_since(at) > self.master_cache,
            None => true,
        }
    }

    /// Whether the record's info can be served without asking the server
    pub fn info_fresh(&self, record: &ServerRecord, now: Instant) -> bool {
        self.cache
            && record.has_info()
            && record
                .info_updated_at()
                .map_or(false, |at| now.saturating_duration_since(at) <= self.info_cache)
    }

    pub fn status_fresh(&self, record: &ServerRecord, now: Instant) -> bool {
        self.cache
            && record.has_status()
            && record
                .status_updated_at()
                .map_or(false, |at| now.saturating_duration_since(at) <= self.info_cache)
    }

    fn engine(&self) -> PollingEngine {
        PollingEngine::new(self.timeout).with_max_empty_rounds(self.max_empty_rounds)
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    config: RegistryConfig,
    servers: Vec<ServerRecord>,
    favorites: Vec<Identity>,
    master_fetched_at: Option<Instant>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            servers: Vec::new(),
            favorites: Vec::new(),
            master_fetched_at: None,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn servers(&self) -> &[ServerRecord] {
        &self.servers
    }

    pub fn favorites(&self) -> &[Identity] {
        &self.favorites
    }

    pub fn master_fetched_at(&self) -> Option<Instant> {
        self.master_fetched_at
    }

    /// Appends a record, refusing a repeated identity when deduplicating
    pub fn add_server(&mut self, record: ServerRecord) -> bool {
        let identity = record.identity();
        if self.config.deduplicate && self.servers.iter().any(|s| s.identity() == identity) {
            return false;
        }
        self.servers.push(record.with_timeout(self.config.timeout));
        true
    }

    /// Marks a server as always retained, adding it to the roster
    pub fn add_favorite(&mut self, ip: impl Into<String>, port: u16) {
        let record = ServerRecord::new(ip, port);
        let identity = record.identity();
        if !self.favorites.contains(&identity) {
            self.favorites.push(identity);
        }
        self.add_server(record);
    }

    pub fn is_favorite(&self, record: &ServerRecord) -> bool {
        self.favorites.contains(&record.identity())
    }

    /// Runs the full discovery and polling pipeline
    ///
    /// Returns the records that answered with info matching `filter`, in
    /// roster order. Servers that stay silent are left out but remain in the
    /// roster for the next call.
    pub async fn fetch(&mut self, filter: &Filter, mode: ConcurrencyMode) -> Vec<&ServerRecord> {
        if !self.config.favorites_only
            && self.config.master_outdated(self.master_fetched_at, Instant::now())
        {
            self.refresh_from_master().await;
        }

        let selected = match mode {
            ConcurrencyMode::Multiplexed => self.poll_multiplexed(filter).await,
            ConcurrencyMode::PerServerTask => self.poll_per_server(filter).await,
        };

        for record in self.servers.iter_mut() {
            record.close();
        }
        info!(
            "{} of {} servers matched the filter",
            selected.len(),
            self.servers.len()
        );

        selected.into_iter().map(|index| &self.servers[index]).collect()
    }

    /// Replaces the non-favorite part of the roster with the master's list
    ///
    /// The fetch is stamped whatever the outcome, so a failing master is
    /// only retried once the master cache expires. When the master cannot
    /// be reached at all the current roster is left as it is.
    async fn refresh_from_master(&mut self) {
        let master = MasterClient::new(self.config.master_address.clone(), self.config.master_port);
        let result = master
            .try_fetch(self.config.protocol_version, self.config.timeout)
            .await;
        self.master_fetched_at = Some(Instant::now());

        let discovered = match result {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!(
                    "Master server {} unavailable, keeping {} known servers: {}",
                    master,
                    self.servers.len(),
                    e
                );
                return;
            }
        };

        let favorites = &self.favorites;
        self.servers.retain(|record| favorites.contains(&record.identity()));

        let mut known: HashSet<Identity> = self.servers.iter().map(ServerRecord::identity).collect();
        for (ip, port) in discovered {
            let record = ServerRecord::new(ip, port).with_timeout(self.config.timeout);
            if self.config.deduplicate && !known.insert(record.identity()) {
                debug!("Skipping duplicate master entry {}", record.connection());
                continue;
            }
            self.servers.push(record);
        }

        info!("Roster now holds {} servers", self.servers.len());
    }

    /// Info and status phases, each as a single polling run
    async fn poll_multiplexed(&mut self, filter: &Filter) -> Vec<usize> {
        let engine = self.config.engine();

        let now = Instant::now();
        let stale: Vec<bool> = self
            .servers
            .iter()
            .map(|record| !self.config.info_fresh(record, now))
            .collect();
        info!(
            "Reading info from {} servers ({} cached)",
            stale.iter().filter(|s| **s).count(),
            stale.iter().filter(|s| !**s).count()
        );

        for (record, _) in self.servers.iter_mut().zip(&stale).filter(|(_, s)| **s) {
            if let Err(e) = record.request_info().await {
                debug!("Info request to {} failed: {}", record.connection(), e);
            }
        }
        let pending = self.servers.iter_mut().zip(&stale).filter(|(_, s)| **s);
        let report = engine
            .run(pending.map(|(record, _)| record), |record| {
                record.read_info();
            })
            .await;
        debug!(
            "Info phase: {} answered in {} rounds ({:?})",
            report.answered.len(),
            report.rounds,
            report.termination
        );
        for (record, _) in self.servers.iter_mut().zip(&stale).filter(|(_, s)| **s) {
            record.abandon_request();
        }

        let selected: Vec<usize> = (0..self.servers.len())
            .filter(|&index| self.servers[index].filter_info(filter))
            .collect();

        let now = Instant::now();
        let mut wanted = vec![false; self.servers.len()];
        for &index in &selected {
            let record = &mut self.servers[index];
            if self.config.status_fresh(record, now) {
                continue;
            }
            match record.request_status().await {
                Ok(()) => wanted[index] = true,
                Err(e) => debug!("Status request to {} failed: {}", record.connection(), e),
            }
        }
        info!(
            "Reading status from {} servers",
            wanted.iter().filter(|w| **w).count()
        );

        let pending = self.servers.iter_mut().zip(&wanted).filter(|(_, w)| **w);
        let report = engine
            .run(pending.map(|(record, _)| record), |record| {
                record.read_status();
            })
            .await;
        debug!(
            "Status phase: {} answered in {} rounds ({:?})",
            report.answered.len(),
            report.rounds,
            report.termination
        );
        for (record, _) in self.servers.iter_mut().zip(&wanted).filter(|(_, w)| **w) {
            record.abandon_request();
        }

        selected
    }

    /// One worker task per server that needs network work
    async fn poll_per_server(&mut self, filter: &Filter) -> Vec<usize> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_limit.max(1)));
        let mut tasks = JoinSet::new();

        let now = Instant::now();
        for (index, record) in self.servers.iter().enumerate() {
            let info_fresh = self.config.info_fresh(record, now);
            let status_fresh = self.config.status_fresh(record, now);
            if info_fresh && status_fresh {
                debug!("{} served from cache", record.connection());
                continue;
            }

            let mut worker = record.detached();
            let filter = filter.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if !info_fresh {
                    worker.fetch_info().await;
                }
                if worker.filter_info(&filter) && !status_fresh {
                    worker.fetch_status().await;
                }
                worker.close();
                (index, worker)
            });
        }
        info!("Waiting on {} server tasks", tasks.len());

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((index, worker)) => self.servers[index].merge(worker),
                Err(e) => warn!("Server task failed: {}", e),
            }
        }

        (0..self.servers.len())
            .filter(|&index| self.servers[index].filter_info(filter))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RecordState;
    use shared::Player;
    use std::collections::HashMap;
    use tokio::net::UdpSocket;

    fn info(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert!(config.cache);
        assert_eq!(config.master_cache, Duration::from_secs(600));
        assert_eq!(config.info_cache, Duration::from_secs(60));
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.master_port, 27900);
        assert_eq!(config.protocol_version, 68);
        assert_eq!(config.max_empty_rounds, 2);
        assert!(config.deduplicate);
        assert_eq!(ConcurrencyMode::default(), ConcurrencyMode::Multiplexed);
    }

    #[test]
    fn test_info_freshness_window() {
        let config = RegistryConfig::default();
        let start = Instant::now();
        let mut record = ServerRecord::new("10.0.0.1", 27960);
        assert!(!config.info_fresh(&record, start));

        record.update_info(info(&[("hostname", "x")]), start);
        assert!(config.info_fresh(&record, start + Duration::from_secs(30)));
        assert!(!config.info_fresh(&record, start + Duration::from_secs(90)));

        let uncached = config.clone().with_cache(false);
        assert!(!uncached.info_fresh(&record, start));
    }

    #[test]
    fn test_status_freshness_window() {
        let config = RegistryConfig::default();
        let start = Instant::now();
        let mut record = ServerRecord::new("10.0.0.1", 27960);
        record.update_info(info(&[("hostname", "x")]), start);
        assert!(!config.status_fresh(&record, start));

        record.update_status(HashMap::new(), vec![Player::new("a", 0, 0)], start);
        assert!(config.status_fresh(&record, start + Duration::from_secs(30)));
        assert!(!config.status_fresh(&record, start + Duration::from_secs(90)));
    }

    #[test]
    fn test_master_outdated() {
        let config = RegistryConfig::default();
        let start = Instant::now();
        assert!(config.master_outdated(None, start));
        assert!(!config.master_outdated(Some(start), start + Duration::from_secs(599)));
        assert!(config.master_outdated(Some(start), start + Duration::from_secs(601)));
    }

    #[test]
    fn test_favorites() {
        let mut registry = Registry::default();
        registry.add_favorite("10.0.0.1", 27960);
        registry.add_favorite("10.0.0.1", 27960);
        assert_eq!(registry.favorites().len(), 1);
        assert_eq!(registry.servers().len(), 1);
        assert!(registry.is_favorite(&registry.servers()[0]));
        assert!(!registry.is_favorite(&ServerRecord::new("10.0.0.1", 27961)));

        assert!(registry.add_server(ServerRecord::new("10.0.0.2", 27960)));
        assert!(!registry.add_server(ServerRecord::new("10.0.0.2", 27960)));
        assert_eq!(registry.servers().len(), 2);
    }

    #[test]
    fn test_add_server_without_deduplication() {
        let mut registry = Registry::new(RegistryConfig::default().with_deduplicate(false));
        assert!(registry.add_server(ServerRecord::new("10.0.0.2", 27960)));
        assert!(registry.add_server(ServerRecord::new("10.0.0.2", 27960)));
        assert_eq!(registry.servers().len(), 2);
    }

    #[tokio::test]
    async fn test_favorites_only_skips_master() {
        let config = RegistryConfig::default()
            .with_favorites_only(true)
            .with_timeout(Duration::from_millis(20));
        let mut registry = Registry::new(config);

        let start = Instant::now();
        let found = registry.fetch(&Filter::new(), ConcurrencyMode::Multiplexed).await;
        assert!(found.is_empty());
        assert!(registry.master_fetched_at().is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_silent_master_keeps_roster() {
        let master = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let config = RegistryConfig::default()
            .with_master("127.0.0.1", master.local_addr().unwrap().port())
            .with_timeout(Duration::from_millis(50));
        let mut registry = Registry::new(config);
        registry.add_favorite("127.0.0.1", game.local_addr().unwrap().port());

        let found = registry.fetch(&Filter::new(), ConcurrencyMode::Multiplexed).await;
        assert!(found.is_empty());
        assert_eq!(registry.servers().len(), 1);
        let stamped = registry.master_fetched_at();
        assert!(stamped.is_some());

        let found = registry.fetch(&Filter::new(), ConcurrencyMode::PerServerTask).await;
        assert!(found.is_empty());
        assert_eq!(registry.servers().len(), 1);
        assert_eq!(registry.master_fetched_at(), stamped);
    }

    #[tokio::test]
    async fn test_silent_server_loses_expired_info() {
        let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = game.local_addr().unwrap().port();

        for mode in [ConcurrencyMode::Multiplexed, ConcurrencyMode::PerServerTask] {
            let config = RegistryConfig::default()
                .with_favorites_only(true)
                .with_info_cache(Duration::ZERO)
                .with_timeout(Duration::from_millis(50))
                .with_max_empty_rounds(1);
            let mut registry = Registry::new(config);
            registry.add_favorite("127.0.0.1", port);
            registry.servers[0].update_info(info(&[("hostname", "old")]), Instant::now());
            tokio::time::sleep(Duration::from_millis(5)).await;

            let found = registry.fetch(&Filter::new(), mode).await;
            assert!(found.is_empty(), "mode {:?}", mode);
            assert!(!registry.servers()[0].has_info(), "mode {:?}", mode);
            assert_eq!(registry.servers()[0].state(), RecordState::Closed);
        }
    }
}
