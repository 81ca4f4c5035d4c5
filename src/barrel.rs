//! One shard ("barrel"): the public face tying the pieces together.
//!
//! A barrel is created unready, then [`Barrel::start`] pulls state (peer,
//! checkpoint or nothing), starts the ingestion workers and the checkpoint
//! thread, and marks it ready. Searches against an unready barrel answer
//! [`SearchOutcome::Unavailable`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::catalog::CatalogSnapshot;
use crate::cluster::{Coordinator, PeerConnector, PeerShard, ShardAddress, ShardId};
use crate::codec::{self, ExportSummary};
use crate::config::BarrelConfig;
use crate::error::{BarrelError, IngestError, LinkError, QueryError};
use crate::ingest::{CrawlRecord, IngestStats, IngestionPipeline};
use crate::query::{QueryEngine, SearchOutcome};
use crate::replication::{BootSource, CheckpointStore, Checkpointer, ReplicationManager};
use crate::state::{share, ShardState, SharedState};

/// A running shard.
pub struct Barrel {
    id: ShardId,
    config: BarrelConfig,
    state: SharedState,
    coordinator: Arc<dyn Coordinator>,
    replication: ReplicationManager,
    query: QueryEngine,
    ready: AtomicBool,
    boot_source: Mutex<Option<BootSource>>,
    pipeline: RwLock<Option<IngestionPipeline>>,
    checkpointer: Mutex<Option<Checkpointer>>,
}

impl Barrel {
    /// Create an unready shard.
    pub fn new(
        config: BarrelConfig,
        coordinator: Arc<dyn Coordinator>,
        peers: Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>, BarrelError> {
        config.validate()?;
        let id = ShardId(config.shard_id.clone());
        let replication = ReplicationManager::new(
            id.clone(),
            Arc::clone(&coordinator),
            peers,
            CheckpointStore::new(&config.data_dir),
            config.retry_policy(),
        );
        Ok(Arc::new(Self {
            id,
            config,
            state: share(ShardState::new()),
            coordinator,
            replication,
            query: QueryEngine::new(),
            ready: AtomicBool::new(false),
            boot_source: Mutex::new(None),
            pipeline: RwLock::new(None),
            checkpointer: Mutex::new(None),
        }))
    }

    /// Create and start a shard.
    pub fn boot(
        config: BarrelConfig,
        coordinator: Arc<dyn Coordinator>,
        peers: Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>, BarrelError> {
        let barrel = Self::new(config, coordinator, peers)?;
        barrel.start()?;
        Ok(barrel)
    }

    /// Load initial state and start the background threads.
    pub fn start(&self) -> Result<BootSource, BarrelError> {
        let mut pipeline = self.pipeline.write();
        if pipeline.is_some() {
            return Err(BarrelError::AlreadyStarted(self.id.to_string()));
        }

        let (state, source) = self.replication.bootstrap();
        self.state.store(Arc::new(state));

        *pipeline = Some(IngestionPipeline::start(
            self.config.worker_count,
            self.config.queue_depth,
            Arc::clone(&self.state),
            Arc::clone(&self.coordinator),
        )?);
        *self.checkpointer.lock() = Some(Checkpointer::start(
            Arc::clone(&self.state),
            self.replication.store().clone(),
            self.config.checkpoint_interval(),
        )?);
        *self.boot_source.lock() = Some(source.clone());
        self.ready.store(true, Ordering::Release);

        let state = self.state.load();
        info!(
            shard = %self.id,
            source = ?source,
            documents = state.catalog.len(),
            workers = self.config.worker_count,
            "barrel ready"
        );
        Ok(source)
    }

    /// The shard's name.
    pub fn id(&self) -> &ShardId {
        &self.id
    }

    /// The configuration the shard runs with.
    pub fn config(&self) -> &BarrelConfig {
        &self.config
    }

    /// Whether the shard answers searches.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Where the current state was loaded from at start.
    pub fn boot_source(&self) -> Option<BootSource> {
        self.boot_source.lock().clone()
    }

    /// The current index and catalog.
    pub fn state(&self) -> Arc<ShardState> {
        self.state.load_full()
    }

    /// Queue a crawl record.
    pub fn submit(&self, record: CrawlRecord) -> Result<(), IngestError> {
        match self.pipeline.read().as_ref() {
            Some(pipeline) => pipeline.submit(record),
            None => Err(IngestError::Closed),
        }
    }

    /// Parse a raw crawl message with the configured delimiter and queue it.
    pub fn submit_message(&self, message: &str) -> Result<(), IngestError> {
        self.submit(CrawlRecord::parse(message, self.config.delimiter)?)
    }

    /// Ranked documents containing `word`.
    pub fn search_word(
        &self,
        word: &str,
        page: usize,
        page_size: usize,
        is_fresh_search: bool,
    ) -> Result<SearchOutcome, QueryError> {
        if !self.is_ready() {
            return Ok(SearchOutcome::Unavailable);
        }
        let state = self.state.load();
        self.query.search_word(&state, word, page, page_size, is_fresh_search)
    }

    /// Ranked documents containing every word of `words`.
    pub fn search_word_set<S: AsRef<str>>(
        &self,
        words: &[S],
        page: usize,
        page_size: usize,
        is_fresh_search: bool,
    ) -> Result<SearchOutcome, QueryError> {
        if !self.is_ready() {
            return Ok(SearchOutcome::Unavailable);
        }
        let state = self.state.load();
        self.query
            .search_word_set(&state, words, page, page_size, is_fresh_search)
    }

    /// The most searched queries.
    pub fn top_searches(&self, n: usize) -> Vec<(String, u64)> {
        self.query.top(n)
    }

    /// Urls of the pages linking to `url`. Empty when `url` is unknown.
    pub fn get_backlinks(&self, url: &str) -> Vec<String> {
        self.state.load().catalog.backlink_urls(url).unwrap_or_default()
    }

    /// [`Barrel::get_backlinks`] for several urls, positionally aligned.
    pub fn get_backlinks_batch<S: AsRef<str>>(&self, urls: &[S]) -> Vec<Vec<String>> {
        let state = self.state.load();
        urls.iter()
            .map(|url| state.catalog.backlink_urls(AsRef::<str>::as_ref(url)).unwrap_or_default())
            .collect()
    }

    /// Fraction of idle ingestion workers; 0 while not running.
    pub fn get_availability(&self) -> f64 {
        if !self.is_ready() {
            return 0.0;
        }
        self.pipeline
            .read()
            .as_ref()
            .map_or(0.0, IngestionPipeline::availability)
    }

    /// Ingestion counters, while running.
    pub fn ingest_stats(&self) -> Option<IngestStats> {
        self.pipeline.read().as_ref().map(IngestionPipeline::stats)
    }

    /// Block until queued records are applied or `timeout` passes.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        match self.pipeline.read().as_ref() {
            Some(pipeline) => pipeline.wait_until_idle(timeout),
            None => true,
        }
    }

    /// Write the index file and return the same bytes.
    pub fn export_snapshot(&self) -> Result<Vec<u8>, BarrelError> {
        let state = self.state.load();
        let bytes = codec::export_to_vec(&state.index)?;
        self.replication.store().write_index(&bytes)?;
        Ok(bytes)
    }

    /// Write a full checkpoint now.
    pub fn checkpoint(&self) -> Result<ExportSummary, BarrelError> {
        let state = self.state.load_full();
        Ok(self.replication.store().save(&state)?)
    }

    /// Pull the most available peer's state and install it.
    ///
    /// Records being applied while the new state is installed land in the
    /// old state and are lost. Returns the peer, or `None` if there was none.
    pub fn resync(&self) -> Result<Option<ShardAddress>, BarrelError> {
        let Some((state, address)) = self.replication.pull_from_peer()? else {
            info!(shard = %self.id, "resync found no peer");
            return Ok(None);
        };
        self.state.store(Arc::new(state));
        info!(shard = %self.id, peer = %address.id, "resynced from peer");
        Ok(Some(address))
    }

    /// Stop ingestion and checkpointing, then write a last checkpoint.
    ///
    /// Queued records that were not started are dropped.
    pub fn shutdown(&self) {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return;
        }
        drop(self.pipeline.write().take());
        drop(self.checkpointer.lock().take());
        if let Err(e) = self.checkpoint() {
            warn!(shard = %self.id, error = %e, "final checkpoint failed");
        }
        info!(shard = %self.id, "barrel stopped");
    }
}

impl PeerShard for Barrel {
    fn get_index_bytes(&self) -> Result<Vec<u8>, LinkError> {
        if !self.is_ready() {
            return Err(LinkError::Transient(format!("{} is not ready", self.id)));
        }
        self.export_snapshot()
            .map_err(|e| LinkError::Remote(e.to_string()))
    }

    fn get_catalog_maps(&self) -> Result<CatalogSnapshot, LinkError> {
        if !self.is_ready() {
            return Err(LinkError::Transient(format!("{} is not ready", self.id)));
        }
        Ok(self.state.load().catalog.snapshot())
    }
}

impl std::fmt::Debug for Barrel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrel")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .field("documents", &self.state.load().catalog.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;

    fn config(dir: &std::path::Path, id: &str) -> BarrelConfig {
        BarrelConfig {
            shard_id: id.to_owned(),
            worker_count: 2,
            queue_depth: 64,
            data_dir: dir.join(id),
            retry_delay_ms: 1,
            ..BarrelConfig::default()
        }
    }

    fn boot(cluster: &Arc<LocalCluster>, config: BarrelConfig) -> Arc<Barrel> {
        let barrel = Barrel::boot(config, cluster.clone(), cluster.clone()).unwrap();
        cluster.join(&barrel);
        barrel
    }

    #[test]
    fn test_unready_barrel() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new();
        let barrel = Barrel::new(config(dir.path(), "a"), cluster.clone(), cluster.clone()).unwrap();
        assert!(!barrel.is_ready());
        assert_eq!(barrel.search_word("cat", 0, 10, true).unwrap(), SearchOutcome::Unavailable);
        assert_eq!(barrel.get_availability(), 0.0);
        assert!(matches!(barrel.submit_message("a.com|t|d|cat"), Err(IngestError::Closed)));
        assert!(barrel.get_index_bytes().is_err());

        assert_eq!(barrel.start().unwrap(), BootSource::Empty);
        assert!(barrel.is_ready());
        assert!(matches!(barrel.start(), Err(BarrelError::AlreadyStarted(_))));
        barrel.shutdown();
    }

    #[test]
    fn test_ingest_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new();
        let barrel = boot(&cluster, config(dir.path(), "a"));

        barrel.submit_message("a.com|Cats|All about cats|cat|pet").unwrap();
        barrel.submit_message("b.com|Dogs|All about dogs|dog|pet").unwrap();
        barrel.submit_message("FATHER_URLS|a.com|b.com").unwrap();
        barrel.submit_message("FATHER_URLS|c.com|b.com|a.com").unwrap();
        assert!(barrel.wait_until_idle(Duration::from_secs(10)));

        let outcome = barrel.search_word("pet", 0, 10, true).unwrap();
        let rows = outcome.page().unwrap().rows();
        assert_eq!(rows[0], vec!["b.com", "Dogs", "All about dogs"]);
        assert_eq!(rows[1][0], "a.com");
        assert_eq!(rows[2], vec!["1"]);

        assert_eq!(barrel.search_word("bird", 0, 10, false).unwrap(), SearchOutcome::NoMatch);
        assert!(matches!(
            barrel.search_word_set(&["cat", "dog"], 0, 10, false).unwrap(),
            SearchOutcome::NoMatch
        ));

        let mut fathers = barrel.get_backlinks("b.com");
        fathers.sort();
        assert_eq!(fathers, vec!["a.com", "c.com"]);
        assert_eq!(
            barrel.get_backlinks_batch(&["a.com", "nowhere.com"]),
            vec![vec!["c.com".to_owned()], Vec::<String>::new()]
        );
        assert_eq!(barrel.top_searches(1), vec![("pet".to_owned(), 1)]);
        assert_eq!(barrel.ingest_stats().unwrap().processed, 4);
        barrel.shutdown();
    }

    #[test]
    fn test_peer_boot_and_resync() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new();
        let first = boot(&cluster, config(dir.path(), "a"));
        first.submit_message("a.com|A|first|apple").unwrap();
        assert!(first.wait_until_idle(Duration::from_secs(10)));

        let second = boot(&cluster, config(dir.path(), "b"));
        assert!(matches!(second.boot_source(), Some(BootSource::Peer(ref a)) if a.id.0 == "a"));
        assert!(second.search_word("apple", 0, 10, false).unwrap().page().is_some());
        assert!(dir.path().join("a").join("index.art").exists());

        first.submit_message("z.com|Z|later|zebra").unwrap();
        assert!(first.wait_until_idle(Duration::from_secs(10)));
        assert_eq!(second.search_word("zebra", 0, 10, false).unwrap(), SearchOutcome::NoMatch);

        let peer = second.resync().unwrap().unwrap();
        assert_eq!(peer.id.0, "a");
        assert!(second.search_word("zebra", 0, 10, false).unwrap().page().is_some());

        first.shutdown();
        second.shutdown();
    }

    #[test]
    fn test_shutdown_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new();
        let barrel = boot(&cluster, config(dir.path(), "a"));
        barrel.submit_message("a.com|A|d|kept").unwrap();
        assert!(barrel.wait_until_idle(Duration::from_secs(10)));
        barrel.shutdown();
        assert!(!barrel.is_ready());
        assert_eq!(barrel.search_word("kept", 0, 10, false).unwrap(), SearchOutcome::Unavailable);
        drop(barrel);

        // A lone shard restarts from its own checkpoint.
        let cluster = LocalCluster::new();
        let again = boot(&cluster, config(dir.path(), "a"));
        assert_eq!(again.boot_source(), Some(BootSource::Checkpoint));
        assert!(again.search_word("kept", 0, 10, false).unwrap().page().is_some());
        again.shutdown();
    }
}
