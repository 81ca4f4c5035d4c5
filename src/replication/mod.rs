//! Bootstrapping a shard from a peer or from disk, and periodic checkpoints.
//!
//! At boot a shard asks the coordinator for the most available peer and
//! copies its index bytes and catalog maps. The copy is decoded into a
//! complete [`ShardState`] before anything is installed. Without a usable
//! peer the last local checkpoint is loaded, and failing that the shard
//! starts empty.
//!
//! Peer copies are not consistent snapshots: the peer keeps ingesting while
//! its index and catalog are captured one after the other.

mod checkpoint;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::catalog::DocumentCatalog;
use crate::cluster::{Coordinator, PeerConnector, ShardAddress, ShardId};
use crate::codec;
use crate::error::{PersistenceError, ReplicationError};
use crate::link::{retry, RetryPolicy};
use crate::state::{ShardState, SharedState};

pub use checkpoint::{CheckpointStore, DOCUMENTS_FILE, IDS_FILE, INDEX_FILE, URLS_FILE};

/// Where a booted shard's state came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSource {
    /// Copied from this peer.
    Peer(ShardAddress),
    /// Loaded from the local checkpoint.
    Checkpoint,
    /// Nothing was available.
    Empty,
}

/// Pulls state from peers and falls back to checkpoints.
pub struct ReplicationManager {
    shard: ShardId,
    coordinator: Arc<dyn Coordinator>,
    peers: Arc<dyn PeerConnector>,
    store: CheckpointStore,
    policy: RetryPolicy,
}

impl ReplicationManager {
    /// Create a manager for shard `shard`.
    pub fn new(
        shard: ShardId,
        coordinator: Arc<dyn Coordinator>,
        peers: Arc<dyn PeerConnector>,
        store: CheckpointStore,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            shard,
            coordinator,
            peers,
            store,
            policy,
        }
    }

    /// The checkpoint store used as fallback.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Build the initial state: peer, then checkpoint, then empty.
    pub fn bootstrap(&self) -> (ShardState, BootSource) {
        match self.pull_from_peer() {
            Ok(Some((state, address))) => {
                info!(shard = %self.shard, peer = %address.id, "booted from peer");
                return (state, BootSource::Peer(address));
            }
            Ok(None) => info!(shard = %self.shard, "no peer available"),
            Err(e) => warn!(shard = %self.shard, error = %e, "peer sync failed"),
        }

        if self.store.exists() {
            match self.store.load() {
                Ok(state) => {
                    info!(shard = %self.shard, "booted from checkpoint");
                    return (state, BootSource::Checkpoint);
                }
                Err(e) => warn!(shard = %self.shard, error = %e, "checkpoint unusable"),
            }
        }

        info!(shard = %self.shard, "booting empty");
        (ShardState::new(), BootSource::Empty)
    }

    /// Copy the most available peer's state, if there is a peer.
    ///
    /// Each remote call is retried under the link policy. The returned state
    /// is fully decoded and validated.
    pub fn pull_from_peer(&self) -> Result<Option<(ShardState, ShardAddress)>, ReplicationError> {
        let Some(address) = retry(&self.policy, "most_available_peer", || {
            self.coordinator.most_available_peer(&self.shard)
        })?
        else {
            return Ok(None);
        };

        info!(shard = %self.shard, peer = %address.id, endpoint = %address.endpoint, "syncing from peer");
        let peer = retry(&self.policy, "connect", || self.peers.connect(&address))?;
        let bytes = retry(&self.policy, "get_index_bytes", || peer.get_index_bytes())?;
        let maps = retry(&self.policy, "get_catalog_maps", || peer.get_catalog_maps())?;
        debug!(bytes = bytes.len(), documents = maps.len(), "peer state received");

        let index = codec::import_from_slice(&bytes)?;
        let problems = index.verify_integrity();
        if let Some(first) = problems.first() {
            return Err(PersistenceError::Corrupt {
                offset: 0,
                reason: format!("peer index has {} integrity problems, first: {}", problems.len(), first),
            }
            .into());
        }
        let catalog = DocumentCatalog::from_snapshot(maps)?;
        Ok(Some((ShardState::from_parts(index, catalog), address)))
    }
}

/// Background thread writing a checkpoint every interval.
pub struct Checkpointer {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    /// Start checkpointing whatever state `state` holds at each tick.
    pub fn start(state: SharedState, store: CheckpointStore, interval: Duration) -> std::io::Result<Self> {
        let (shutdown, stop) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("checkpoint".into())
            .spawn(move || loop {
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let current = state.load_full();
                        // Failures only cost this cycle.
                        if let Err(e) = store.save(&current) {
                            warn!(error = %e, "periodic checkpoint failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Stop the thread, waiting for a checkpoint in progress.
    ///
    /// Same as dropping the handle.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("checkpoint thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogSnapshot, Document};
    use crate::cluster::PeerShard;
    use crate::error::LinkError;
    use crate::state::share;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedPeer {
        bytes: Vec<u8>,
        maps: CatalogSnapshot,
        failures_left: AtomicU32,
    }

    impl PeerShard for FixedPeer {
        fn get_index_bytes(&self) -> Result<Vec<u8>, LinkError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LinkError::Transient("connection reset".into()));
            }
            Ok(self.bytes.clone())
        }

        fn get_catalog_maps(&self) -> Result<CatalogSnapshot, LinkError> {
            Ok(self.maps.clone())
        }
    }

    struct OnePeer(Option<Arc<FixedPeer>>);

    impl Coordinator for OnePeer {
        fn allocate_next_document_id(&self) -> Result<u64, LinkError> {
            Ok(0)
        }

        fn most_available_peer(&self, excluding: &ShardId) -> Result<Option<ShardAddress>, LinkError> {
            assert_eq!(excluding.0, "me");
            Ok(self.0.as_ref().map(|_| ShardAddress {
                id: "peer".into(),
                endpoint: "test://peer".into(),
            }))
        }
    }

    impl PeerConnector for OnePeer {
        fn connect(&self, _address: &ShardAddress) -> Result<Arc<dyn PeerShard>, LinkError> {
            match &self.0 {
                Some(peer) => Ok(Arc::clone(peer) as Arc<dyn PeerShard>),
                None => Err(LinkError::Remote("no such peer".into())),
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    fn populated() -> ShardState {
        let state = ShardState::new();
        state
            .catalog
            .get_or_insert_with("a.com", || Ok(Document::new("a.com", 7, "A".into(), "".into())))
            .unwrap();
        state.index.insert("apple", 7).unwrap();
        state
    }

    fn manager(cluster: Arc<OnePeer>, store: CheckpointStore) -> ReplicationManager {
        ReplicationManager::new("me".into(), cluster.clone(), cluster, store, fast_policy())
    }

    #[test]
    fn test_boot_from_peer_after_transient_failure() {
        let source = populated();
        let peer = Arc::new(FixedPeer {
            bytes: codec::export_to_vec(&source.index).unwrap(),
            maps: source.catalog.snapshot(),
            failures_left: AtomicU32::new(2),
        });
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(OnePeer(Some(peer))), CheckpointStore::new(dir.path()));

        let (state, from) = manager.bootstrap();
        assert!(matches!(from, BootSource::Peer(ref a) if a.id.0 == "peer"));
        assert_eq!(state.index.find("apple"), Some(vec![7]));
        assert_eq!(state.catalog.id_of("a.com"), Some(7));
    }

    #[test]
    fn test_corrupt_peer_falls_back_to_checkpoint() {
        let peer = Arc::new(FixedPeer {
            bytes: vec![9, 0, 0, 0],
            maps: CatalogSnapshot::default(),
            failures_left: AtomicU32::new(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&populated()).unwrap();

        let manager = manager(Arc::new(OnePeer(Some(peer))), store);
        assert!(matches!(
            manager.pull_from_peer(),
            Err(ReplicationError::Persistence(PersistenceError::UnknownNodeType { node_type: 9, .. }))
        ));
        let (state, from) = manager.bootstrap();
        assert_eq!(from, BootSource::Checkpoint);
        assert_eq!(state.index.find("apple"), Some(vec![7]));
    }

    #[test]
    fn test_boot_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(OnePeer(None)), CheckpointStore::new(dir.path()));
        let (state, from) = manager.bootstrap();
        assert_eq!(from, BootSource::Empty);
        assert!(state.catalog.is_empty());
        assert!(state.index.find("apple").is_none());
    }

    #[test]
    fn test_checkpointer_writes_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let shared = share(populated());
        let checkpointer =
            Checkpointer::start(Arc::clone(&shared), store.clone(), Duration::from_millis(20)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !store.exists() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        checkpointer.stop();
        assert_eq!(Arc::strong_count(&shared), 1);
        assert!(store.exists());
        assert_eq!(store.load().unwrap().index.find("apple"), Some(vec![7]));
    }
}
