//! Contracts with the rest of the cluster, plus an in-process implementation.
//!
//! A shard needs two things from outside: a [`Coordinator`] that hands out
//! document ids and knows which peers are least busy, and a way to reach a
//! peer shard ([`PeerConnector`] / [`PeerShard`]) to copy its state. The
//! transport is not this crate's concern; [`LocalCluster`] wires shards in
//! the same process together and is what the binary and tests use.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::art::DocId;
use crate::barrel::Barrel;
use crate::catalog::CatalogSnapshot;
use crate::error::LinkError;
use crate::link::Connect;

/// Name of a shard within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId(s.to_owned())
    }
}

/// How to reach a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardAddress {
    /// The shard's name.
    pub id: ShardId,
    /// Transport-specific endpoint (host:port, in-process name, ...).
    pub endpoint: String,
}

/// Services the coordinator provides to shards.
pub trait Coordinator: Send + Sync {
    /// Next globally unique document id.
    fn allocate_next_document_id(&self) -> Result<DocId, LinkError>;

    /// The live shard with the most idle workers, other than `excluding`.
    fn most_available_peer(&self, excluding: &ShardId) -> Result<Option<ShardAddress>, LinkError>;
}

impl<T: Coordinator + ?Sized> Coordinator for Arc<T> {
    fn allocate_next_document_id(&self) -> Result<DocId, LinkError> {
        (**self).allocate_next_document_id()
    }

    fn most_available_peer(&self, excluding: &ShardId) -> Result<Option<ShardAddress>, LinkError> {
        (**self).most_available_peer(excluding)
    }
}

/// What a shard serves to peers that replicate from it.
pub trait PeerShard: Send + Sync {
    /// Full index in the binary snapshot format.
    fn get_index_bytes(&self) -> Result<Vec<u8>, LinkError>;

    /// The three catalog maps.
    fn get_catalog_maps(&self) -> Result<CatalogSnapshot, LinkError>;
}

/// Opens connections to peer shards.
pub trait PeerConnector: Send + Sync {
    /// Connect to the shard at `address`.
    fn connect(&self, address: &ShardAddress) -> Result<Arc<dyn PeerShard>, LinkError>;
}

/// In-process coordinator and peer registry.
///
/// Shards are held weakly so a shard that is dropped simply disappears.
#[derive(Default)]
pub struct LocalCluster {
    next_id: AtomicU64,
    members: RwLock<BTreeMap<ShardId, Weak<Barrel>>>,
}

impl LocalCluster {
    /// Create a cluster whose first allocated id is 0.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a cluster continuing from a previously allocated id.
    pub fn starting_at(next_id: DocId) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(next_id),
            members: RwLock::default(),
        })
    }

    /// Make sure ids up to and including `id` are never handed out again.
    pub fn advance_past(&self, id: DocId) {
        self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    /// Make `barrel` visible to peers.
    pub fn join(&self, barrel: &Arc<Barrel>) {
        self.members
            .write()
            .insert(barrel.id().clone(), Arc::downgrade(barrel));
    }

    /// Remove a shard.
    pub fn leave(&self, id: &ShardId) {
        self.members.write().remove(id);
    }

    fn member(&self, id: &ShardId) -> Option<Arc<Barrel>> {
        self.members.read().get(id).and_then(Weak::upgrade)
    }
}

impl Coordinator for LocalCluster {
    fn allocate_next_document_id(&self) -> Result<DocId, LinkError> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn most_available_peer(&self, excluding: &ShardId) -> Result<Option<ShardAddress>, LinkError> {
        let members = self.members.read();
        let mut best: Option<(f64, &ShardId)> = None;
        for (id, weak) in members.iter() {
            if id == excluding {
                continue;
            }
            let Some(barrel) = weak.upgrade().filter(|b| b.is_ready()) else {
                continue;
            };
            let availability = barrel.get_availability();
            if best.map_or(true, |(top, _)| availability > top) {
                best = Some((availability, id));
            }
        }
        Ok(best.map(|(_, id)| ShardAddress {
            id: id.clone(),
            endpoint: format!("local://{}", id),
        }))
    }
}

impl PeerConnector for LocalCluster {
    fn connect(&self, address: &ShardAddress) -> Result<Arc<dyn PeerShard>, LinkError> {
        match self.member(&address.id) {
            Some(barrel) => Ok(barrel as Arc<dyn PeerShard>),
            None => Err(LinkError::Transient(format!("{} is not reachable", address.id))),
        }
    }
}

/// Lets a [`crate::link::Link`] supervise an in-process cluster like a
/// remote coordinator. Connecting always succeeds.
impl Connect for Arc<LocalCluster> {
    type Client = Arc<LocalCluster>;

    fn connect(&self) -> Result<Self::Client, LinkError> {
        Ok(Arc::clone(self))
    }
}

impl fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCluster")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("members", &self.members.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
