//! # barrel-index
//!
//! One shard ("barrel") of a distributed search engine: an inverted index
//! from words to document ids, a catalog of crawled pages, and the machinery
//! to keep replicas of both.
//!
//! ## Features
//!
//! - **Concurrent Adaptive Radix Tree**: Node4/16/48/256 nodes, each behind
//!   its own reader-writer lock, growing in place as words are added.
//! - **Binary snapshots**: one little-endian format for checkpoint files and
//!   for peer transfer buffers.
//! - **Ingestion pool**: a bounded queue drained by worker threads that turn
//!   page and backlink records into catalog and index updates.
//! - **Replication**: boot from the most available peer, else from the last
//!   checkpoint, else empty.
//! - **Ranked search**: single words and word sets, ranked by backlink count
//!   and paginated.
//!
//! ## Example
//!
//! ```rust
//! use barrel_index::RadixIndex;
//!
//! let index = RadixIndex::new();
//! index.insert("hello", 1).unwrap();
//! index.insert("help", 2).unwrap();
//! index.insert("hello", 3).unwrap();
//!
//! assert_eq!(index.find("hello"), Some(vec![1, 3]));
//! assert_eq!(index.find("hel"), None);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod art;
pub mod barrel;
pub mod catalog;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod encoding;
pub mod error;
pub mod ingest;
pub mod link;
pub mod query;
pub mod replication;
pub mod state;

pub use art::{DocId, IndexStats, RadixIndex};
pub use barrel::Barrel;
pub use catalog::{CatalogSnapshot, Document, DocumentCatalog};
pub use cluster::{Coordinator, LocalCluster, PeerConnector, PeerShard, ShardAddress, ShardId};
pub use config::BarrelConfig;
pub use error::{
    BarrelError, ConfigError, IndexError, IngestError, LinkError, PersistenceError, QueryError,
    ReplicationError,
};
pub use ingest::{CrawlRecord, IngestionPipeline};
pub use query::{QueryEngine, ResultPage, SearchOutcome};
pub use replication::{BootSource, CheckpointStore, ReplicationManager};
pub use state::ShardState;

#[cfg(test)]
mod proptests;
