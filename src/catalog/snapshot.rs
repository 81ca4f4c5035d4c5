//! Transfer and checkpoint form of a [`DocumentCatalog`].
//!
//! The catalog travels as three maps that are serialized independently:
//! url → key, key → document and id → key. Loading cross-checks them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Document, DocumentCatalog};
use crate::art::DocId;
use crate::error::{PersistenceError, PersistenceResult};

/// A document's url and id together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocKey {
    /// Page address.
    pub url: String,
    /// Document id.
    pub id: DocId,
}

/// The three catalog maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// url → (url, id)
    pub url_to_key: HashMap<String, DocKey>,
    /// (url, id) → document
    pub documents: HashMap<DocKey, Document>,
    /// id → (url, id)
    pub id_to_key: HashMap<DocId, DocKey>,
}

impl CatalogSnapshot {
    /// Number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Serialize each map into its own blob, in field order.
    pub fn encode(&self) -> PersistenceResult<[Vec<u8>; 3]> {
        Ok([
            bincode::serialize(&self.url_to_key)?,
            bincode::serialize(&self.documents)?,
            bincode::serialize(&self.id_to_key)?,
        ])
    }

    /// Inverse of [`CatalogSnapshot::encode`].
    pub fn decode(urls: &[u8], documents: &[u8], ids: &[u8]) -> PersistenceResult<Self> {
        Ok(Self {
            url_to_key: bincode::deserialize(urls)?,
            documents: bincode::deserialize(documents)?,
            id_to_key: bincode::deserialize(ids)?,
        })
    }
}

fn mismatch(what: impl Into<String>) -> PersistenceError {
    PersistenceError::Catalog(what.into())
}

impl DocumentCatalog {
    /// Copy the catalog into its three-map form.
    ///
    /// Each document is copied under its own entry lock; concurrent ingestion
    /// may land partially.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let mut snapshot = CatalogSnapshot::default();
        for entry in self.documents.iter() {
            let doc = entry.value();
            let key = DocKey {
                url: doc.url.clone(),
                id: doc.id,
            };
            snapshot.url_to_key.insert(doc.url.clone(), key.clone());
            snapshot.id_to_key.insert(doc.id, key.clone());
            snapshot.documents.insert(key, doc.clone());
        }
        snapshot
    }

    /// Rebuild a catalog, rejecting maps that disagree with each other.
    pub fn from_snapshot(snapshot: CatalogSnapshot) -> PersistenceResult<Self> {
        let CatalogSnapshot {
            url_to_key,
            documents,
            id_to_key,
        } = snapshot;

        if url_to_key.len() != documents.len() || id_to_key.len() != documents.len() {
            return Err(mismatch(format!(
                "map sizes differ: {} urls, {} documents, {} ids",
                url_to_key.len(),
                documents.len(),
                id_to_key.len()
            )));
        }

        let catalog = DocumentCatalog::new();
        for (key, doc) in documents {
            if doc.url != key.url || doc.id != key.id {
                return Err(mismatch(format!(
                    "document {}#{} stored under {}#{}",
                    doc.url, doc.id, key.url, key.id
                )));
            }
            if url_to_key.get(&key.url) != Some(&key) {
                return Err(mismatch(format!("url map disagrees for {}", key.url)));
            }
            if id_to_key.get(&key.id) != Some(&key) {
                return Err(mismatch(format!("id map disagrees for {}", key.id)));
            }
            catalog.by_url.insert(key.url, key.id);
            catalog.documents.insert(key.id, doc);
        }
        Ok(catalog)
    }
}
