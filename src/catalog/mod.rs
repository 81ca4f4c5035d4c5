//! Document catalog: the url ↔ id ↔ [`Document`] mapping of a shard.
//!
//! Two concurrent maps, `url → id` and `id → Document`, kept consistent by
//! routing every creation through [`DocumentCatalog::get_or_insert_with`].
//! Map locks are never held while a new id is being allocated.
//! Documents are never removed.

mod snapshot;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::art::DocId;
use crate::error::IngestError;

pub use snapshot::{CatalogSnapshot, DocKey};

/// A crawled (or merely linked-to) web page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Page address, unique within the catalog.
    pub url: String,
    /// Id handed out by the coordinator.
    pub id: DocId,
    /// Page title, `None` until the page itself is crawled.
    pub title: Option<String>,
    /// Page description, `None` until the page itself is crawled.
    pub description: Option<String>,
    /// Ids of pages linking here. Append-only; repeated links are kept.
    pub backlink_ids: Vec<DocId>,
}

impl Document {
    /// A fully crawled page.
    pub fn new(url: impl Into<String>, id: DocId, title: String, description: String) -> Self {
        Self {
            url: url.into(),
            id,
            title: Some(title),
            description: Some(description),
            backlink_ids: Vec::new(),
        }
    }

    /// A page known only because something links to it.
    pub fn placeholder(url: impl Into<String>, id: DocId) -> Self {
        Self {
            url: url.into(),
            id,
            title: None,
            description: None,
            backlink_ids: Vec::new(),
        }
    }

    /// Whether the page's own record has not been ingested yet.
    pub fn is_placeholder(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }

    /// Ranking signal: number of recorded inbound links.
    pub fn backlink_count(&self) -> usize {
        self.backlink_ids.len()
    }
}

/// Result of [`DocumentCatalog::get_or_insert_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Id of the url's document.
    pub id: DocId,
    /// Whether this call created it.
    pub created: bool,
}

/// Concurrent url → id → [`Document`] catalog.
#[derive(Debug, Default)]
pub struct DocumentCatalog {
    by_url: DashMap<String, DocId>,
    documents: DashMap<DocId, Document>,
}

fn is_blank(field: &Option<String>) -> bool {
    field.as_deref().map_or(true, str::is_empty)
}

impl DocumentCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the catalog holds no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Highest document id present.
    pub fn max_id(&self) -> Option<DocId> {
        self.documents.iter().map(|entry| *entry.key()).max()
    }

    /// Id of the document for `url`.
    pub fn id_of(&self, url: &str) -> Option<DocId> {
        self.by_url.get(url).map(|id| *id.value())
    }

    /// Copy of the document with `id`.
    pub fn get(&self, id: DocId) -> Option<Document> {
        self.documents.get(&id).map(|doc| doc.value().clone())
    }

    /// Copy of the document for `url`.
    pub fn get_by_url(&self, url: &str) -> Option<Document> {
        self.id_of(url).and_then(|id| self.get(id))
    }

    /// Run `f` against the document with `id` without cloning it.
    pub fn with_document<R>(&self, id: DocId, f: impl FnOnce(&Document) -> R) -> Option<R> {
        self.documents.get(&id).map(|doc| f(doc.value()))
    }

    /// Return the id for `url`, creating its document with `build` if absent.
    ///
    /// `build` runs without any map lock held, since it usually waits on the
    /// coordinator. Concurrent callers for the same url may each build a
    /// document, but only the first to publish wins; the others get the
    /// winner's id with `created == false` and their spare id is dropped.
    pub fn get_or_insert_with(
        &self,
        url: &str,
        build: impl FnOnce() -> Result<Document, IngestError>,
    ) -> Result<Admission, IngestError> {
        if let Some(id) = self.id_of(url) {
            return Ok(Admission { id, created: false });
        }

        let document = build()?;
        let id = document.id;
        if document.url != url {
            return Err(IngestError::Catalog(format!(
                "document for {} built with url {}",
                url, document.url
            )));
        }

        match self.by_url.entry(url.to_owned()) {
            Entry::Occupied(entry) => {
                debug!(url, winner = *entry.get(), spare = id, "lost admission race");
                Ok(Admission {
                    id: *entry.get(),
                    created: false,
                })
            }
            Entry::Vacant(entry) => {
                match self.documents.entry(id) {
                    Entry::Occupied(existing) => {
                        error!(id, url, existing = %existing.get().url, "document id allocated twice");
                        return Err(IngestError::Catalog(format!(
                            "id {} already belongs to {}",
                            id,
                            existing.get().url
                        )));
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(document);
                    }
                }
                entry.insert(id);
                Ok(Admission { id, created: true })
            }
        }
    }

    /// Fill in title and description of a placeholder.
    ///
    /// Fields already set are left alone. Returns whether anything changed.
    pub fn complete(&self, id: DocId, title: &str, description: &str) -> bool {
        let Some(mut doc) = self.documents.get_mut(&id) else {
            return false;
        };
        let mut changed = false;
        if is_blank(&doc.title) && !title.is_empty() {
            doc.title = Some(title.to_owned());
            changed = true;
        }
        if is_blank(&doc.description) && !description.is_empty() {
            doc.description = Some(description.to_owned());
            changed = true;
        }
        changed
    }

    /// Record that `father` links to `child`. Repeats are kept.
    pub fn append_backlink(&self, child: DocId, father: DocId) -> bool {
        match self.documents.get_mut(&child) {
            Some(mut doc) => {
                doc.backlink_ids.push(father);
                true
            }
            None => false,
        }
    }

    /// Urls of the pages linking to `url`, in the order the links were seen.
    ///
    /// `None` when `url` is unknown. Backlink ids without a document are skipped.
    pub fn backlink_urls(&self, url: &str) -> Option<Vec<String>> {
        let father_ids = self.with_document(self.id_of(url)?, |doc| doc.backlink_ids.clone())?;
        Some(
            father_ids
                .into_iter()
                .filter_map(|id| self.with_document(id, |doc| doc.url.clone()))
                .collect(),
        )
    }
}
