//! Ranked, paginated search over a shard's index and catalog.
//!
//! Documents are ordered by descending backlink count, ties broken by
//! ascending document id. A result page is rendered as rows of
//! `[url, title, description]` followed by one sentinel row holding the total
//! page count.

use dashmap::DashMap;
use tracing::trace;

use crate::art::DocId;
use crate::error::QueryError;
use crate::state::ShardState;

/// One ranked document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// Document url.
    pub url: String,
    /// Title, empty for placeholder documents.
    pub title: String,
    /// Description, empty for placeholder documents.
    pub description: String,
    /// Number of recorded inbound links.
    pub backlinks: usize,
}

/// A slice of the ranked results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPage {
    /// Hits on this page, best first.
    pub hits: Vec<SearchHit>,
    /// Zero-based page number requested.
    pub page: usize,
    /// Page size requested.
    pub page_size: usize,
    /// Documents matching the query across all pages.
    pub total_hits: usize,
    /// `ceil(total_hits / page_size)`.
    pub total_pages: usize,
}

impl ResultPage {
    /// Render as string rows, with the trailing `[total_pages]` sentinel.
    pub fn rows(&self) -> Vec<Vec<String>> {
        let mut rows: Vec<Vec<String>> = self
            .hits
            .iter()
            .map(|hit| vec![hit.url.clone(), hit.title.clone(), hit.description.clone()])
            .collect();
        rows.push(vec![self.total_pages.to_string()]);
        rows
    }
}

/// What a search produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The shard cannot answer yet.
    Unavailable,
    /// Some word is unknown or the words share no document.
    NoMatch,
    /// At least one document matched.
    Found(ResultPage),
}

impl SearchOutcome {
    /// The page, if any.
    pub fn page(&self) -> Option<&ResultPage> {
        match self {
            SearchOutcome::Found(page) => Some(page),
            _ => None,
        }
    }
}

/// Answers searches and tracks which ones are popular.
#[derive(Debug, Default)]
pub struct QueryEngine {
    popular: DashMap<String, u64>,
}

impl QueryEngine {
    /// Create an engine with an empty popularity counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Search for documents containing `word`.
    pub fn search_word(
        &self,
        state: &ShardState,
        word: &str,
        page: usize,
        page_size: usize,
        is_fresh_search: bool,
    ) -> Result<SearchOutcome, QueryError> {
        if page_size == 0 {
            return Err(QueryError::InvalidArgument("page size must be positive"));
        }
        if word.is_empty() {
            return Err(QueryError::InvalidArgument("empty search word"));
        }
        if is_fresh_search {
            self.count(word);
        }

        let Some(ids) = state.index.find(word) else {
            trace!(word, "no match");
            return Ok(SearchOutcome::NoMatch);
        };
        Ok(rank(state, ids, page, page_size))
    }

    /// Search for documents containing every word of `words`.
    pub fn search_word_set<S: AsRef<str>>(
        &self,
        state: &ShardState,
        words: &[S],
        page: usize,
        page_size: usize,
        is_fresh_search: bool,
    ) -> Result<SearchOutcome, QueryError> {
        if page_size == 0 {
            return Err(QueryError::InvalidArgument("page size must be positive"));
        }
        let words: Vec<&str> = words.iter().map(AsRef::<str>::as_ref).collect();
        if words.is_empty() {
            return Err(QueryError::InvalidArgument("empty word set"));
        }
        if words.iter().any(|w| w.is_empty()) {
            return Err(QueryError::InvalidArgument("empty search word"));
        }
        if is_fresh_search {
            self.count(&words.join(" "));
        }

        let mut running: Option<Vec<DocId>> = None;
        for word in words {
            let Some(ids) = state.index.find(word) else {
                trace!(word, "no match");
                return Ok(SearchOutcome::NoMatch);
            };
            let next = match running {
                None => ids,
                Some(acc) => intersect_sorted(&acc, &ids),
            };
            if next.is_empty() {
                return Ok(SearchOutcome::NoMatch);
            }
            running = Some(next);
        }

        match running {
            Some(ids) => Ok(rank(state, ids, page, page_size)),
            None => Ok(SearchOutcome::NoMatch),
        }
    }

    /// The `n` most searched queries, most popular first.
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let mut all: Vec<(String, u64)> = self
            .popular
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        all.truncate(n);
        all
    }

    fn count(&self, query: &str) {
        *self.popular.entry(query.to_owned()).or_insert(0) += 1;
    }
}

/// Intersection of two ascending id lists.
fn intersect_sorted(a: &[DocId], b: &[DocId]) -> Vec<DocId> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn rank(state: &ShardState, ids: Vec<DocId>, page: usize, page_size: usize) -> SearchOutcome {
    // Ids the catalog does not know (a replica caught mid-transfer) are dropped.
    let mut hits: Vec<(DocId, SearchHit)> = ids
        .into_iter()
        .filter_map(|id| {
            state.catalog.with_document(id, |doc| {
                (
                    id,
                    SearchHit {
                        url: doc.url.clone(),
                        title: doc.title.clone().unwrap_or_default(),
                        description: doc.description.clone().unwrap_or_default(),
                        backlinks: doc.backlink_count(),
                    },
                )
            })
        })
        .collect();
    if hits.is_empty() {
        return SearchOutcome::NoMatch;
    }
    hits.sort_by(|(a_id, a), (b_id, b)| b.backlinks.cmp(&a.backlinks).then_with(|| a_id.cmp(b_id)));

    let total_hits = hits.len();
    let total_pages = total_hits.div_ceil(page_size);
    let start = page.saturating_mul(page_size).min(total_hits);
    let end = start.saturating_add(page_size).min(total_hits);
    let hits = hits.drain(start..end).map(|(_, hit)| hit).collect();

    SearchOutcome::Found(ResultPage {
        hits,
        page,
        page_size,
        total_hits,
        total_pages,
    })
}
