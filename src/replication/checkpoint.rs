//! On-disk checkpoints: one index file and three catalog blobs.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::info;

use crate::catalog::{CatalogSnapshot, DocumentCatalog};
use crate::codec::{self, ExportSummary};
use crate::error::{PersistenceError, PersistenceResult};
use crate::state::ShardState;

/// Index snapshot file name.
pub const INDEX_FILE: &str = "index.art";
/// url → key blob.
pub const URLS_FILE: &str = "catalog-urls.bin";
/// key → document blob.
pub const DOCUMENTS_FILE: &str = "catalog-documents.bin";
/// id → key blob.
pub const IDS_FILE: &str = "catalog-ids.bin";

/// A shard's checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Use `dir`, created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a complete checkpoint is present.
    pub fn exists(&self) -> bool {
        [INDEX_FILE, URLS_FILE, DOCUMENTS_FILE, IDS_FILE]
            .iter()
            .all(|name| self.dir.join(name).is_file())
    }

    /// Write the index and catalog of `state`.
    ///
    /// Every file is replaced by rename. Index and catalog are captured one
    /// after the other, not as a single atomic snapshot.
    pub fn save(&self, state: &ShardState) -> PersistenceResult<ExportSummary> {
        fs::create_dir_all(&self.dir)?;
        let summary = codec::export_to_file(&state.index, &self.dir.join(INDEX_FILE))?;
        let documents = self.save_catalog(&state.catalog.snapshot())?;
        info!(
            dir = %self.dir.display(),
            nodes = summary.nodes,
            documents,
            "checkpoint saved"
        );
        Ok(summary)
    }

    /// Replace the index file with already encoded bytes.
    pub fn write_index(&self, bytes: &[u8]) -> PersistenceResult<()> {
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.dir.join(INDEX_FILE), bytes)
    }

    fn save_catalog(&self, snapshot: &CatalogSnapshot) -> PersistenceResult<usize> {
        let [urls, documents, ids] = snapshot.encode()?;
        write_atomic(&self.dir.join(URLS_FILE), &urls)?;
        write_atomic(&self.dir.join(DOCUMENTS_FILE), &documents)?;
        write_atomic(&self.dir.join(IDS_FILE), &ids)?;
        Ok(snapshot.len())
    }

    /// Read the checkpoint back into a fresh state.
    pub fn load(&self) -> PersistenceResult<ShardState> {
        let index = codec::import_from_file(&self.dir.join(INDEX_FILE))?;
        let problems = index.verify_integrity();
        if let Some(first) = problems.first() {
            return Err(PersistenceError::Corrupt {
                offset: 0,
                reason: format!("{} integrity problems, first: {}", problems.len(), first),
            });
        }

        let snapshot = CatalogSnapshot::decode(
            &fs::read(self.dir.join(URLS_FILE))?,
            &fs::read(self.dir.join(DOCUMENTS_FILE))?,
            &fs::read(self.dir.join(IDS_FILE))?,
        )?;
        let catalog = DocumentCatalog::from_snapshot(snapshot)?;
        info!(dir = %self.dir.display(), documents = catalog.len(), "checkpoint loaded");
        Ok(ShardState::from_parts(index, catalog))
    }
}

/// Replace `path` through a temp file of its own, so concurrent writers of
/// the same file never rename each other's half-written bytes.
fn write_atomic(path: &Path, bytes: &[u8]) -> PersistenceResult<()> {
    let mut tmp = NamedTempFile::new_in(codec::parent_dir(path))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Document;
    use std::sync::Arc;
    use std::thread;

    fn sample_state() -> ShardState {
        let state = ShardState::new();
        for (id, url) in [(1u64, "a.com"), (2, "b.com")] {
            state
                .catalog
                .get_or_insert_with(url, || Ok(Document::new(url, id, "t".into(), "d".into())))
                .unwrap();
            state.index.insert("shared", id).unwrap();
        }
        state.catalog.append_backlink(2, 1);
        state
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("shard"));
        assert!(!store.exists());

        let state = sample_state();
        store.save(&state).unwrap();
        assert!(store.exists());
        let mut names: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, [DOCUMENTS_FILE, IDS_FILE, URLS_FILE, INDEX_FILE]);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.index.find("shared"), Some(vec![1, 2]));
        assert_eq!(loaded.catalog.len(), 2);
        assert_eq!(loaded.catalog.get_by_url("b.com").unwrap().backlink_ids, vec![1]);
    }

    #[test]
    fn test_write_index_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = sample_state();
        let bytes = codec::export_to_vec(&state.index).unwrap();
        store.write_index(&bytes).unwrap();
        assert_eq!(fs::read(dir.path().join(INDEX_FILE)).unwrap(), bytes);
    }

    #[test]
    fn test_load_missing_or_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(matches!(store.load(), Err(PersistenceError::Io(_))));

        store.save(&sample_state()).unwrap();
        fs::write(dir.path().join(DOCUMENTS_FILE), b"garbage").unwrap();
        assert!(matches!(store.load(), Err(PersistenceError::Catalog(_))));
    }

    #[test]
    fn test_save_races_with_index_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = Arc::new(sample_state());
        let bytes = codec::export_to_vec(&state.index).unwrap();

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    store.write_index(&bytes).unwrap();
                }
            })
        };
        for _ in 0..50 {
            store.save(&state).unwrap();
        }
        writer.join().unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.index.find("shared"), Some(vec![1, 2]));
        assert_eq!(loaded.catalog.len(), 2);
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 4);
    }
}
