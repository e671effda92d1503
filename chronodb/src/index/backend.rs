//! The secondary temporal index backend.
//!
//! A document store keyed by synthetic ids holds one document per
//! `(branch, keyspace, key, index, value)` validity interval. The store
//! itself is a single log-structured file under the index directory; every
//! modification batch -- terminations, creations, deletions -- lands under
//! one commit fence, so queries never observe a half-applied commit and a
//! crash recovers to a batch boundary.
//!
//! Writes come from one writer (the commit pipeline, or an explicit rebuild)
//! and queries from many readers; a readers/writer lock over the in-memory
//! projections enforces that.
//!
//! Indexer descriptors and the per-index dirty flags are persisted as
//! management rows in the same store file (`chronodb_indexers_master`,
//! `chronodb_indexdirty_master`: the index store is historically per-master,
//! shared by all branches).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{CResult, Error};
use crate::index::document::{Document, SearchSpec};
use crate::index::extractor::{ExtractorKind, ExtractorRegistry};
use crate::storage::engine::Engine;
use crate::storage::kv_file::KvFile;
use crate::Timestamp;

const INDEXERS_KEY: &[u8] = b"chronodb_indexers_master";
const DIRTY_KEY: &[u8] = b"chronodb_indexdirty_master";

/// How much accumulated garbage (replaced documents, terminations) triggers
/// a compaction of the store file on open.
const COMPACT_GARBAGE_RATIO: f64 = 0.5;

/// A document creation: everything but the synthetic id, which the backend
/// assigns.
#[derive(Clone, Debug, PartialEq)]
pub struct NewDocument {
    pub branch: String,
    pub keyspace: String,
    pub key: String,
    pub index: String,
    pub value: String,
    pub valid_from: Timestamp,
    pub valid_to: Timestamp,
}

/// One atomic batch of index changes: validity terminations, new documents,
/// and hard removals (used when an index is dropped or rebuilt).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexModifications {
    /// Sets `valid_to` on a previously open document, exactly once.
    pub terminations: Vec<(u64, Timestamp)>,
    pub creations: Vec<NewDocument>,
    pub deletions: Vec<u64>,
}

impl IndexModifications {
    pub fn is_empty(&self) -> bool {
        self.terminations.is_empty() && self.creations.is_empty() && self.deletions.is_empty()
    }
}

type OwnerKey = (String, String, String);

struct IndexState {
    store: KvFile,
    docs: HashMap<u64, Document>,
    /// `(branch, keyspace, index)` -> key -> document ids, for query scans.
    by_owner: HashMap<OwnerKey, BTreeMap<String, Vec<u64>>>,
    next_id: u64,
    /// One index name may carry several extractors; a row is indexed under
    /// the union of their values.
    indexers: HashMap<String, Vec<ExtractorKind>>,
    dirty: HashMap<String, bool>,
    #[cfg(test)]
    fail_next_apply: bool,
}

impl IndexState {
    fn doc_key(id: u64) -> Vec<u8> {
        id.to_be_bytes().to_vec()
    }

    fn link(&mut self, doc: &Document) {
        let owner = (doc.branch.clone(), doc.keyspace.clone(), doc.index.clone());
        self.by_owner
            .entry(owner)
            .or_default()
            .entry(doc.key.clone())
            .or_default()
            .push(doc.id);
    }

    fn unlink(&mut self, doc: &Document) {
        let owner = (doc.branch.clone(), doc.keyspace.clone(), doc.index.clone());
        if let Some(keys) = self.by_owner.get_mut(&owner) {
            if let Some(ids) = keys.get_mut(&doc.key) {
                ids.retain(|id| *id != doc.id);
                if ids.is_empty() {
                    keys.remove(&doc.key);
                }
            }
            if keys.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }

    fn persist_management(&self) -> CResult<(Vec<u8>, Vec<u8>)> {
        Ok((serde_json::to_vec(&self.indexers)?, serde_json::to_vec(&self.dirty)?))
    }
}

/// The index backend: document maintenance, dirty tracking, and filtered
/// temporal queries.
pub struct IndexBackend {
    state: RwLock<IndexState>,
    registry: Arc<ExtractorRegistry>,
}

impl IndexBackend {
    /// Opens (or creates) the index store under `dir`, reloading documents,
    /// indexer descriptors, and dirty flags.
    pub fn open(dir: &Path, registry: Arc<ExtractorRegistry>) -> CResult<Self> {
        std::fs::create_dir_all(dir)?;
        let mut store = KvFile::open_compact(dir.join("documents"), COMPACT_GARBAGE_RATIO)?;

        let indexers: HashMap<String, Vec<ExtractorKind>> = match store.get(INDEXERS_KEY)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => HashMap::new(),
        };
        let dirty: HashMap<String, bool> = match store.get(DIRTY_KEY)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => HashMap::new(),
        };

        let mut docs = HashMap::new();
        let mut next_id = 0;
        for entry in store.scan(..).collect::<CResult<Vec<_>>>()? {
            let (key, raw) = entry;
            if key.len() != 8 {
                continue; // management row
            }
            let doc: Document = bincode::deserialize(&raw)?;
            next_id = next_id.max(doc.id + 1);
            docs.insert(doc.id, doc);
        }

        let mut state = IndexState {
            store,
            docs: HashMap::new(),
            by_owner: HashMap::new(),
            next_id,
            indexers,
            dirty,
            #[cfg(test)]
            fail_next_apply: false,
        };
        for doc in docs.values() {
            state.link(doc);
        }
        state.docs = docs;

        Ok(Self { state: RwLock::new(state), registry })
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers an extractor under an index name. `dirty` says whether base
    /// data already exists that the index does not cover yet. Registering a
    /// further extractor on an existing index widens its value set and marks
    /// it dirty the same way.
    pub fn register(&self, name: &str, kind: ExtractorKind, dirty: bool) -> CResult<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("index name must not be empty".to_string()));
        }
        // Fail early in-process if a named extractor is unresolvable.
        self.registry.resolve(&kind)?;

        let mut state = self.write();
        let extractors = state.indexers.entry(name.to_string()).or_default();
        if extractors.contains(&kind) {
            return Err(Error::InvalidArgument(format!(
                "index {} already carries this extractor",
                name
            )));
        }
        extractors.push(kind);
        state.dirty.insert(name.to_string(), dirty);
        let (indexers_raw, dirty_raw) = state.persist_management()?;
        state.store.apply_batch(&[
            (INDEXERS_KEY.to_vec(), Some(indexers_raw)),
            (DIRTY_KEY.to_vec(), Some(dirty_raw)),
        ])?;
        Ok(())
    }

    /// Drops an index and hard-removes its documents.
    pub fn drop_index(&self, name: &str) -> CResult<()> {
        let mut state = self.write();
        if state.indexers.remove(name).is_none() {
            return Err(Error::IndexUnknown(name.to_string()));
        }
        state.dirty.remove(name);

        let doomed: Vec<u64> = state
            .docs
            .values()
            .filter(|doc| doc.index == name)
            .map(|doc| doc.id)
            .collect();

        let mut batch: Vec<(Vec<u8>, Option<Vec<u8>>)> =
            doomed.iter().map(|id| (IndexState::doc_key(*id), None)).collect();
        let (indexers_raw, dirty_raw) = state.persist_management()?;
        batch.push((INDEXERS_KEY.to_vec(), Some(indexers_raw)));
        batch.push((DIRTY_KEY.to_vec(), Some(dirty_raw)));
        state.store.apply_batch(&batch)?;

        for id in doomed {
            if let Some(doc) = state.docs.remove(&id) {
                state.unlink(&doc);
            }
        }
        Ok(())
    }

    /// All registered index names, sorted.
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().indexers.keys().cloned().collect();
        names.sort();
        names
    }

    /// The extractors registered under an index name.
    pub fn kinds(&self, name: &str) -> CResult<Vec<ExtractorKind>> {
        self.read()
            .indexers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexUnknown(name.to_string()))
    }

    /// Whether the index has writes its documents do not reflect.
    pub fn is_dirty(&self, name: &str) -> CResult<bool> {
        let state = self.read();
        if !state.indexers.contains_key(name) {
            return Err(Error::IndexUnknown(name.to_string()));
        }
        Ok(state.dirty.get(name).copied().unwrap_or(false))
    }

    /// Marks indices dirty (or clean), persisted.
    pub fn set_dirty(&self, names: &[String], dirty: bool) -> CResult<()> {
        let mut state = self.write();
        for name in names {
            if state.indexers.contains_key(name) {
                state.dirty.insert(name.clone(), dirty);
            }
        }
        let (indexers_raw, dirty_raw) = state.persist_management()?;
        state.store.apply_batch(&[
            (INDEXERS_KEY.to_vec(), Some(indexers_raw)),
            (DIRTY_KEY.to_vec(), Some(dirty_raw)),
        ])?;
        Ok(())
    }

    /// The indexed values an index produces for a stored value: the union
    /// over its extractors, materialized.
    pub fn extract(&self, name: &str, value: &[u8]) -> CResult<BTreeSet<String>> {
        let mut values = BTreeSet::new();
        for kind in self.kinds(name)? {
            values.extend(self.registry.resolve(&kind)?.extract(value));
        }
        Ok(values)
    }

    /// The currently open documents of `(branch, keyspace, key)` under one
    /// index.
    pub fn current_documents(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        index: &str,
    ) -> Vec<Document> {
        let state = self.read();
        let owner = (branch.to_string(), keyspace.to_string(), index.to_string());
        let Some(ids) = state.by_owner.get(&owner).and_then(|keys| keys.get(key)) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| state.docs.get(id))
            .filter(|doc| doc.is_open())
            .cloned()
            .collect()
    }

    /// Atomically applies a modification batch: one fenced write on the
    /// store, one consistent update of the projections.
    pub fn apply_modifications(&self, mods: &IndexModifications) -> CResult<()> {
        if mods.is_empty() {
            return Ok(());
        }
        let mut state = self.write();

        #[cfg(test)]
        {
            if state.fail_next_apply {
                state.fail_next_apply = false;
                return Err(Error::Storage("injected index writer failure".to_string()));
            }
        }

        let mut batch: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        let mut terminated: Vec<Document> = Vec::new();
        for (id, valid_to) in &mods.terminations {
            let doc = state.docs.get(id).ok_or_else(|| {
                Error::Internal(format!("termination of unknown document {}", id))
            })?;
            if !doc.is_open() {
                return Err(Error::Internal(format!(
                    "document {} is already terminated at {}",
                    id, doc.valid_to
                )));
            }
            if *valid_to <= doc.valid_from {
                return Err(Error::Internal(format!(
                    "termination at {} would empty document {} starting at {}",
                    valid_to, id, doc.valid_from
                )));
            }
            let mut updated = doc.clone();
            updated.valid_to = *valid_to;
            batch.push((IndexState::doc_key(*id), Some(bincode::serialize(&updated)?)));
            terminated.push(updated);
        }

        let mut created: Vec<Document> = Vec::new();
        let mut next_id = state.next_id;
        for new in &mods.creations {
            let doc = Document {
                id: next_id,
                branch: new.branch.clone(),
                keyspace: new.keyspace.clone(),
                key: new.key.clone(),
                index: new.index.clone(),
                value: new.value.clone(),
                valid_from: new.valid_from,
                valid_to: new.valid_to,
            };
            next_id += 1;
            batch.push((IndexState::doc_key(doc.id), Some(bincode::serialize(&doc)?)));
            created.push(doc);
        }

        for id in &mods.deletions {
            batch.push((IndexState::doc_key(*id), None));
        }

        state.store.apply_batch(&batch)?;

        state.next_id = next_id;
        for doc in terminated {
            state.docs.insert(doc.id, doc);
        }
        for doc in created {
            state.link(&doc);
            state.docs.insert(doc.id, doc);
        }
        for id in &mods.deletions {
            if let Some(doc) = state.docs.remove(id) {
                state.unlink(&doc);
            }
        }
        Ok(())
    }

    /// Documents matching `(branch, keyspace)`, valid at `T`, under the
    /// spec's index and value predicate. Results are ordered by key, then
    /// value.
    pub fn get_matching(
        &self,
        branch: &str,
        keyspace: &str,
        t: Timestamp,
        spec: &SearchSpec,
    ) -> CResult<Vec<Document>> {
        let state = self.read();
        if !state.indexers.contains_key(&spec.index) {
            return Err(Error::IndexUnknown(spec.index.clone()));
        }
        if state.dirty.get(&spec.index).copied().unwrap_or(false) {
            return Err(Error::IndexDirty(spec.index.clone()));
        }

        let owner = (branch.to_string(), keyspace.to_string(), spec.index.clone());
        let mut matches = Vec::new();
        if let Some(keys) = state.by_owner.get(&owner) {
            for ids in keys.values() {
                for id in ids {
                    let Some(doc) = state.docs.get(id) else { continue };
                    if doc.valid_at(t) && spec.condition.matches(&doc.value) {
                        matches.push(doc.clone());
                    }
                }
            }
        }
        matches.sort_by(|a, b| (&a.key, &a.value).cmp(&(&b.key, &b.value)));
        Ok(matches)
    }

    /// Replaces every document of one index with the given rebuilt set and
    /// clears the dirty flag, in a single atomic batch.
    pub fn rebuild(&self, name: &str, rebuilt: Vec<NewDocument>) -> CResult<()> {
        let mut state = self.write();
        if !state.indexers.contains_key(name) {
            return Err(Error::IndexUnknown(name.to_string()));
        }

        let doomed: Vec<u64> = state
            .docs
            .values()
            .filter(|doc| doc.index == name)
            .map(|doc| doc.id)
            .collect();

        let mut batch: Vec<(Vec<u8>, Option<Vec<u8>>)> =
            doomed.iter().map(|id| (IndexState::doc_key(*id), None)).collect();

        let mut created = Vec::with_capacity(rebuilt.len());
        let mut next_id = state.next_id;
        for new in rebuilt {
            if new.index != name {
                return Err(Error::Internal(format!(
                    "rebuild of {} received a document for index {}",
                    name, new.index
                )));
            }
            let doc = Document {
                id: next_id,
                branch: new.branch,
                keyspace: new.keyspace,
                key: new.key,
                index: new.index,
                value: new.value,
                valid_from: new.valid_from,
                valid_to: new.valid_to,
            };
            next_id += 1;
            batch.push((IndexState::doc_key(doc.id), Some(bincode::serialize(&doc)?)));
            created.push(doc);
        }

        state.dirty.insert(name.to_string(), false);
        let (indexers_raw, dirty_raw) = state.persist_management()?;
        batch.push((INDEXERS_KEY.to_vec(), Some(indexers_raw)));
        batch.push((DIRTY_KEY.to_vec(), Some(dirty_raw)));

        state.store.apply_batch(&batch)?;

        for id in doomed {
            if let Some(doc) = state.docs.remove(&id) {
                state.unlink(&doc);
            }
        }
        state.next_id = next_id;
        for doc in created {
            state.link(&doc);
            state.docs.insert(doc.id, doc);
        }
        log::info!("Rebuilt index {} with {} documents", name, state.docs.len());
        Ok(())
    }

    /// Makes the next apply_modifications() fail, as an injected index
    /// writer fault.
    #[cfg(test)]
    pub(crate) fn fail_next_apply(&self) {
        self.write().fail_next_apply = true;
    }
}
