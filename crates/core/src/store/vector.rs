//! Vector store: a persistent cosine-similarity ANN index backed by
//! `arroy` over an `heed`/LMDB environment — a small fixed set of named
//! databases (vectors, chunk-id metadata) inside one LMDB environment,
//! with capacity growth handled by reopening the env at a larger map size.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use arroy::distances::Cosine;
use arroy::{Database as ArroyDatabase, ItemId, Reader as ArroyReader, Writer as ArroyWriter};
use heed::types::{SerdeBincode, Str, U32};
use heed::{Env, EnvOpenOptions};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const INITIAL_CAPACITY: usize = 4096;
const DEFAULT_MAP_SIZE: usize = 2 * 1024 * 1024 * 1024; // 2 GiB address space reservation

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdMapping {
    next_key: u32,
    chunk_to_key: HashMap<String, u32>,
    key_to_chunk: HashMap<u32, String>,
    dimension: Option<usize>,
    capacity: usize,
    indexed: bool,
}

impl Default for IdMapping {
    fn default() -> Self {
        IdMapping {
            next_key: 0,
            chunk_to_key: HashMap::new(),
            key_to_chunk: HashMap::new(),
            dimension: None,
            capacity: INITIAL_CAPACITY,
            indexed: false,
        }
    }
}

struct Inner {
    dir: PathBuf,
    env: Env,
    vectors_db: ArroyDatabase<Cosine>,
    chunk_ids_db: heed::Database<U32<heed::byteorder::BigEndian>, Str>,
    mapping: IdMapping,
    mapping_path: PathBuf,
}

impl Inner {
    fn open(dir: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        let mapping_path = dir.join("vectors.map");
        let mapping = load_mapping(&mapping_path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(DEFAULT_MAP_SIZE)
                .max_dbs(4)
                .open(dir)
        }
        .map_err(|e| CoreError::StoreIoError(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(|e| CoreError::StoreIoError(e.to_string()))?;
        let vectors_db: ArroyDatabase<Cosine> = env
            .create_database(&mut wtxn, Some("vectors"))
            .map_err(|e| CoreError::StoreIoError(e.to_string()))?;
        let chunk_ids_db: heed::Database<U32<heed::byteorder::BigEndian>, Str> = env
            .create_database(&mut wtxn, Some("chunk_ids"))
            .map_err(|e| CoreError::StoreIoError(e.to_string()))?;
        wtxn.commit().map_err(|e| CoreError::StoreIoError(e.to_string()))?;

        Ok(Inner {
            dir: dir.to_path_buf(),
            env,
            vectors_db,
            chunk_ids_db,
            mapping,
            mapping_path,
        })
    }

    fn save_mapping(&self) -> CoreResult<()> {
        save_mapping(&self.mapping_path, &self.mapping)
    }

    fn key_for(&mut self, chunk_id: &str) -> u32 {
        if let Some(&k) = self.mapping.chunk_to_key.get(chunk_id) {
            return k;
        }
        let k = self.mapping.next_key;
        self.mapping.next_key += 1;
        self.mapping.chunk_to_key.insert(chunk_id.to_string(), k);
        self.mapping.key_to_chunk.insert(k, chunk_id.to_string());
        k
    }

    /// Grows the env's map size when the in-flight insert would exceed the
    /// tracked capacity: reserve `max(2×capacity, len+incoming+1024)` and
    /// retry transparently.
    fn ensure_capacity(&mut self, incoming: usize) -> CoreResult<()> {
        let length = self.mapping.chunk_to_key.len();
        if length + incoming <= self.mapping.capacity {
            return Ok(());
        }
        let new_capacity = std::cmp::max(2 * self.mapping.capacity, length + incoming + 1024);
        self.mapping.capacity = new_capacity;
        // arroy/heed size the LMDB map in bytes; re-deriving a generous
        // byte budget from item capacity keeps this transparent to callers
        // instead of surfacing a CapacityExhausted error.
        let new_map_size = (new_capacity * 4096).max(DEFAULT_MAP_SIZE);
        unsafe {
            self.env
                .resize(new_map_size)
                .map_err(|e| CoreError::StoreIoError(e.to_string()))?;
        }
        Ok(())
    }

    fn add_batch(&mut self, items: &[(String, Vec<f32>)]) -> CoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let dim = items[0].1.len();
        if let Some(expected) = self.mapping.dimension {
            if expected != dim {
                return Err(CoreError::DimensionMismatch { expected, got: dim });
            }
        }
        for (_, v) in items {
            if v.len() != dim {
                return Err(CoreError::DimensionMismatch {
                    expected: dim,
                    got: v.len(),
                });
            }
        }

        self.ensure_capacity(items.len())?;
        if self.mapping.dimension.is_none() {
            self.mapping.dimension = Some(dim);
        }

        let mut wtxn = self.env.write_txn()?;
        let writer = ArroyWriter::new(self.vectors_db, 0, dim);
        for (chunk_id, vector) in items {
            let key = self.key_for(chunk_id);
            writer
                .add_item(&mut wtxn, key, vector)
                .map_err(|e| CoreError::StoreIoError(e.to_string()))?;
            self.chunk_ids_db.put(&mut wtxn, &key, chunk_id.as_str())?;
        }
        wtxn.commit()?;
        self.mapping.indexed = false;
        self.save_mapping()?;
        Ok(())
    }

    fn build_index(&mut self) -> CoreResult<()> {
        let dim = self.mapping.dimension.unwrap_or(0);
        if dim == 0 {
            return Ok(());
        }
        let mut wtxn = self.env.write_txn()?;
        let writer = ArroyWriter::new(self.vectors_db, 0, dim);
        let mut rng = StdRng::seed_from_u64(0xC0DE_6R0);
        writer
            .builder(&mut rng)
            .build(&mut wtxn)
            .map_err(|e| CoreError::StoreIoError(e.to_string()))?;
        wtxn.commit()?;
        self.mapping.indexed = true;
        self.save_mapping()?;
        Ok(())
    }

    fn remove_many(&mut self, ids: &[String]) -> CoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let dim = self.mapping.dimension.unwrap_or(0);
        let mut wtxn = self.env.write_txn()?;
        let writer = ArroyWriter::new(self.vectors_db, 0, dim);
        for id in ids {
            if let Some(&key) = self.mapping.chunk_to_key.get(id) {
                writer
                    .del_item(&mut wtxn, key)
                    .map_err(|e| CoreError::StoreIoError(e.to_string()))?;
                self.chunk_ids_db.delete(&mut wtxn, &key)?;
            }
        }
        wtxn.commit()?;
        for id in ids {
            if let Some(key) = self.mapping.chunk_to_key.remove(id) {
                self.mapping.key_to_chunk.remove(&key);
            }
        }
        self.mapping.indexed = false;
        self.save_mapping()?;
        Ok(())
    }

    fn get_batch(&self, ids: &[String]) -> CoreResult<HashMap<String, Vec<f32>>> {
        let dim = self.mapping.dimension.unwrap_or(0);
        if dim == 0 || ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rtxn = self.env.read_txn()?;
        let reader = ArroyReader::open(&rtxn, 0, self.vectors_db).map_err(|e| CoreError::StoreIoError(e.to_string()))?;
        let mut out = HashMap::new();
        for id in ids {
            if let Some(&key) = self.mapping.chunk_to_key.get(id) {
                if let Some(item) = reader
                    .item_vector(&rtxn, key)
                    .map_err(|e| CoreError::StoreIoError(e.to_string()))?
                {
                    out.insert(id.clone(), item);
                }
            }
        }
        Ok(out)
    }

    fn search(&mut self, query: &[f32], k: usize) -> CoreResult<Vec<(String, f32)>> {
        let dim = self.mapping.dimension.unwrap_or(0);
        if dim == 0 {
            return Ok(Vec::new());
        }
        if !self.mapping.indexed {
            self.build_index()?;
        }
        if query.len() != dim {
            return Err(CoreError::DimensionMismatch {
                expected: dim,
                got: query.len(),
            });
        }
        let rtxn = self.env.read_txn()?;
        let reader = ArroyReader::open(&rtxn, 0, self.vectors_db).map_err(|e| CoreError::StoreIoError(e.to_string()))?;
        // Oversample the candidate set: tune `search_k` to trees × limit ×
        // 15 before trimming to `k`, arroy's own recommended ratio for
        // recall at this tree count.
        let search_k = reader.n_trees() * k * 15;
        let results = reader
            .nns(k)
            .search_k(search_k)
            .by_vector(&rtxn, query)
            .map_err(|e| CoreError::StoreIoError(e.to_string()))?;

        let mut out = Vec::with_capacity(results.len());
        for (key, distance) in results {
            if let Some(chunk_id) = self.mapping.key_to_chunk.get(&key) {
                // Cosine distance in arroy is `1 - cosine_similarity`;
                // convert back to a similarity in [-1, 1].
                let similarity = 1.0 - distance;
                out.push((chunk_id.clone(), similarity));
            }
        }
        Ok(out)
    }

    fn stats(&self) -> VectorStoreStats {
        VectorStoreStats {
            count: self.mapping.chunk_to_key.len(),
            dimension: self.mapping.dimension,
            capacity: self.mapping.capacity,
            indexed: self.mapping.indexed,
        }
    }
}

fn load_mapping(path: &Path) -> CoreResult<IdMapping> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes).unwrap_or_default())
    } else {
        Ok(IdMapping::default())
    }
}

fn save_mapping(path: &Path, mapping: &IdMapping) -> CoreResult<()> {
    let bytes = bincode::serialize(mapping).map_err(|e| CoreError::StoreIoError(e.to_string()))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct VectorStoreStats {
    pub count: usize,
    pub dimension: Option<usize>,
    pub capacity: usize,
    pub indexed: bool,
}

enum Request {
    AddBatch(Vec<(String, Vec<f32>)>, mpsc::Sender<CoreResult<()>>),
    BuildIndex(mpsc::Sender<CoreResult<()>>),
    RemoveMany(Vec<String>, mpsc::Sender<CoreResult<()>>),
    GetBatch(Vec<String>, mpsc::Sender<CoreResult<HashMap<String, Vec<f32>>>>),
    Search(Vec<f32>, usize, mpsc::Sender<CoreResult<Vec<(String, f32)>>>),
    Stats(mpsc::Sender<VectorStoreStats>),
    Shutdown,
}

/// Actor handle. Like `LexicalStore`, all mutation is serialized through a
/// dedicated thread; the handle itself is a cheap, cloneable channel sender.
#[derive(Clone)]
pub struct VectorStore {
    tx: mpsc::Sender<Request>,
}

impl VectorStore {
    pub fn open(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut inner = Inner::open(&dir)?;
        let (tx, rx) = mpsc::channel::<Request>();
        thread::Builder::new()
            .name("codegrove-vector-store".into())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    match req {
                        Request::AddBatch(items, reply) => {
                            let _ = reply.send(inner.add_batch(&items));
                        }
                        Request::BuildIndex(reply) => {
                            let _ = reply.send(inner.build_index());
                        }
                        Request::RemoveMany(ids, reply) => {
                            let _ = reply.send(inner.remove_many(&ids));
                        }
                        Request::GetBatch(ids, reply) => {
                            let _ = reply.send(inner.get_batch(&ids));
                        }
                        Request::Search(query, k, reply) => {
                            let _ = reply.send(inner.search(&query, k));
                        }
                        Request::Stats(reply) => {
                            let _ = reply.send(inner.stats());
                        }
                        Request::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn vector store actor thread");
        Ok(VectorStore { tx })
    }

    fn call<T>(&self, make: impl FnOnce(mpsc::Sender<T>) -> Request) -> T {
        let (reply_tx, reply_rx) = mpsc::channel();
        let req = make(reply_tx);
        self.tx.send(req).expect("vector store actor has shut down");
        reply_rx.recv().expect("vector store actor dropped reply sender")
    }

    pub fn add(&self, id: String, vector: Vec<f32>) -> CoreResult<()> {
        self.add_batch(vec![(id, vector)])
    }

    /// Writes `items` and marks the ANN index stale. Does not rebuild the
    /// index itself — call `build_index` once after a batch of writes, or
    /// let the next `search` rebuild it lazily — so a bulk indexing pass
    /// doesn't pay a full rebuild after every single file.
    pub fn add_batch(&self, items: Vec<(String, Vec<f32>)>) -> CoreResult<()> {
        self.call(|tx| Request::AddBatch(items, tx))
    }

    /// Rebuilds the ANN index over every vector currently stored. Cheap to
    /// skip: `search` rebuilds on demand if the index is stale, so this is
    /// an optimization to pay the cost once at a natural checkpoint (end of
    /// an indexing pass) rather than on the first post-index search.
    pub fn build_index(&self) -> CoreResult<()> {
        self.call(Request::BuildIndex)
    }

    pub fn remove(&self, id: String) -> CoreResult<()> {
        self.remove_many(vec![id])
    }

    pub fn remove_many(&self, ids: Vec<String>) -> CoreResult<()> {
        self.call(|tx| Request::RemoveMany(ids, tx))
    }

    pub fn get_batch(&self, ids: &[String]) -> CoreResult<HashMap<String, Vec<f32>>> {
        self.call(|tx| Request::GetBatch(ids.to_vec(), tx))
    }

    pub fn search(&self, query: &[f32], k: usize) -> CoreResult<Vec<(String, f32)>> {
        self.call(|tx| Request::Search(query.to_vec(), k, tx))
    }

    pub fn stats(&self) -> VectorStoreStats {
        self.call(Request::Stats)
    }

    pub fn close(self) {
        let _ = self.tx.send(Request::Shutdown);
    }
}
