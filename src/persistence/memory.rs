use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{PersistOp, PersistentStore};
use crate::error::{Result, StoreError};
use crate::tuple::Tuple;
use crate::types::{DataSlice, LinkId, TranId};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Record {
    tuple: Tuple,
    data: Vec<DataSlice>,
    checksum: u32,
}

impl Record {
    fn new(tuple: Tuple, data: Vec<DataSlice>) -> Self {
        let checksum = checksum(&data);
        Self {
            tuple,
            data,
            checksum,
        }
    }
}

fn checksum(data: &[DataSlice]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for slice in data {
        hasher.update(slice);
    }
    hasher.finalize()
}

fn persisted_size(data: &[DataSlice]) -> usize {
    data.iter().map(|s| s.len()).sum()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Inner {
    records: BTreeMap<LinkId, Record>,
    prepared: BTreeMap<TranId, Vec<PersistOp>>,
    highest_id: u64,
    highest_tran: u64,
}

impl Inner {
    fn apply(&mut self, op: PersistOp) {
        match op {
            PersistOp::Insert { mut tuple, data } => {
                tuple.tran_id = None;
                tuple.logically_deleted = false;
                tuple.persistent_size = persisted_size(&data);
                self.highest_id = self.highest_id.max(tuple.id.0);
                self.records.insert(tuple.id, Record::new(tuple, data));
            }
            PersistOp::Delete { id } => {
                self.records.remove(&id);
            }
            PersistOp::UpdateTuple { mut tuple } => match self.records.get_mut(&tuple.id) {
                Some(record) => {
                    tuple.tran_id = None;
                    tuple.persistent_size = record.tuple.persistent_size;
                    record.tuple = tuple;
                }
                None => debug!(link = %tuple.id, "tuple update for a record that is not stored"),
            },
            PersistOp::UpdateData { mut tuple, data } => {
                tuple.tran_id = None;
                tuple.persistent_size = persisted_size(&data);
                self.records.insert(tuple.id, Record::new(tuple, data));
            }
        }
    }

    fn stage(&mut self, tran: TranId, op: &PersistOp) {
        match op {
            PersistOp::Insert { tuple, data } => {
                let mut tuple = tuple.clone();
                tuple.tran_id = Some(tran);
                tuple.logically_deleted = false;
                tuple.persistent_size = persisted_size(data);
                self.highest_id = self.highest_id.max(tuple.id.0);
                self.records
                    .insert(tuple.id, Record::new(tuple, data.clone()));
            }
            PersistOp::Delete { id } => {
                if let Some(record) = self.records.get_mut(id) {
                    record.tuple.tran_id = Some(tran);
                    record.tuple.logically_deleted = true;
                }
            }
            // Tuple and data rewrites only become visible at commit.
            PersistOp::UpdateTuple { .. } | PersistOp::UpdateData { .. } => {}
        }
    }

    fn unstage(&mut self, op: &PersistOp) {
        match op {
            PersistOp::Insert { tuple, .. } => {
                self.records.remove(&tuple.id);
            }
            PersistOp::Delete { id } => {
                if let Some(record) = self.records.get_mut(id) {
                    record.tuple.tran_id = None;
                    record.tuple.logically_deleted = false;
                }
            }
            PersistOp::UpdateTuple { .. } | PersistOp::UpdateData { .. } => {}
        }
    }
}

/// In-memory durable tier.
///
/// Keeps tuples and data with a crc32 checksum per record, tracks prepared transactions so they
/// surface as in doubt after a simulated restart, and can be exported to and imported from JSON.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_next_write: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the durable contents into a fresh store, as a restart would see them.
    pub fn reopen(&self) -> Self {
        Self {
            inner: Mutex::new(self.inner.lock().clone()),
            fail_next_write: AtomicBool::new(false),
        }
    }

    /// Makes the next `prepare` or `commit` fail with a persistence error.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Flips the stored data of `id` so that its checksum no longer matches.
    pub fn corrupt(&self, id: LinkId) -> bool {
        let mut inner = self.inner.lock();
        match inner.records.get_mut(&id) {
            Some(record) => {
                record.checksum = !record.checksum;
                true
            }
            None => false,
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if a record for `id` exists.
    pub fn contains(&self, id: LinkId) -> bool {
        self.inner.lock().records.contains_key(&id)
    }

    /// Serialises the durable contents as JSON.
    pub fn to_json(&self) -> Result<String> {
        let inner = self.inner.lock();
        Ok(serde_json::to_string(&*inner)?)
    }

    /// Rebuilds a store from [`MemoryStore::to_json`] output.
    pub fn from_json(source: &str) -> Result<Self> {
        let inner: Inner = serde_json::from_str(source)?;
        Ok(Self {
            inner: Mutex::new(inner),
            fail_next_write: AtomicBool::new(false),
        })
    }

    /// Writes the JSON export to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Loads a store previously written with [`MemoryStore::save`].
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            warn!("injected persistence failure");
            return Err(StoreError::Persistence("injected write failure".into()));
        }
        Ok(())
    }
}

impl PersistentStore for MemoryStore {
    fn read_all_streams(&self) -> Result<Vec<Tuple>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .values()
            .filter(|r| r.tuple.kind.is_owner())
            .map(|r| r.tuple.clone())
            .collect())
    }

    fn read_non_stream_items(&self, stream: LinkId) -> Result<Vec<Tuple>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .values()
            .filter(|r| r.tuple.stream_id == stream && !r.tuple.kind.is_owner())
            .map(|r| r.tuple.clone())
            .collect())
    }

    fn read_data_only(&self, tuple: &Tuple) -> Result<Option<Vec<DataSlice>>> {
        let inner = self.inner.lock();
        let Some(record) = inner.records.get(&tuple.id) else {
            return Ok(None);
        };
        if checksum(&record.data) != record.checksum {
            return Err(StoreError::Persistence(format!(
                "checksum mismatch for {}",
                tuple.id
            )));
        }
        Ok(Some(record.data.clone()))
    }

    fn read_tuple(&self, id: LinkId) -> Result<Option<Tuple>> {
        Ok(self.inner.lock().records.get(&id).map(|r| r.tuple.clone()))
    }

    fn identify_streams_with_indoubt_items(&self) -> Result<Vec<LinkId>> {
        let inner = self.inner.lock();
        let mut streams: Vec<LinkId> = inner
            .records
            .values()
            .filter(|r| r.tuple.tran_id.is_some() && !r.tuple.kind.is_owner())
            .map(|r| r.tuple.stream_id)
            .collect();
        streams.sort_unstable();
        streams.dedup();
        Ok(streams)
    }

    fn indoubt_transactions(&self) -> Result<Vec<TranId>> {
        Ok(self.inner.lock().prepared.keys().copied().collect())
    }

    fn highest_unique_id(&self) -> Result<u64> {
        Ok(self.inner.lock().highest_id)
    }

    fn highest_tran_id(&self) -> Result<u64> {
        Ok(self.inner.lock().highest_tran)
    }

    fn prepare(&self, tran: TranId, ops: Vec<PersistOp>) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.lock();
        if inner.prepared.contains_key(&tran) {
            return Err(StoreError::Persistence(format!("{tran} already prepared")));
        }
        for op in &ops {
            inner.stage(tran, op);
        }
        inner.highest_tran = inner.highest_tran.max(tran.0);
        debug!(tran = %tran, ops = ops.len(), "prepared");
        inner.prepared.insert(tran, ops);
        Ok(())
    }

    fn commit(&self, tran: TranId, ops: Vec<PersistOp>) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.lock();
        let prepared = inner.prepared.remove(&tran).unwrap_or_default();
        let count = prepared.len() + ops.len();
        for op in prepared.into_iter().chain(ops) {
            inner.apply(op);
        }
        inner.highest_tran = inner.highest_tran.max(tran.0);
        debug!(tran = %tran, ops = count, "committed");
        Ok(())
    }

    fn rollback(&self, tran: TranId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(ops) = inner.prepared.remove(&tran) {
            for op in ops.iter().rev() {
                inner.unstage(op);
            }
            debug!(tran = %tran, ops = ops.len(), "rolled back prepared work");
        }
        Ok(())
    }
}
