//! Durable channel records.
//!
//! [`ChannelStore`] keeps one serialized [`ChannelInfo`] per channel in a
//! key/value [`Datastore`]. The in-memory backend serves tests and ephemeral
//! nodes; the RocksDB backend (feature `rocksdb`) persists across restarts.

use dashmap::DashMap;
use flowch_core::{Address, Direction, MsgId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::FlowchError;
use crate::types::{ChannelId, ChannelInfo};

/// Key prefix of channel records.
const CHANNEL_PREFIX: &str = "channel/";

/// Minimal key/value backend used by the channel store.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, FlowchError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), FlowchError>;
    fn delete(&self, key: &[u8]) -> Result<(), FlowchError>;
    /// All entries whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, FlowchError>;
}

/// Volatile datastore.
#[derive(Default)]
pub struct MemoryDatastore {
    entries: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, FlowchError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), FlowchError> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), FlowchError> {
        self.entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, FlowchError> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        Ok(out)
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksDatastore;

#[cfg(feature = "rocksdb")]
mod rocks {
    use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
    use std::path::Path;

    use super::Datastore;
    use crate::error::FlowchError;

    /// Column family holding channel records.
    const CF_CHANNELS: &str = "channels";

    /// RocksDB-backed datastore.
    pub struct RocksDatastore {
        db: DB,
    }

    fn store_err(e: rocksdb::Error) -> FlowchError {
        FlowchError::Store(e.to_string())
    }

    impl RocksDatastore {
        /// Open or create a database at `path`.
        pub fn open(path: &Path) -> Result<Self, FlowchError> {
            std::fs::create_dir_all(path)
                .map_err(|e| FlowchError::Store(format!("create {}: {}", path.display(), e)))?;

            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);

            let cfs = vec![ColumnFamilyDescriptor::new(CF_CHANNELS, Options::default())];
            let db = DB::open_cf_descriptors(&opts, path, cfs).map_err(store_err)?;
            Ok(Self { db })
        }

        fn cf(&self) -> Result<&rocksdb::ColumnFamily, FlowchError> {
            self.db
                .cf_handle(CF_CHANNELS)
                .ok_or_else(|| FlowchError::Store(format!("column family '{}' not found", CF_CHANNELS)))
        }
    }

    impl Datastore for RocksDatastore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, FlowchError> {
            self.db.get_cf(self.cf()?, key).map_err(store_err)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), FlowchError> {
            self.db.put_cf(self.cf()?, key, value).map_err(store_err)
        }

        fn delete(&self, key: &[u8]) -> Result<(), FlowchError> {
            self.db.delete_cf(self.cf()?, key).map_err(store_err)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, FlowchError> {
            let mut out = Vec::new();
            for item in self.db.iterator_cf(self.cf()?, IteratorMode::Start) {
                let (k, v) = item.map_err(store_err)?;
                if k.starts_with(prefix) {
                    out.push((k.to_vec(), v.to_vec()));
                }
            }
            Ok(out)
        }
    }
}

/// Lookup tables from the identities a record is reached by to its id.
#[derive(Default)]
struct Index {
    by_address: DashMap<Address, ChannelId>,
    by_sentinel: DashMap<MsgId, ChannelId>,
    outbound: DashMap<(Address, Address), ChannelId>,
}

impl Index {
    fn insert(&self, ci: &ChannelInfo) {
        if let Some(addr) = &ci.channel {
            self.by_address.insert(addr.clone(), ci.channel_id);
        }
        for rec in &ci.sentinels {
            self.by_sentinel.insert(rec.msg, ci.channel_id);
        }
        if ci.direction == Direction::Outbound {
            self.outbound
                .insert((ci.from.clone(), ci.to.clone()), ci.channel_id);
        }
    }

    fn remove(&self, ci: &ChannelInfo) {
        let id = ci.channel_id;
        if let Some(addr) = &ci.channel {
            self.by_address.remove_if(addr, |_, v| *v == id);
        }
        for rec in &ci.sentinels {
            self.by_sentinel.remove_if(&rec.msg, |_, v| *v == id);
        }
        self.outbound
            .remove_if(&(ci.from.clone(), ci.to.clone()), |_, v| *v == id);
    }
}

/// Channel records keyed by [`ChannelId`].
///
/// Writes happen only through the manager, under the channel's lock. Lookups
/// by address, funding message or (from, to) pair go through an in-memory
/// index rebuilt when the store is opened. Every operation fails with
/// [`FlowchError::StoreClosed`] once [`close`](Self::close) has been called.
pub struct ChannelStore {
    ds: Arc<dyn Datastore>,
    index: Index,
    closed: AtomicBool,
}

impl ChannelStore {
    /// Open a store over `ds`, indexing the records it already holds.
    pub fn new(ds: Arc<dyn Datastore>) -> Result<Self, FlowchError> {
        let store = Self {
            ds,
            index: Index::default(),
            closed: AtomicBool::new(false),
        };
        let records = store.list()?;
        for ci in &records {
            store.index.insert(ci);
        }
        tracing::debug!(records = records.len(), "channel store indexed");
        Ok(store)
    }

    /// Store backed by a fresh [`MemoryDatastore`].
    pub fn memory() -> Self {
        Self {
            ds: Arc::new(MemoryDatastore::new()),
            index: Index::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("channel store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), FlowchError> {
        if self.is_closed() {
            return Err(FlowchError::StoreClosed);
        }
        Ok(())
    }

    fn key(id: &ChannelId) -> Vec<u8> {
        format!("{}{}", CHANNEL_PREFIX, id).into_bytes()
    }

    pub fn get(&self, id: &ChannelId) -> Result<Option<ChannelInfo>, FlowchError> {
        self.ensure_open()?;
        match self.ds.get(&Self::key(id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, info: &ChannelInfo) -> Result<(), FlowchError> {
        self.ensure_open()?;
        let raw = serde_json::to_vec(info)?;
        self.ds.put(&Self::key(&info.channel_id), &raw)?;
        self.index.insert(info);
        Ok(())
    }

    pub fn delete(&self, id: &ChannelId) -> Result<(), FlowchError> {
        if let Some(ci) = self.get(id)? {
            self.index.remove(&ci);
        }
        self.ds.delete(&Self::key(id))
    }

    /// Every stored record, in key order.
    pub fn list(&self) -> Result<Vec<ChannelInfo>, FlowchError> {
        self.ensure_open()?;
        self.ds
            .scan_prefix(CHANNEL_PREFIX.as_bytes())?
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(FlowchError::from))
            .collect()
    }

    fn lookup<K>(
        &self,
        table: &DashMap<K, ChannelId>,
        key: &K,
    ) -> Result<Option<ChannelInfo>, FlowchError>
    where
        K: std::hash::Hash + Eq,
    {
        self.ensure_open()?;
        let Some(id) = table.get(key).map(|e| *e.value()) else {
            return Ok(None);
        };
        self.get(&id)
    }

    /// Record of the channel at on-chain address `addr`.
    pub fn by_address(&self, addr: &Address) -> Result<Option<ChannelInfo>, FlowchError> {
        self.lookup(&self.index.by_address, addr)
    }

    /// Outbound record for the (from, to) pair.
    pub fn outbound_by_from_to(
        &self,
        from: &Address,
        to: &Address,
    ) -> Result<Option<ChannelInfo>, FlowchError> {
        self.lookup(&self.index.outbound, &(from.clone(), to.clone()))
    }

    /// Record that tracks funding message `msg`.
    pub fn by_sentinel(&self, msg: &MsgId) -> Result<Option<ChannelInfo>, FlowchError> {
        self.lookup(&self.index.by_sentinel, msg)
    }
}
