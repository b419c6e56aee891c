#![feature(error_generic_member_access)]

//! A hash-indexed key/value overlay on top of an append-only record log.
//!
//! [`Table`] keeps, entirely in RAM, a multimap from a 32-bit key hash to the
//! log offsets where records for keys of that hash have been appended (see
//! `hash_offsets`), a small per-topic FIFO value cache (`cache`), and an
//! optional timestamp-to-key index (`time_index`). It is threadsafe and
//! generic over the log engine it talks to, which lets tests run against an
//! in-memory stand-in (see [`test`]) instead of a real log service.

mod cache;
mod hash;
mod hash_offsets;
pub mod log_engine;
mod offset;
pub mod test;
mod time_index;

use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, info, instrument};

pub use log_engine::{AppendInfo, FetchedRecord, LogEngine, LogEngineError, OutboundRecord};
pub use offset::FileSelector;

use cache::{Cache, CacheValue};
use hash_offsets::HashOffsets;
use offset::{from_mixed, to_mixed};
use time_index::TimeIndex;

/// Knobs for tuning the behavior of a [`Table`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Bound on each topic's FIFO value cache.
    pub cache_size: usize,

    /// Upper bound on the size of a single fetch batch requested from the
    /// log engine during point reads and startup index loads.
    pub fetch_max_bytes: usize,

    /// Whether time-to-key lookups are served. Writes still feed the time
    /// index when this is `false`; only `get_key_by_time` is affected.
    pub with_time_to_key: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_size: 10_000,
            fetch_max_bytes: 64 * 1024,
            with_time_to_key: false,
        }
    }
}

/// One past the largest raw offset `to_mixed` can pack into 31 bits.
const MAX_RAW_OFFSET: i64 = 1i64 << 31;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("log engine error: {0}")]
    Engine(#[from] LogEngineError),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("startup index loader panicked")]
    LoaderPanicked,

    #[error("table lock was poisoned")]
    Poisoned,

    #[error("topic {topic} would need a raw offset of {offset}, which does not fit in 31 bits")]
    OffsetOverflow { topic: String, offset: i64 },
}

/// The four physical topics backing one declared topic name.
struct TopicSet {
    name: String,
    post: String,
    index: String,
    index_post: String,
}

impl TopicSet {
    fn new(name: &str) -> Self {
        TopicSet {
            post: format!("{name}~"),
            index: format!("{name}_idx"),
            index_post: format!("{name}~_idx"),
            name: name.to_string(),
        }
    }
}

/// Mutable state behind the single read/write lock: the hash index and the
/// time index. Per-column caches are deliberately *not* behind this lock.
/// Each carries its own mutex, so a `read()` holding only the outer read
/// lock can still populate its cache on a miss. See DESIGN.md for why this
/// narrows "a single lock protects all mutable state" to the parts that
/// actually need cross-field consistency.
struct State {
    hash_offsets: HashOffsets,
    time_index: TimeIndex,
}

struct Inner<L> {
    engine: L,
    topics: Vec<TopicSet>,
    hasher: Box<dyn Fn(&[u8]) -> i32 + Send + Sync>,
    config: Config,
    caches: Vec<Mutex<Cache>>,
    state: RwLock<State>,
}

/// The hash-indexed key/value overlay.
///
/// `Table<L>` is cheap to clone: clones share the same underlying state via
/// `Arc`, which is how the same table gets handed to multiple reader/writer
/// threads.
pub struct Table<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for Table<L> {
    fn clone(&self) -> Self {
        Table {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L> Table<L>
where
    L: LogEngine,
{
    /// Opens a table over `topics` using the default (FNV-1a) key hash.
    pub fn open(topics: &[impl AsRef<str>], engine: L, config: Config) -> Result<Self, TableError> {
        Self::open_with_hasher(topics, engine, config, hash::fnv1a_32)
    }

    /// Opens a table over `topics` with `Config::default()`.
    pub fn new(topics: &[impl AsRef<str>], engine: L) -> Result<Self, TableError> {
        Self::open(topics, engine, Config::default())
    }

    /// Opens a table using a caller-supplied key hash, for embedders whose
    /// surrounding system already has its own key-hash convention that the
    /// on-disk index logs were built with.
    #[instrument(skip(engine, config, hasher), fields(topics = topics.len()))]
    pub fn open_with_hasher(
        topics: &[impl AsRef<str>],
        engine: L,
        config: Config,
        hasher: impl Fn(&[u8]) -> i32 + Send + Sync + 'static,
    ) -> Result<Self, TableError> {
        let topic_sets: Vec<TopicSet> = topics.iter().map(|t| TopicSet::new(t.as_ref())).collect();
        let columns = topic_sets.len();
        let caches: Vec<Mutex<Cache>> = (0..columns)
            .map(|_| Mutex::new(Cache::new(config.cache_size)))
            .collect();

        let mut hash_offsets = HashOffsets::new();
        let mut time_index = TimeIndex::new(config.with_time_to_key);

        info!(columns, with_time_to_key = config.with_time_to_key, "loading index logs");

        std::thread::scope(|scope| -> Result<(), TableError> {
            let column_handles: Vec<_> = topic_sets
                .iter()
                .map(|set| {
                    let engine = &engine;
                    let fetch_max_bytes = config.fetch_max_bytes;
                    scope.spawn(move || load_column_index(engine, set, fetch_max_bytes))
                })
                .collect();

            let time_handle = config.with_time_to_key.then(|| {
                let engine = &engine;
                let set0 = &topic_sets[0];
                let fetch_max_bytes = config.fetch_max_bytes;
                scope.spawn(move || load_time_index(engine, set0, fetch_max_bytes))
            });

            for (col, handle) in column_handles.into_iter().enumerate() {
                let entries = handle.join().map_err(|_| TableError::LoaderPanicked)??;
                debug!(col, loaded = entries.len(), "column index loaded");
                for (hash, mixed) in entries {
                    hash_offsets.put(hash, mixed, col);
                }
            }

            if let Some(handle) = time_handle {
                let entries = handle.join().map_err(|_| TableError::LoaderPanicked)??;
                for (timestamp, key) in entries {
                    time_index.put(timestamp, &key);
                }
            }

            Ok(())
        })?;

        Ok(Table {
            inner: Arc::new(Inner {
                engine,
                topics: topic_sets,
                hasher: Box::new(hasher),
                config,
                caches,
                state: RwLock::new(State {
                    hash_offsets,
                    time_index,
                }),
            }),
        })
    }

    fn column_of(&self, topic: &str) -> Result<usize, TableError> {
        self.inner
            .topics
            .iter()
            .position(|t| t.name == topic)
            .ok_or_else(|| TableError::UnknownTopic(topic.to_string()))
    }

    fn topic_for(&self, selector: FileSelector, col: usize) -> &str {
        match selector {
            FileSelector::Snapshot => &self.inner.topics[col].name,
            FileSelector::Post => &self.inner.topics[col].post,
        }
    }

    fn index_topic_for(&self, selector: FileSelector, col: usize) -> &str {
        match selector {
            FileSelector::Snapshot => &self.inner.topics[col].index,
            FileSelector::Post => &self.inner.topics[col].index_post,
        }
    }

    /// Resolves `key` under `topic`, returning its value and timestamp if a
    /// live (non-tombstoned) record is found.
    ///
    /// ```
    /// # use tablekv::{Table, Config, test::MemoryLog};
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let table = Table::new(&["accounts"], MemoryLog::new())?;
    /// table.write(&[(b"alice".to_vec(), Some(b"100".to_vec()), 10)], "accounts")?;
    /// assert_eq!(table.read(b"alice", "accounts", false)?, Some((b"100".to_vec(), 10)));
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self, key), fields(topic, bypass_cache))]
    pub fn read(
        &self,
        key: &[u8],
        topic: &str,
        bypass_cache: bool,
    ) -> Result<Option<(Vec<u8>, i64)>, TableError> {
        let col = self.column_of(topic)?;
        let key_hash = (self.inner.hasher)(key);
        let cache = &self.inner.caches[col];

        let state = self.inner.state.read().map_err(|_| TableError::Poisoned)?;

        if !bypass_cache {
            if let Some(cached) = cache.lock().map_err(|_| TableError::Poisoned)?.get(key_hash) {
                return Ok(cached.value.map(|v| (v, cached.timestamp)));
            }
        }

        let Some(offsets) = state.hash_offsets.get(key_hash, col) else {
            return Ok(None);
        };

        for &mixed in offsets.iter().rev() {
            let (selector, raw_offset) = from_mixed(mixed);
            let topic_name = self.topic_for(selector, col).to_string();
            let batch = self
                .inner
                .engine
                .read(&topic_name, raw_offset as i64, self.inner.config.fetch_max_bytes)?;

            let Some(record) = batch
                .into_iter()
                .find(|rec| rec.offset == raw_offset as i64 && rec.key.as_deref() == Some(key))
            else {
                // Hash collision at this offset: keep walking older candidates.
                continue;
            };

            if !record.has_value {
                // Tombstone is the newest record for this key.
                return Ok(None);
            }

            let value = record.value.unwrap_or_default();
            if !bypass_cache {
                cache.lock().map_err(|_| TableError::Poisoned)?.put(
                    key_hash,
                    CacheValue {
                        value: Some(value.clone()),
                        timestamp: record.timestamp,
                        mixed_offset: mixed,
                    },
                );
            }
            return Ok(Some((value, record.timestamp)));
        }

        Ok(None)
    }

    /// Writes `kvs` to `topic`'s snapshot file.
    pub fn write(
        &self,
        kvs: &[(Vec<u8>, Option<Vec<u8>>, i64)],
        topic: &str,
    ) -> Result<usize, TableError> {
        self.write_with_selector(kvs, topic, FileSelector::Snapshot)
    }

    /// Alias for [`Table::write`]. Bare `write` already defaults to the
    /// snapshot file; this wrapper exists so callers can say what they mean.
    pub fn write_snap(
        &self,
        kvs: &[(Vec<u8>, Option<Vec<u8>>, i64)],
        topic: &str,
    ) -> Result<usize, TableError> {
        self.write_with_selector(kvs, topic, FileSelector::Snapshot)
    }

    /// Writes `kvs` to `topic`'s post file.
    pub fn write_post(
        &self,
        kvs: &[(Vec<u8>, Option<Vec<u8>>, i64)],
        topic: &str,
    ) -> Result<usize, TableError> {
        self.write_with_selector(kvs, topic, FileSelector::Post)
    }

    #[instrument(skip(self, kvs), fields(topic, selector = ?selector, batch_size = kvs.len()))]
    pub fn write_with_selector(
        &self,
        kvs: &[(Vec<u8>, Option<Vec<u8>>, i64)],
        topic: &str,
        selector: FileSelector,
    ) -> Result<usize, TableError> {
        let col = self.column_of(topic)?;
        let cache = &self.inner.caches[col];

        struct Pending<'a> {
            key: &'a [u8],
            value: Option<&'a [u8]>,
            timestamp: i64,
            hash: i32,
            prev_mixed: Option<i32>,
        }

        let mut pending = Vec::with_capacity(kvs.len());
        {
            let cache_guard = cache.lock().map_err(|_| TableError::Poisoned)?;
            for (key, value, timestamp) in kvs {
                let hash = (self.inner.hasher)(key);
                let cached = cache_guard.get(hash);
                if let Some(cached) = &cached {
                    if cached.value.as_deref() == value.as_deref() {
                        // Idempotent write: the cache already holds this exact value.
                        continue;
                    }
                }
                pending.push(Pending {
                    key,
                    value: value.as_deref(),
                    timestamp: *timestamp,
                    hash,
                    prev_mixed: cached.map(|c| c.mixed_offset),
                });
            }
        }

        if pending.is_empty() {
            return Ok(0);
        }

        // Reverse input order, matching the source's prepend-on-list batch pattern.
        pending.reverse();

        let outbound: Vec<OutboundRecord> = pending
            .iter()
            .map(|p| OutboundRecord {
                key: p.key,
                value: p.value,
                timestamp: p.timestamp,
            })
            .collect();

        let data_topic = self.topic_for(selector, col).to_string();

        let mut state = self.inner.state.write().map_err(|_| TableError::Poisoned)?;

        let append_info = match self.inner.engine.write(&data_topic, &outbound) {
            Ok(info) => info,
            Err(err) => {
                error!(error = %err, topic = %data_topic, "log engine append failed; skipping index update");
                return Ok(0);
            }
        };

        if append_info.num_messages == 0 {
            return Ok(0);
        }

        let expected_last = append_info.first_offset + append_info.num_messages as i64 - 1;
        assert_eq!(
            append_info.last_offset, expected_last,
            "log engine assigned an offset range inconsistent with the batch size"
        );

        if append_info.last_offset >= MAX_RAW_OFFSET {
            error!(
                last_offset = append_info.last_offset,
                topic = %data_topic,
                "raw offset does not fit in 31 bits; refusing to index this batch"
            );
            return Err(TableError::OffsetOverflow {
                topic: data_topic,
                offset: append_info.last_offset,
            });
        }

        let mut index_records = Vec::with_capacity(pending.len());
        {
            let mut cache_guard = cache.lock().map_err(|_| TableError::Poisoned)?;
            for (i, p) in pending.iter().enumerate() {
                let raw_offset = (append_info.first_offset + i as i64) as u32;
                let mixed = to_mixed(selector, raw_offset);

                match p.prev_mixed {
                    Some(prev_mixed) => state.hash_offsets.replace(p.hash, prev_mixed, mixed, col),
                    None => state.hash_offsets.put(p.hash, mixed, col),
                }

                cache_guard.put(
                    p.hash,
                    CacheValue {
                        value: p.value.map(|v| v.to_vec()),
                        timestamp: p.timestamp,
                        mixed_offset: mixed,
                    },
                );

                state.time_index.put(p.timestamp, p.key);

                index_records.push((p.hash, raw_offset as i32));
            }
        }
        drop(state);

        let index_topic = self.index_topic_for(selector, col).to_string();
        let encoded: Vec<(Vec<u8>, Vec<u8>)> = index_records
            .iter()
            .map(|(hash, raw_offset)| (hash.to_be_bytes().to_vec(), raw_offset.to_be_bytes().to_vec()))
            .collect();
        let index_outbound: Vec<OutboundRecord> = encoded
            .iter()
            .map(|(k, v)| OutboundRecord {
                key: k,
                value: Some(v),
                timestamp: -1,
            })
            .collect();

        if let Err(err) = self.inner.engine.write(&index_topic, &index_outbound) {
            error!(error = %err, topic = %index_topic, "failed to append index records");
        }

        Ok(index_records.len())
    }

    /// Removes `keys` from `topic`. Tombstones are always appended to the
    /// post file and always mix with `FileSelector::Post`, regardless of
    /// which file the caller thinks of as current.
    #[instrument(skip(self, keys), fields(topic, batch_size = keys.len()))]
    pub fn remove(&self, keys: &[Vec<u8>], topic: &str) -> Result<usize, TableError> {
        let col = self.column_of(topic)?;
        let cache = &self.inner.caches[col];

        let hashes: Vec<i32> = keys.iter().map(|k| (self.inner.hasher)(k)).collect();
        cache.lock().map_err(|_| TableError::Poisoned)?.remove(&hashes);

        if keys.is_empty() {
            return Ok(0);
        }

        let outbound: Vec<OutboundRecord> = keys
            .iter()
            .map(|k| OutboundRecord {
                key: k,
                value: None,
                timestamp: -1,
            })
            .collect();

        let data_topic = self.topic_for(FileSelector::Post, col).to_string();

        let mut state = self.inner.state.write().map_err(|_| TableError::Poisoned)?;

        let append_info = match self.inner.engine.write(&data_topic, &outbound) {
            Ok(info) => info,
            Err(err) => {
                error!(error = %err, topic = %data_topic, "log engine tombstone append failed");
                return Ok(0);
            }
        };

        if append_info.num_messages == 0 {
            return Ok(0);
        }

        let expected_last = append_info.first_offset + append_info.num_messages as i64 - 1;
        assert_eq!(
            append_info.last_offset, expected_last,
            "log engine assigned an offset range inconsistent with the batch size"
        );

        if append_info.last_offset >= MAX_RAW_OFFSET {
            error!(
                last_offset = append_info.last_offset,
                topic = %data_topic,
                "raw offset does not fit in 31 bits; refusing to index this batch"
            );
            return Err(TableError::OffsetOverflow {
                topic: data_topic,
                offset: append_info.last_offset,
            });
        }

        let mut index_records = Vec::with_capacity(keys.len());
        for (i, hash) in hashes.iter().enumerate() {
            let raw_offset = (append_info.first_offset + i as i64) as u32;
            let mixed = to_mixed(FileSelector::Post, raw_offset);
            // put, not replace: tombstones accumulate onto the existing offset
            // list rather than paying for a read-to-locate during delete.
            state.hash_offsets.put(*hash, mixed, col);
            index_records.push((*hash, raw_offset as i32));
        }
        drop(state);

        let index_topic = self.index_topic_for(FileSelector::Post, col).to_string();
        let encoded: Vec<(Vec<u8>, Vec<u8>)> = index_records
            .iter()
            .map(|(hash, raw_offset)| (hash.to_be_bytes().to_vec(), raw_offset.to_be_bytes().to_vec()))
            .collect();
        let index_outbound: Vec<OutboundRecord> = encoded
            .iter()
            .map(|(k, v)| OutboundRecord {
                key: k,
                value: Some(v),
                timestamp: -1,
            })
            .collect();

        if let Err(err) = self.inner.engine.write(&index_topic, &index_outbound) {
            error!(error = %err, topic = %index_topic, "failed to append tombstone index records");
        }

        Ok(index_records.len())
    }

    /// Streams every record in `topic` from `fetch_offset` onward.
    pub fn iterate_over(
        &self,
        fetch_offset: i64,
        topic: &str,
        mut op: impl FnMut(i64, FetchedRecord),
    ) -> Result<(), TableError> {
        self.column_of(topic)?;
        let _state = self.inner.state.read().map_err(|_| TableError::Poisoned)?;
        self.inner
            .engine
            .iterate_over(topic, fetch_offset, self.inner.config.fetch_max_bytes, &mut |rec| {
                op(rec.offset, rec)
            })?;
        Ok(())
    }

    /// Reads a single batch from `fetch_offset` onward without looping.
    pub fn read_once(
        &self,
        fetch_offset: i64,
        topic: &str,
        mut op: impl FnMut(i64, FetchedRecord),
    ) -> Result<(), TableError> {
        self.column_of(topic)?;
        let _state = self.inner.state.read().map_err(|_| TableError::Poisoned)?;
        self.inner
            .engine
            .read_once(topic, fetch_offset, self.inner.config.fetch_max_bytes, &mut |rec| {
                op(rec.offset, rec)
            })?;
        Ok(())
    }

    /// Returns the most recently written key at `timestamp`, if the table was
    /// opened with `with_time_to_key` and anything was ever written there.
    pub fn get_key_by_time(&self, timestamp: i64) -> Result<Option<Vec<u8>>, TableError> {
        let state = self.inner.state.read().map_err(|_| TableError::Poisoned)?;
        Ok(state.time_index.get(timestamp).map(|k| k.to_vec()))
    }

    /// Directly records `key` as the most recent writer of `timestamp`,
    /// bypassing a full `write`. Used by embedders replaying a time index
    /// from an external source.
    pub fn put_time_to_key(&self, timestamp: i64, key: &[u8]) -> Result<(), TableError> {
        let mut state = self.inner.state.write().map_err(|_| TableError::Poisoned)?;
        state.time_index.put(timestamp, key);
        Ok(())
    }

    pub fn hit_rate(&self, topic: &str) -> Result<f64, TableError> {
        let col = self.column_of(topic)?;
        Ok(self.inner.caches[col].lock().map_err(|_| TableError::Poisoned)?.hit_rate())
    }

    pub fn miss_rate(&self, topic: &str) -> Result<f64, TableError> {
        let col = self.column_of(topic)?;
        Ok(self.inner.caches[col].lock().map_err(|_| TableError::Poisoned)?.miss_rate())
    }

    pub fn read_count(&self, topic: &str) -> Result<u64, TableError> {
        let col = self.column_of(topic)?;
        Ok(self.inner.caches[col].lock().map_err(|_| TableError::Poisoned)?.read_count())
    }

    pub fn reset_hit_rate(&self, topic: &str) -> Result<(), TableError> {
        let col = self.column_of(topic)?;
        self.inner.caches[col].lock().map_err(|_| TableError::Poisoned)?.reset_hit_rate();
        Ok(())
    }
}

fn decode_be_i32(bytes: &[u8]) -> Option<i32> {
    let array: [u8; 4] = bytes.try_into().ok()?;
    Some(i32::from_be_bytes(array))
}

/// Streams `set`'s two index logs (selector 0 then 1) and returns the
/// `(hash, mixed_offset)` pairs to seed `HashOffsets` with.
fn load_column_index<L: LogEngine>(
    engine: &L,
    set: &TopicSet,
    fetch_max_bytes: usize,
) -> Result<Vec<(i32, i32)>, TableError> {
    let mut entries = Vec::new();
    for (selector, index_topic) in [
        (FileSelector::Snapshot, &set.index),
        (FileSelector::Post, &set.index_post),
    ] {
        let mut records = Vec::new();
        engine.iterate_over(index_topic, 0, fetch_max_bytes, &mut |rec| records.push(rec))?;
        for rec in records {
            let hash = rec.key.as_deref().and_then(decode_be_i32);
            let raw_offset = rec.value.as_deref().and_then(decode_be_i32);
            if let (Some(hash), Some(raw_offset)) = (hash, raw_offset) {
                entries.push((hash, to_mixed(selector, raw_offset as u32)));
            }
        }
    }
    Ok(entries)
}

/// Streams column 0's two data logs (selector 0 then 1) and returns the
/// `(timestamp, key)` pairs to seed the time index with.
fn load_time_index<L: LogEngine>(
    engine: &L,
    set0: &TopicSet,
    fetch_max_bytes: usize,
) -> Result<Vec<(i64, Vec<u8>)>, TableError> {
    let mut entries = Vec::new();
    for data_topic in [&set0.name, &set0.post] {
        let mut records = Vec::new();
        engine.iterate_over(data_topic, 0, fetch_max_bytes, &mut |rec| records.push(rec))?;
        for rec in records {
            if rec.has_value {
                if let Some(key) = rec.key {
                    entries.push((rec.timestamp, key));
                }
            }
        }
    }
    Ok(entries)
}
