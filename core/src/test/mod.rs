//! An in-memory [`LogEngine`] for this crate's own tests and for embedders
//! exercising `Table` without a real log service on hand.
//!
//! `MemoryLog` makes no attempt at the real service's durability or
//! partitioning story; it only needs to honor the four-method contract
//! faithfully enough to drive `Table` through every code path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::log_engine::{AppendInfo, FetchedRecord, LogEngine, LogEngineError, OutboundRecord};

#[derive(Clone)]
struct StoredRecord {
    offset: i64,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    timestamp: i64,
    has_value: bool,
}

impl StoredRecord {
    fn approx_size(&self) -> usize {
        16 + self.key.as_ref().map_or(0, Vec::len) + self.value.as_ref().map_or(0, Vec::len)
    }

    fn to_fetched(&self) -> FetchedRecord {
        FetchedRecord {
            offset: self.offset,
            key: self.key.clone(),
            value: self.value.clone(),
            timestamp: self.timestamp,
            has_value: self.has_value,
        }
    }
}

/// An in-memory, thread-safe stand-in for the real log engine. Clones share
/// the same underlying topics, so closing and reopening a `Table` over a
/// cloned `MemoryLog` simulates restarting against durable storage.
#[derive(Clone, Default)]
pub struct MemoryLog {
    topics: Arc<Mutex<HashMap<String, Vec<StoredRecord>>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records ever appended to `topic`, for use in assertions.
    pub fn len(&self, topic: &str) -> usize {
        self.topics.lock().unwrap().get(topic).map_or(0, Vec::len)
    }
}

impl LogEngine for MemoryLog {
    fn write(&self, topic: &str, records: &[OutboundRecord]) -> Result<AppendInfo, LogEngineError> {
        let mut topics = self.topics.lock().unwrap();
        let log = topics.entry(topic.to_string()).or_default();

        let first_offset = log.len() as i64;
        for rec in records {
            let offset = log.len() as i64;
            log.push(StoredRecord {
                offset,
                key: Some(rec.key.to_vec()),
                value: rec.value.map(<[u8]>::to_vec),
                timestamp: rec.timestamp,
                has_value: rec.value.is_some(),
            });
        }

        let num_messages = records.len() as i32;
        Ok(AppendInfo {
            first_offset,
            last_offset: first_offset + num_messages as i64 - 1,
            num_messages,
        })
    }

    fn read(
        &self,
        topic: &str,
        offset: i64,
        max_bytes: usize,
    ) -> Result<Vec<FetchedRecord>, LogEngineError> {
        let topics = self.topics.lock().unwrap();
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let start = offset.max(0) as usize;
        if start >= log.len() {
            return Ok(Vec::new());
        }

        let mut batch = Vec::new();
        let mut used = 0usize;
        for rec in &log[start..] {
            if !batch.is_empty() && used + rec.approx_size() > max_bytes {
                break;
            }
            used += rec.approx_size();
            batch.push(rec.to_fetched());
        }
        Ok(batch)
    }

    fn iterate_over(
        &self,
        topic: &str,
        from_offset: i64,
        max_bytes: usize,
        op: &mut dyn FnMut(FetchedRecord),
    ) -> Result<(), LogEngineError> {
        let mut cursor = from_offset;
        loop {
            let batch = self.read(topic, cursor, max_bytes)?;
            if batch.is_empty() {
                return Ok(());
            }
            cursor += batch.len() as i64;
            for rec in batch {
                op(rec);
            }
        }
    }

    fn read_once(
        &self,
        topic: &str,
        from_offset: i64,
        max_bytes: usize,
        op: &mut dyn FnMut(FetchedRecord),
    ) -> Result<(), LogEngineError> {
        for rec in self.read(topic, from_offset, max_bytes)? {
            op(rec);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec<'a>(key: &'a [u8], value: Option<&'a [u8]>, timestamp: i64) -> OutboundRecord<'a> {
        OutboundRecord { key, value, timestamp }
    }

    #[test]
    fn write_assigns_contiguous_offsets() {
        let log = MemoryLog::new();
        let info = log
            .write("t", &[rec(b"a", Some(b"1"), 0), rec(b"b", Some(b"2"), 0)])
            .unwrap();
        assert_eq!(info.first_offset, 0);
        assert_eq!(info.last_offset, 1);
        assert_eq!(info.num_messages, 2);

        let info2 = log.write("t", &[rec(b"c", Some(b"3"), 0)]).unwrap();
        assert_eq!(info2.first_offset, 2);
        assert_eq!(info2.last_offset, 2);
    }

    #[test]
    fn read_finds_the_exact_offset_in_its_batch() {
        let log = MemoryLog::new();
        log.write("t", &[rec(b"a", Some(b"1"), 0), rec(b"b", Some(b"2"), 0)])
            .unwrap();

        let batch = log.read("t", 1, 4096).unwrap();
        assert!(batch.iter().any(|r| r.offset == 1 && r.key.as_deref() == Some(b"b")));
    }

    #[test]
    fn read_past_the_end_is_empty() {
        let log = MemoryLog::new();
        log.write("t", &[rec(b"a", Some(b"1"), 0)]).unwrap();
        assert!(log.read("t", 50, 4096).unwrap().is_empty());
    }

    #[test]
    fn iterate_over_visits_every_record_once() {
        let log = MemoryLog::new();
        log.write(
            "t",
            &[rec(b"a", Some(b"1"), 0), rec(b"b", Some(b"2"), 0), rec(b"c", Some(b"3"), 0)],
        )
        .unwrap();

        let mut seen = Vec::new();
        log.iterate_over("t", 0, 4096, &mut |r| seen.push(r.offset)).unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn cloned_handles_share_state() {
        let a = MemoryLog::new();
        let b = a.clone();
        a.write("t", &[rec(b"a", Some(b"1"), 0)]).unwrap();
        assert_eq!(b.len("t"), 1);
    }
}
