//! The narrow interface this crate needs from its log-engine collaborator.
//!
//! Everything about how records are actually persisted, partitioned, or
//! compressed lives on the other side of this trait. `Table` only ever calls
//! these four methods.

use std::backtrace::Backtrace;

/// Result of a successful append.
#[derive(Debug, Clone, Copy)]
pub struct AppendInfo {
    pub first_offset: i64,
    pub last_offset: i64,
    pub num_messages: i32,
}

/// A record handed to the log engine for appending.
///
/// `timestamp < 0` means "no explicit timestamp": the engine embeds the
/// timestamp only when it is `>= 0`.
#[derive(Debug, Clone, Copy)]
pub struct OutboundRecord<'a> {
    pub key: &'a [u8],
    pub value: Option<&'a [u8]>,
    pub timestamp: i64,
}

/// A record as returned by a fetch. `has_value` is carried separately from
/// `value.is_some()` because the log engine's wire format, not this crate,
/// owns the distinction between "no value" and "value of zero length".
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: i64,
    pub has_value: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LogEngineError {
    #[error("log engine I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[error("log engine rejected the append for topic {topic}: {reason}")]
    AppendRejected { topic: String, reason: String },
}

/// External collaborator contract. Implementations need not be internally
/// lock-free; `Table` already serialises its own writers.
pub trait LogEngine: Send + Sync {
    /// Appends `records` to `topic`, in the given order, returning the
    /// contiguous offset range they were assigned.
    fn write(&self, topic: &str, records: &[OutboundRecord]) -> Result<AppendInfo, LogEngineError>;

    /// Fetches a batch of records starting at or before `offset`; the batch
    /// may contain records preceding `offset`; callers scan linearly and
    /// match on exact `record.offset == offset`.
    fn read(&self, topic: &str, offset: i64, max_bytes: usize)
        -> Result<Vec<FetchedRecord>, LogEngineError>;

    /// Streams every record in `topic` from `from_offset` onward, invoking
    /// `op` for each.
    fn iterate_over(
        &self,
        topic: &str,
        from_offset: i64,
        max_bytes: usize,
        op: &mut dyn FnMut(FetchedRecord),
    ) -> Result<(), LogEngineError>;

    /// Reads a single batch from `from_offset` onward, invoking `op` for each
    /// record in that batch only (no looping).
    fn read_once(
        &self,
        topic: &str,
        from_offset: i64,
        max_bytes: usize,
        op: &mut dyn FnMut(FetchedRecord),
    ) -> Result<(), LogEngineError>;
}
