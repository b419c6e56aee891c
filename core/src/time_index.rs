//! A growable array from timestamp to the most recently written key.

/// `timeIndex[t] = k` iff `k` was the last key written with timestamp `t`
/// across all columns seen during load or runtime.
pub struct TimeIndex {
    enabled: bool,
    entries: Vec<Option<Vec<u8>>>,
}

impl TimeIndex {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Vec::new(),
        }
    }

    /// Records `key` as the most recent writer of `timestamp`.
    ///
    /// Writes happen unconditionally, even when `enabled` is false: lookups
    /// are gated in `get`, not writes, so turning time-to-key on later sees
    /// a fully populated index rather than a gap.
    pub fn put(&mut self, timestamp: i64, key: &[u8]) {
        if timestamp < 0 {
            return;
        }
        let idx = timestamp as usize;
        if idx >= self.entries.len() {
            let grown = ((self.entries.len() as f64) * 1.2).ceil() as usize;
            let new_len = grown.max(idx + 1);
            self.entries.resize(new_len, None);
        }
        self.entries[idx] = Some(key.to_vec());
    }

    /// Returns the most recently written key at `timestamp`, or `None` if
    /// time-to-key lookups are disabled, `timestamp` is unset, or nothing has
    /// ever been written at that timestamp.
    pub fn get(&self, timestamp: i64) -> Option<&[u8]> {
        if !self.enabled || timestamp < 0 {
            return None;
        }
        self.entries
            .get(timestamp as usize)
            .and_then(|entry| entry.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let mut idx = TimeIndex::new(true);
        idx.put(5, b"x");
        assert_eq!(idx.get(5), Some(&b"x"[..]));
        idx.put(5, b"y");
        assert_eq!(idx.get(5), Some(&b"y"[..]));
    }

    #[test]
    fn disabled_index_never_returns_a_value() {
        let mut idx = TimeIndex::new(false);
        idx.put(5, b"x");
        assert_eq!(idx.get(5), None);
    }

    #[test]
    fn unset_and_out_of_range_timestamps_are_absent() {
        let idx = TimeIndex::new(true);
        assert_eq!(idx.get(-1), None);
        assert_eq!(idx.get(1000), None);
    }

    #[test]
    fn grows_to_fit_large_timestamps_without_losing_earlier_entries() {
        let mut idx = TimeIndex::new(true);
        idx.put(0, b"a");
        idx.put(100, b"b");
        assert_eq!(idx.get(0), Some(&b"a"[..]));
        assert_eq!(idx.get(100), Some(&b"b"[..]));
        assert_eq!(idx.get(50), None);
    }
}
