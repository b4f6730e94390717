//! Ordered stream lookup keyed by stream-id or push-id.
//!
//! Iteration is ascending by key so the send scheduler's lowest-id-first
//! round is deterministic. The same structure backs both the transfers map
//! (keyed by stream-id) and the promises map (keyed by push-id).

use crate::stream::Stream;
use crate::UserHandle;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct StreamMap {
    inner: BTreeMap<u64, Stream>,
    num_requests: usize,
    num_pushes: usize,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under `key`. Fails when the key is already occupied, since
    /// exactly one stream object may exist per live id.
    pub fn add(&mut self, key: u64, stream: Stream) -> Result<(), Stream> {
        if self.inner.contains_key(&key) {
            return Err(stream);
        }
        if key & 0x2 == 0 {
            self.num_requests += 1;
        } else {
            self.num_pushes += 1;
        }
        self.inner.insert(key, stream);
        Ok(())
    }

    pub fn find(&self, key: u64) -> Option<&Stream> {
        self.inner.get(&key)
    }

    pub fn find_mut(&mut self, key: u64) -> Option<&mut Stream> {
        self.inner.get_mut(&key)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.inner.contains_key(&key)
    }

    pub fn remove(&mut self, key: u64) -> Option<Stream> {
        let stream = self.inner.remove(&key)?;
        if key & 0x2 == 0 {
            self.num_requests -= 1;
        } else {
            self.num_pushes -= 1;
        }
        Some(stream)
    }

    /// Smallest key strictly greater than `prev`, or the smallest key of all
    /// when `prev` is `None`.
    pub fn next_after(&self, prev: Option<u64>) -> Option<u64> {
        match prev {
            None => self.inner.keys().next().copied(),
            Some(p) => self.inner.range(p + 1..).next().map(|(k, _)| *k),
        }
    }

    /// All keys in ascending order.
    pub fn keys(&self) -> Vec<u64> {
        self.inner.keys().copied().collect()
    }

    /// Reverse lookup: the key of the stream carrying `user`.
    pub fn search_user(&self, user: UserHandle) -> Option<u64> {
        self.inner
            .iter()
            .find(|(_, s)| s.user_data == user)
            .map(|(k, _)| *k)
    }

    pub fn find_by_user_mut(&mut self, user: UserHandle) -> Option<&mut Stream> {
        self.inner.values_mut().find(|s| s.user_data == user)
    }

    /// Occupied bidirectional ids (requests).
    pub fn num_requests(&self) -> usize {
        self.num_requests
    }

    /// Occupied unidirectional ids (pushes).
    pub fn num_pushes(&self) -> usize {
        self.num_pushes
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
