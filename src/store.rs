//! Key-value persistence seam
//!
//! The engine treats durable storage as an opaque ordered key-value store
//! with point reads, atomic batched writes, and prefix iteration. On-disk
//! layout is the store's concern, not ours.

use std::collections::BTreeMap;

use crate::error::StoreError;

/// One mutation inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Opaque durable store
///
/// `batch_write` must be atomic: either every operation in the batch lands
/// or none does. Implementations are expected to bound each call with their
/// configured deadline and surface expiry as [`StoreError::TimedOut`];
/// callers recover by retrying the same batch.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn batch_write(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// In-memory reference store
///
/// Backs tests and standalone use. `fail_next_batches` simulates storage
/// deadline expiry so the atomic-flush retry path can be exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    fail_batches: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Make the next `n` batch writes fail with a timeout.
    pub fn fail_next_batches(&mut self, n: usize) {
        self.fail_batches = n;
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.get(key).cloned())
    }

    fn batch_write(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if self.fail_batches > 0 {
            self.fail_batches -= 1;
            return Err(StoreError::TimedOut);
        }
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    self.map.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    self.map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_write_and_get() {
        let mut store = MemoryStore::new();
        store
            .batch_write(vec![
                WriteOp::Put {
                    key: b"a/1".to_vec(),
                    value: vec![1],
                },
                WriteOp::Put {
                    key: b"a/2".to_vec(),
                    value: vec![2],
                },
            ])
            .unwrap();

        assert_eq!(store.get(b"a/1").unwrap(), Some(vec![1]));
        assert_eq!(store.get(b"b/1").unwrap(), None);
    }

    #[test]
    fn test_delete_in_batch() {
        let mut store = MemoryStore::new();
        store
            .batch_write(vec![WriteOp::Put {
                key: b"k".to_vec(),
                value: vec![9],
            }])
            .unwrap();
        store
            .batch_write(vec![WriteOp::Delete { key: b"k".to_vec() }])
            .unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_iterate_respects_prefix() {
        let mut store = MemoryStore::new();
        store
            .batch_write(vec![
                WriteOp::Put {
                    key: b"c/1".to_vec(),
                    value: vec![1],
                },
                WriteOp::Put {
                    key: b"c/2".to_vec(),
                    value: vec![2],
                },
                WriteOp::Put {
                    key: b"d/1".to_vec(),
                    value: vec![3],
                },
            ])
            .unwrap();

        let under_c = store.iterate(b"c/").unwrap();
        assert_eq!(under_c.len(), 2);
        assert!(under_c.iter().all(|(k, _)| k.starts_with(b"c/")));
    }

    #[test]
    fn test_injected_timeout_fails_whole_batch() {
        let mut store = MemoryStore::new();
        store.fail_next_batches(1);

        let ops = vec![WriteOp::Put {
            key: b"k".to_vec(),
            value: vec![1],
        }];
        assert_eq!(
            store.batch_write(ops.clone()),
            Err(StoreError::TimedOut)
        );
        // Nothing landed; the same batch succeeds on retry.
        assert_eq!(store.get(b"k").unwrap(), None);
        store.batch_write(ops).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(vec![1]));
    }
}
