//! In-process fallback backend. Lives for the process only.

use super::{BackendError, BackendKind, KeyValueBackend};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
struct Maps {
    values: HashMap<String, Vec<u8>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
}

/// Values and lists behind a single mutex. No await happens while it is held.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Maps>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_maps<T>(&self, f: impl FnOnce(&mut Maps) -> T) -> T {
        let mut g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut g)
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.with_maps(|m| m.values.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.with_maps(|m| {
            m.lists.remove(key);
            m.values.insert(key.to_string(), value.to_vec());
        });
        Ok(())
    }

    async fn rpush_trim(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
    ) -> Result<(), BackendError> {
        self.with_maps(|m| {
            m.values.remove(key);
            let list = m.lists.entry(key.to_string()).or_default();
            list.push_back(value.to_vec());
            while list.len() > max_len {
                list.pop_front();
            }
            if list.is_empty() {
                m.lists.remove(key);
            }
        });
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<Vec<u8>>, BackendError> {
        Ok(self.with_maps(|m| {
            m.lists
                .get(key)
                .map(|l| l.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.with_maps(|m| {
            m.values.remove(key);
            m.lists.remove(key);
        });
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        Ok(self.with_maps(|m| {
            m.values
                .keys()
                .chain(m.lists.keys())
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        }))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
