//! In-memory ordered store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::{KeyValue, Store, WriteBatch};
use crate::error::StoreError;

/// BTreeMap-backed store; a batch is applied under one write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        data.remove(key);
        Ok(())
    }

    fn prefix(&self, prefix: &[u8]) -> Result<Vec<KeyValue>, StoreError> {
        self.check_open()?;
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.check_open()?;
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        for (key, value) in batch.iter() {
            match value {
                Some(value) => {
                    data.insert(key.to_vec(), value.to_vec());
                }
                None => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
