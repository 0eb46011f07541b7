use crate::error::StorageError;
use std::collections::BTreeMap;

/// One flat string-to-string storage namespace.
pub trait Storage {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&mut self, key: &str) -> Result<(), StorageError>;

    fn clear(&mut self) -> Result<(), StorageError>;

    fn entries(&self) -> BTreeMap<String, String>;
}

/// In-process namespace. With a quota, a write that would push the summed
/// key and value bytes past it is refused and leaves the entry unchanged.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: BTreeMap<String, String>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            quota: Some(quota),
        }
    }

    pub fn from_entries(entries: BTreeMap<String, String>) -> Self {
        Self {
            entries,
            quota: None,
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Some(quota) = self.quota {
            let current = self
                .entries
                .get(key)
                .map_or(0, |old| key.len() + old.len());
            let needed = self.used_bytes() - current + key.len() + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    quota,
                });
            }
        }

        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.entries.clear();
        Ok(())
    }

    fn entries(&self) -> BTreeMap<String, String> {
        self.entries.clone()
    }
}
