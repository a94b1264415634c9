//! In-memory store backend.

use std::collections::BTreeMap;

use crate::{Store, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: BTreeMap<(String, String), Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Store for MemoryStore {
    fn put(&mut self, namespace: &str, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.records.insert((namespace.to_string(), id.to_string()), bytes.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, id: &str) -> Result<Vec<u8>, StoreError> {
        self.records
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                id: id.to_string(),
            })
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, id)| id.clone())
            .collect())
    }

    fn delete(&mut self, namespace: &str, id: &str) -> Result<(), StoreError> {
        self.records
            .remove(&(namespace.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                id: id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace;

    #[test]
    fn put_get_list_delete() {
        let mut store = MemoryStore::new();
        store.put(namespace::JOBS, "j2", b"two").unwrap();
        store.put(namespace::JOBS, "j1", b"one").unwrap();
        store.put(namespace::NODES, "n1", b"node").unwrap();

        assert_eq!(store.get(namespace::JOBS, "j1").unwrap(), b"one");
        // Listing is sorted and namespace-scoped.
        assert_eq!(store.list(namespace::JOBS).unwrap(), vec!["j1", "j2"]);

        store.delete(namespace::JOBS, "j1").unwrap();
        assert!(matches!(
            store.get(namespace::JOBS, "j1"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete(namespace::JOBS, "j1"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn put_overwrites() {
        let mut store = MemoryStore::new();
        store.put(namespace::JOBS, "j1", b"a").unwrap();
        store.put(namespace::JOBS, "j1", b"b").unwrap();
        assert_eq!(store.get(namespace::JOBS, "j1").unwrap(), b"b");
        assert_eq!(store.len(), 1);
    }
}
