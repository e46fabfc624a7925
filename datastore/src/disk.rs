use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::{Datastore, StorageError};

/// Embedded persistent backend. One sled database lives under
/// `data_dir/<database>`; each namespace maps to a sled tree so namespaces
/// stay independent on disk as well.
pub struct SledStore {
    path: PathBuf,
    db: Option<sled::Db>,
}

impl SledStore {
    pub fn new<P: AsRef<Path>>(data_dir: P, database: &str) -> Self {
        SledStore {
            path: data_dir.as_ref().join(database),
            db: None,
        }
    }

    fn tree(&self, namespace: &str) -> Result<sled::Tree, StorageError> {
        match &self.db {
            Some(db) => Ok(db.open_tree(namespace)?),
            None => Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "datastore used before connect",
            ))),
        }
    }
}

impl Datastore for SledStore {
    fn connect(&mut self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.db = Some(sled::open(&self.path)?);
        Ok(())
    }

    fn put(&mut self, key: &str, value: &Value, namespace: &str) -> Result<bool, StorageError> {
        let tree = self.tree(namespace)?;
        tree.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
        tree.flush().map_err(StorageError::from)?;
        Ok(true)
    }

    fn get(&mut self, key: &str, namespace: &str) -> Result<Option<Value>, StorageError> {
        let tree = self.tree(namespace)?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(&mut self, key: &str, namespace: &str) -> Result<Option<Value>, StorageError> {
        let tree = self.tree(namespace)?;
        let old = tree.remove(key.as_bytes())?;
        tree.flush().map_err(StorageError::from)?;
        match old {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use serde_json::json;

    use crate::disk::SledStore;
    use crate::Datastore;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = env::temp_dir().join(format!("raftkv-datastore-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_sled_store_round_trip() {
        let dir = scratch_dir("round-trip");
        let mut store = SledStore::new(&dir, "test.db");
        store.connect().unwrap();

        store.put("name", &json!("John Doe"), "default").unwrap();
        assert_eq!(
            store.get("name", "default").unwrap(),
            Some(json!("John Doe"))
        );
        assert_eq!(
            store.delete("name", "default").unwrap(),
            Some(json!("John Doe"))
        );
        assert_eq!(store.get("name", "default").unwrap(), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sled_store_namespaces() {
        let dir = scratch_dir("namespaces");
        let mut store = SledStore::new(&dir, "test.db");
        store.connect().unwrap();

        store.put("k", &json!("v1"), "a").unwrap();
        store.put("k", &json!("v2"), "b").unwrap();
        assert_eq!(store.get("k", "a").unwrap(), Some(json!("v1")));
        assert_eq!(store.get("k", "b").unwrap(), Some(json!("v2")));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
