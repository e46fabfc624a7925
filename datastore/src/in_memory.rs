use std::collections::HashMap;

use serde_json::Value;

use crate::{Datastore, StorageError};

/// Volatile backend: namespace -> key -> value. Contents are lost on
/// restart; the node's ordered log is the only durable record.
pub struct MemoryStore {
    namespaces: HashMap<String, HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            namespaces: HashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Datastore for MemoryStore {
    fn connect(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn put(&mut self, key: &str, value: &Value, namespace: &str) -> Result<bool, StorageError> {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(HashMap::new)
            .insert(key.to_string(), value.clone());
        Ok(true)
    }

    fn get(&mut self, key: &str, namespace: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn delete(&mut self, key: &str, namespace: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.remove(key)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::in_memory::MemoryStore;
    use crate::Datastore;

    #[test]
    fn test_memory_store() {
        let mut mem = MemoryStore::new();
        mem.connect().unwrap();
        mem.put("key", &json!("xxx"), "default").unwrap();
        assert_eq!(mem.get("key", "default").unwrap(), Some(json!("xxx")));
        assert_eq!(mem.delete("key", "default").unwrap(), Some(json!("xxx")));
        assert_eq!(mem.delete("key", "default").unwrap(), None);
        assert_eq!(mem.get("does not exist", "default").unwrap(), None);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let mut mem = MemoryStore::new();
        mem.put("k", &json!(1), "a").unwrap();
        mem.put("k", &json!(2), "b").unwrap();
        assert_eq!(mem.get("k", "a").unwrap(), Some(json!(1)));
        assert_eq!(mem.get("k", "b").unwrap(), Some(json!(2)));
        mem.delete("k", "a").unwrap();
        assert_eq!(mem.get("k", "a").unwrap(), None);
        assert_eq!(mem.get("k", "b").unwrap(), Some(json!(2)));
    }
}
