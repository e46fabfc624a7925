//! Pluggable storage backends for the replicated key-value node.
//!
//! The node applies committed log entries to a [`Datastore`]. Two backends
//! are provided: [`in_memory::MemoryStore`], a plain map, and
//! [`disk::SledStore`], an embedded store that survives restarts. Keys live
//! inside namespaces; each namespace is materialized independently.

pub mod disk;
pub mod in_memory;

use std::fmt::{Display, Formatter};
use std::io;

use serde_json::Value;

pub trait Datastore: Send {
    /// Open or initialize the backend. Called once before any other method.
    fn connect(&mut self) -> Result<(), StorageError>;

    fn put(&mut self, key: &str, value: &Value, namespace: &str) -> Result<bool, StorageError>;

    fn get(&mut self, key: &str, namespace: &str) -> Result<Option<Value>, StorageError>;

    /// Remove a key and return the value it held, if any.
    fn delete(&mut self, key: &str, namespace: &str) -> Result<Option<Value>, StorageError>;
}

#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    // Stored bytes did not decode back into a value
    Codec(serde_json::Error),
    Backend(sled::Error),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::Codec(e) => write!(f, "{}", e),
            Self::Backend(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err)
    }
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        Self::Backend(err)
    }
}
