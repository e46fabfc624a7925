use std::fmt::{Display, Formatter};
use std::io;

use datastore::StorageError;

#[derive(Debug)]
pub enum NodeError {
    Io(io::Error),
    // Envelope or log line failed to (de)serialize
    Codec(serde_json::Error),
    Storage(StorageError),
    // Address string is not host:port
    InvalidAddr(String),
}

impl Display for NodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::Codec(e) => write!(f, "{}", e),
            Self::Storage(e) => write!(f, "{}", e),
            Self::InvalidAddr(addr) => write!(f, "invalid node address {}", addr),
        }
    }
}

impl From<io::Error> for NodeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err)
    }
}

impl From<StorageError> for NodeError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}
