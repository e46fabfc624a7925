//! Top-level composition: Store, Transport, Election, and the background
//! activities that drive them.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use log::info;

use datastore::disk::SledStore;
use datastore::in_memory::MemoryStore;
use datastore::Datastore;

use crate::config::Timing;
use crate::election::Election;
use crate::error::NodeError;
use crate::store::Store;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Database,
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Bind address and node identity, `host:port`.
    pub addr: String,
    /// Bootstrap peers to announce this node to.
    pub peers: Vec<String>,
    /// Interval between liveness-ping rounds.
    pub ping_interval: Duration,
    pub backend: Backend,
    /// Database name for the persistent backend.
    pub database: String,
    /// Root directory for the ordered log and database files.
    pub data_dir: PathBuf,
    /// Ordered-log file name inside the data directory.
    pub log_filename: String,
    pub timing: Timing,
}

impl NodeConfig {
    /// Defaults with environment overrides applied (`DATA_DIR`,
    /// `LOG_FILENAME`, `DATA_FILENAME` and the timing variables).
    pub fn new<A: Into<String>>(addr: A) -> Self {
        NodeConfig {
            addr: addr.into(),
            peers: Vec::new(),
            ping_interval: Duration::from_secs(1),
            backend: Backend::Memory,
            database: env::var("DATA_FILENAME").unwrap_or_else(|_| "default.db".to_string()),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string())),
            log_filename: env::var("LOG_FILENAME").unwrap_or_else(|_| "ordered.log".to_string()),
            timing: Timing::from_env(),
        }
    }
}

pub struct Node {
    transport: Arc<Transport>,
    store: Arc<Store>,
    election: Arc<Election>,
    elections: Receiver<Arc<Election>>,
    bootstrap: Vec<String>,
    ping_interval: Duration,
}

impl Node {
    /// Construction order matters: the store recovers its log first, the
    /// transport binds the listener immediately, and the election registers
    /// itself on the mailbox the dispatcher will read.
    pub fn new(config: NodeConfig) -> Result<Node, NodeError> {
        let backend: Box<dyn Datastore> = match config.backend {
            Backend::Memory => Box::new(MemoryStore::new()),
            Backend::Database => Box::new(SledStore::new(&config.data_dir, &config.database)),
        };
        let log_path = config.data_dir.join(&config.log_filename);
        let store = Arc::new(Store::open(backend, log_path, config.timing)?);
        let transport = Arc::new(Transport::bind(&config.addr, config.timing)?);
        let (mailbox, elections) = bounded(1);
        let election = Election::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            config.timing,
            mailbox,
        );
        Ok(Node {
            transport,
            store,
            election,
            elections,
            bootstrap: config.peers,
            ping_interval: config.ping_interval,
        })
    }

    /// Spawn the background activities: serve loop, liveness pinger,
    /// bootstrap gossip, election timer. Returns immediately.
    pub fn run(&self) {
        info!("starting transport on {}", self.transport.addr());
        let transport = Arc::clone(&self.transport);
        let elections = self.elections.clone();
        thread::spawn(move || transport.serve(elections));

        let transport = Arc::clone(&self.transport);
        let interval = self.ping_interval;
        thread::spawn(move || transport.ping_loop(interval));

        info!("adding peers");
        for peer in self.bootstrap.clone() {
            let transport = Arc::clone(&self.transport);
            thread::spawn(move || transport.request_add_peer(&peer));
        }

        info!("initializing election timeout");
        let election = Arc::clone(&self.election);
        thread::spawn(move || election.timer_loop());
    }

    pub fn addr(&self) -> &str {
        self.transport.addr()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn election(&self) -> &Arc<Election> {
        &self.election
    }
}
