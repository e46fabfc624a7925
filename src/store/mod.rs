//! The replicated state of one node: the ordered log of committed entries,
//! the single in-flight staged entry, the commit index, and the materialized
//! key-value backend.
//!
//! Lock boundaries: the `write_gate` serializes client writes end-to-end.
//! The `state` mutex is taken to stage an entry and snapshot the broadcast
//! message, released for the whole quorum wait so inbound `log`/`commit`
//! handlers can progress, and re-acquired by the commit path.


use std::fs;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;

use datastore::Datastore;

use crate::config::Timing;
use crate::error::NodeError;
use crate::message::{Action, Entry, Heartbeat, Payload};
use crate::transport::Transport;
use crate::util::lock_then_release;

struct StoreState {
    commit_id: u64,
    log: Vec<Entry>,
    staged: Option<Entry>,
    db: Box<dyn Datastore>,
}

pub struct Store {
    state: Mutex<StoreState>,
    // serializes client writes; never held by inbound handlers
    write_gate: Mutex<()>,
    log_path: PathBuf,
    timing: Timing,
}

impl Store {
    /// Open the store: connect the backend, replay the ordered log file and
    /// seed the commit index from its last entry. The backend itself is
    /// assumed to already reflect the logged entries; it is not rebuilt.
    pub fn open(
        mut backend: Box<dyn Datastore>,
        log_path: PathBuf,
        timing: Timing,
    ) -> Result<Store, NodeError> {
        backend.connect()?;
        let log = Self::load(&log_path)?;
        let commit_id = log.last().and_then(|entry| entry.commit_id).unwrap_or(0);
        if commit_id > 0 {
            info!("recovered ordered log at commit id {}", commit_id);
        }
        Ok(Store {
            state: Mutex::new(StoreState {
                commit_id,
                log,
                staged: None,
                db: backend,
            }),
            write_gate: Mutex::new(()),
            log_path,
            timing,
        })
    }

    pub fn commit_id(&self) -> u64 {
        lock_then_release(&self.state).commit_id
    }

    pub fn staged(&self) -> Option<Entry> {
        lock_then_release(&self.state).staged.clone()
    }

    pub fn log_len(&self) -> usize {
        lock_then_release(&self.state).log.len()
    }

    /// Entries with a commit id greater than `after`, in order. This is the
    /// tail a lagging follower is missing.
    pub fn log_tail(&self, after: u64) -> Vec<Entry> {
        lock_then_release(&self.state)
            .log
            .iter()
            .filter(|entry| entry.commit_id.map(|cid| cid > after).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Leader-side write. Stages the entry, broadcasts a `log` envelope to
    /// every peer, waits for quorum, commits, and notifies peers. Returns
    /// false when quorum was not reached within `MAX_LOG_WAIT`.
    pub fn put(
        &self,
        term: u64,
        entry: Entry,
        transport: &Arc<Transport>,
        majority: usize,
    ) -> Result<bool, NodeError> {
        self.replicate(term, entry, false, transport, majority, Duration::from_millis(50))
    }

    /// Leader-side delete. Same path as [`put`](Store::put) with the delete
    /// flag set and a finer quorum poll.
    pub fn delete(
        &self,
        term: u64,
        entry: Entry,
        transport: &Arc<Transport>,
        majority: usize,
    ) -> Result<bool, NodeError> {
        self.replicate(term, entry, true, transport, majority, Duration::from_millis(1))
    }

    /// Read straight from the backend; returns the request with `value`
    /// filled in, an explicit null when the key is absent or tombstoned.
    pub fn get(&self, mut entry: Entry) -> Result<Entry, NodeError> {
        let mut state = lock_then_release(&self.state);
        let namespace = entry.namespace.clone();
        let value = state.db.get(&entry.key, &namespace)?;
        entry.value = Some(value.unwrap_or(Value::Null));
        Ok(entry)
    }

    fn replicate(
        &self,
        term: u64,
        mut entry: Entry,
        delete: bool,
        transport: &Arc<Transport>,
        majority: usize,
        poll: Duration,
    ) -> Result<bool, NodeError> {
        let _gate = lock_then_release(&self.write_gate);
        entry.delete = delete;
        entry.term = Some(term);
        let namespace = entry.namespace.clone();

        let log_message = {
            let mut state = lock_then_release(&self.state);
            state.staged = Some(entry.clone());
            Heartbeat {
                term,
                addr: transport.addr().to_string(),
                action: Some(Action::Log),
                payload: Some(Payload::One(entry.clone())),
                commit_id: Some(state.commit_id),
            }
        };

        let acks = Arc::new(AtomicUsize::new(0));
        for peer in transport.peers() {
            let transport = Arc::clone(transport);
            let message = log_message.clone();
            let acks = Arc::clone(&acks);
            thread::spawn(move || {
                if transport.heartbeat(&peer, &message).is_some() {
                    acks.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let deadline = Instant::now() + self.timing.max_log_wait();
        while acks.load(Ordering::SeqCst) + 1 < majority {
            if Instant::now() >= deadline {
                warn!(
                    "waited {} ms without quorum, update rejected",
                    self.timing.max_log_wait_ms
                );
                lock_then_release(&self.state).staged = None;
                return Ok(false);
            }
            thread::sleep(poll);
        }

        let committed = self.commit(&namespace, delete)?;
        info!("majority reached, committing and notifying peers");

        if let Some(committed) = committed {
            let commit_message = Heartbeat {
                term,
                addr: transport.addr().to_string(),
                action: Some(Action::Commit),
                payload: Some(Payload::One(committed)),
                commit_id: Some(self.commit_id()),
            };
            for peer in transport.peers() {
                let transport = Arc::clone(transport);
                let message = commit_message.clone();
                thread::spawn(move || {
                    transport.heartbeat(&peer, &message);
                });
            }
        }
        Ok(true)
    }

    /// Follower-side entry point for replication commands carried by a
    /// heartbeat: `log` stages the payload, `commit` applies it (or each
    /// entry of a catch-up batch) in order. When a `commit` arrives with an
    /// empty staged slot the payload is adopted first — the recovery path
    /// for a missed `log` message.
    pub fn action_handler(&self, message: &Heartbeat) -> Result<(), NodeError> {
        let action = match message.action {
            Some(action) => action,
            None => return Ok(()),
        };
        let payload = match &message.payload {
            Some(payload) => payload,
            None => return Ok(()),
        };

        let mut state = lock_then_release(&self.state);
        match action {
            Action::Log => match payload {
                Payload::One(entry) => {
                    debug!("staging entry for key {}", entry.key);
                    state.staged = Some(entry.clone());
                }
                Payload::Many(_) => debug!("ignoring batched log action"),
            },
            Action::Commit => {
                for entry in payload.entries() {
                    let namespace = entry.namespace.clone();
                    let delete = entry.delete;
                    if Self::already_committed(&state, &entry) {
                        debug!("skipping duplicate commit for key {}", entry.key);
                        continue;
                    }
                    if state.staged.is_none() {
                        state.staged = Some(Entry {
                            commit_id: None,
                            ..entry.clone()
                        });
                    }
                    Self::commit_locked(&mut state, &self.log_path, &namespace, delete)?;
                }
            }
        }
        Ok(())
    }

    /// Commit the staged entry: stamp the next commit id, append it to the
    /// ordered log (memory and disk), apply it to the backend and clear the
    /// staged slot.
    fn commit(&self, namespace: &str, delete: bool) -> Result<Option<Entry>, NodeError> {
        let mut state = lock_then_release(&self.state);
        Self::commit_locked(&mut state, &self.log_path, namespace, delete)
    }

    fn commit_locked(
        state: &mut StoreState,
        log_path: &Path,
        namespace: &str,
        delete: bool,
    ) -> Result<Option<Entry>, NodeError> {
        let mut entry = match state.staged.take() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        state.commit_id += 1;
        entry.commit_id = Some(state.commit_id);
        if !state.log.contains(&entry) {
            Self::persist(log_path, &entry)?;
            state.log.push(entry.clone());
        }
        if delete {
            state.db.delete(&entry.key, namespace)?;
            debug!("committed delete of {} as {}", entry.key, state.commit_id);
        } else {
            let value = entry.value.clone().unwrap_or(Value::Null);
            state.db.put(&entry.key, &value, namespace)?;
            debug!("committed put of {} as {}", entry.key, state.commit_id);
        }
        Ok(Some(entry))
    }

    fn already_committed(state: &StoreState, entry: &Entry) -> bool {
        let cid = match entry.commit_id {
            Some(cid) => cid,
            None => return false,
        };
        cid <= state.commit_id
            && state.log.iter().any(|logged| {
                logged.commit_id == Some(cid)
                    && logged.key == entry.key
                    && logged.value == entry.value
                    && logged.namespace == entry.namespace
                    && logged.delete == entry.delete
            })
    }

    fn persist(log_path: &Path, entry: &Entry) -> Result<(), NodeError> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn load(log_path: &Path) -> Result<Vec<Entry>, NodeError> {
        if !log_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(log_path)?);
        let mut log = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            log.push(serde_json::from_str(&line)?);
        }
        Ok(log)
    }
}
