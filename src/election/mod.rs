//! The per-node role state machine: Follower / Candidate / Leader.
//!
//! Every transition funnels through critical sections on one election
//! mutex, so a stale worker observing a changed status or term exits instead
//! of resurrecting a retired role. Long-lived activities owned here: the
//! election timer loop, transient per-peer vote workers while Candidate, and
//! one heartbeat worker per peer while Leader.


use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::config::{Timing, REPLICATION_CHUNK};
use crate::error::NodeError;
use crate::message::{Action, Entry, Heartbeat, Payload, VoteRequest};
use crate::store::Store;
use crate::transport::Transport;
use crate::util::lock_then_release;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Follower,
    Candidate,
    Leader,
}

/// Strict majority of the inclusive cluster; `peer_count` excludes self.
pub fn quorum(peer_count: usize) -> usize {
    (1 + peer_count) / 2 + 1
}

struct ElectionState {
    status: Status,
    term: u64,
    vote_count: usize,
    majority: usize,
    // last observed leader, possibly stale
    leader: Option<String>,
    deadline: Instant,
    // peers currently served by a heartbeat worker
    heartbeat_peers: HashSet<String>,
}

pub struct Election {
    state: Mutex<ElectionState>,
    transport: Arc<Transport>,
    store: Arc<Store>,
    timing: Timing,
    // republished here on every leader transition for the dispatcher
    mailbox: Sender<Arc<Election>>,
}

impl Election {
    /// Build the election state machine and register it on the shared
    /// mailbox the transport dispatcher reads from.
    pub fn new(
        transport: Arc<Transport>,
        store: Arc<Store>,
        timing: Timing,
        mailbox: Sender<Arc<Election>>,
    ) -> Arc<Election> {
        let election = Arc::new(Election {
            state: Mutex::new(ElectionState {
                status: Status::Follower,
                term: 0,
                vote_count: 0,
                majority: 1,
                leader: None,
                deadline: Instant::now() + timing.election_timeout(),
                heartbeat_peers: HashSet::new(),
            }),
            transport,
            store,
            timing,
            mailbox: mailbox.clone(),
        });
        let _ = mailbox.send(Arc::clone(&election));
        election
    }

    pub fn status(&self) -> Status {
        lock_then_release(&self.state).status
    }

    pub fn term(&self) -> u64 {
        lock_then_release(&self.state).term
    }

    pub fn leader(&self) -> Option<String> {
        lock_then_release(&self.state).leader.clone()
    }

    /// Wait out the election deadline and call an election whenever it
    /// expires. Dormant (sleep and recheck) while this node is Leader.
    pub fn timer_loop(self: Arc<Self>) {
        loop {
            let (status, deadline) = {
                let state = lock_then_release(&self.state);
                (state.status, state.deadline)
            };
            if status == Status::Leader {
                thread::sleep(self.timing.heartbeat());
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                Arc::clone(&self).start_election();
            } else {
                thread::sleep(deadline - now);
            }
        }
    }

    /// Become Candidate: bump the term, recompute the majority from the
    /// current peer set, reset the timer, vote for self and solicit the
    /// peers. With an empty peer set the self-vote already carries the
    /// quorum and the node elects itself.
    pub fn start_election(self: Arc<Self>) {
        let peers = self.transport.peers();
        let term = {
            let mut state = lock_then_release(&self.state);
            state.term += 1;
            state.vote_count = 0;
            state.status = Status::Candidate;
            state.majority = quorum(peers.len());
            state.deadline = Instant::now() + self.timing.election_timeout();
            state.term
        };
        info!("starting election for term {}", term);
        Arc::clone(&self).register_vote();
        for peer in peers {
            let election = Arc::clone(&self);
            thread::spawn(move || election.solicit_vote(peer, term));
        }
    }

    /// Ask one peer for its vote, retrying (paced) while this candidacy is
    /// still live. A refusal carrying a higher term steps the node down.
    fn solicit_vote(self: Arc<Self>, peer: String, term: u64) {
        let request = VoteRequest {
            term,
            commit_id: self.store.commit_id(),
            staged: self.store.staged(),
        };
        loop {
            {
                let state = lock_then_release(&self.state);
                if state.status != Status::Candidate || state.term != term {
                    return;
                }
            }
            match self.transport.vote_request(&peer, &request) {
                Some((their_term, choice)) => {
                    debug!("choice from {} is {}", peer, choice);
                    if choice {
                        self.register_vote();
                    } else if their_term > term {
                        let mut state = lock_then_release(&self.state);
                        if their_term > state.term {
                            state.term = their_term;
                        }
                        state.status = Status::Follower;
                        state.deadline = Instant::now() + self.timing.election_timeout();
                    }
                    return;
                }
                None => thread::sleep(self.timing.request_timeout()),
            }
        }
    }

    /// Count one vote; on reaching the majority, take leadership, republish
    /// this Election on the mailbox and start the heartbeats.
    fn register_vote(self: Arc<Self>) {
        let elected = {
            let mut state = lock_then_release(&self.state);
            if state.status != Status::Candidate {
                return;
            }
            state.vote_count += 1;
            if state.vote_count >= state.majority {
                state.status = Status::Leader;
                state.leader = Some(self.transport.addr().to_string());
                Some(state.term)
            } else {
                None
            }
        };
        if let Some(term) = elected {
            info!("elected leader for term {}", term);
            let _ = self.mailbox.try_send(Arc::clone(&self));
            self.start_heartbeat();
        }
    }

    /// Leader entry point: finish any in-flight staged entry under this
    /// term's authority, then cover every peer with a heartbeat worker.
    /// Safe to call repeatedly (e.g. when a peer joins mid-term): peers
    /// already served keep their single worker.
    pub fn start_heartbeat(self: Arc<Self>) {
        if let Some(staged) = self.store.staged() {
            let (term, majority) = self.term_and_majority();
            let replayed = if staged.delete {
                self.store.delete(term, staged, &self.transport, majority)
            } else {
                self.store.put(term, staged, &self.transport, majority)
            };
            if let Err(err) = replayed {
                warn!("could not replay staged entry: {}", err);
            }
        }
        for peer in self.transport.peers() {
            let fresh = {
                let mut state = lock_then_release(&self.state);
                state.status == Status::Leader && state.heartbeat_peers.insert(peer.clone())
            };
            if !fresh {
                continue;
            }
            let election = Arc::clone(&self);
            thread::spawn(move || election.heartbeat_worker(peer));
        }
    }

    /// Beat one follower while Leader: catch its log up first when behind,
    /// then send the steady-state beat. A reply with a higher term steps
    /// this node down. Each round is paced to the heartbeat interval
    /// regardless of round-trip time.
    fn heartbeat_worker(self: Arc<Self>, peer: String) {
        debug!("heartbeat worker for {} started", peer);
        loop {
            let (status, term) = {
                let state = lock_then_release(&self.state);
                (state.status, state.term)
            };
            if status != Status::Leader {
                break;
            }
            let started = Instant::now();

            if self.store.log_len() > 0 {
                self.sync_follower(&peer, term);
            }

            let beat = Heartbeat::beat(term, self.transport.addr());
            if let Some((their_term, _)) = self.transport.heartbeat(&peer, &beat) {
                if their_term > term {
                    info!("peer {} is at term {}, stepping down", peer, their_term);
                    let mut state = lock_then_release(&self.state);
                    if their_term > state.term {
                        state.term = their_term;
                    }
                    state.status = Status::Follower;
                    state.deadline = Instant::now() + self.timing.election_timeout();
                    break;
                }
            }

            let elapsed = started.elapsed();
            let period = self.timing.heartbeat();
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        }
        lock_then_release(&self.state).heartbeat_peers.remove(&peer);
        debug!("heartbeat worker for {} stopped", peer);
    }

    /// Probe the follower's commit id and stream the missing log tail in
    /// batches. Matching is by commit-id prefix only; a diverged follower
    /// log is not detected here.
    fn sync_follower(&self, peer: &str, term: u64) {
        let probe = Heartbeat::beat(term, self.transport.addr());
        let follower_cid = match self.transport.heartbeat(peer, &probe) {
            Some((_, commit_id)) => commit_id,
            None => return,
        };
        let leader_cid = self.store.commit_id();
        if follower_cid >= leader_cid {
            return;
        }
        debug!(
            "follower {} at commit {}, leader at {}, sending tail",
            peer, follower_cid, leader_cid
        );
        let tail = self.store.log_tail(follower_cid);
        for batch in tail.chunks(REPLICATION_CHUNK) {
            let message = Heartbeat {
                term,
                addr: self.transport.addr().to_string(),
                action: Some(Action::Commit),
                payload: Some(Payload::Many(batch.to_vec())),
                commit_id: Some(leader_cid),
            };
            self.transport.heartbeat(peer, &message);
        }
    }

    /// Decide a vote request. The request itself is proof of a live
    /// contacter, so the deadline resets unconditionally. The grant
    /// predicate follows the reference implementation rather than the
    /// standard last-log-term comparison.
    pub fn decide_vote(&self, request: &VoteRequest) -> (bool, u64) {
        let mut state = lock_then_release(&self.state);
        state.deadline = Instant::now() + self.timing.election_timeout();
        let my_commit_id = self.store.commit_id();
        let my_staged = self.store.staged();
        let up_to_date = my_commit_id <= request.commit_id
            && (request.staged.is_some() || my_staged == request.staged);
        if state.term < request.term && up_to_date {
            state.term = request.term;
            (true, state.term)
        } else {
            (false, state.term)
        }
    }

    /// Follower-side heartbeat validation. A term at least our own records
    /// the sender as leader, resets the timer, steps a Candidate or Leader
    /// down, adopts a higher term and delegates any replication action to
    /// the store. Replies with this node's term and commit id.
    pub fn heartbeat_handler(&self, message: &Heartbeat) -> (u64, u64) {
        let (term, accepted) = {
            let mut state = lock_then_release(&self.state);
            if message.term >= state.term {
                state.leader = Some(message.addr.clone());
                state.deadline = Instant::now() + self.timing.election_timeout();
                debug!("got heartbeat from leader {}", message.addr);
                match state.status {
                    Status::Candidate => state.status = Status::Follower,
                    Status::Leader => {
                        state.status = Status::Follower;
                        state.deadline = Instant::now() + self.timing.election_timeout();
                    }
                    Status::Follower => {}
                }
                if state.term < message.term {
                    state.term = message.term;
                }
                (state.term, true)
            } else {
                (state.term, false)
            }
        };
        if accepted && message.action.is_some() {
            if let Err(err) = self.store.action_handler(message) {
                warn!("could not apply replicated action: {}", err);
            }
        }
        (term, self.store.commit_id())
    }

    pub fn handle_put(&self, entry: Entry) -> Result<bool, NodeError> {
        let (term, majority) = self.term_and_majority();
        self.store.put(term, entry, &self.transport, majority)
    }

    pub fn handle_get(&self, entry: Entry) -> Result<Entry, NodeError> {
        self.store.get(entry)
    }

    pub fn handle_delete(&self, entry: Entry) -> Result<bool, NodeError> {
        let (term, majority) = self.term_and_majority();
        self.store.delete(term, entry, &self.transport, majority)
    }

    fn term_and_majority(&self) -> (u64, usize) {
        let state = lock_then_release(&self.state);
        (state.term, state.majority)
    }
}
