//! Network layer: one listening endpoint per node, short-lived outbound
//! connections to peers, the peer-address set, and the liveness pinger.
//!
//! Framing is one request and one reply per connection, each a single JSON
//! object, then the connection closes. Inbound envelopes are dispatched on a
//! worker pool against the current [`Election`] handle, which arrives over a
//! single-element channel and is republished on every leader transition.


use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::config::Timing;
use crate::election::{Election, Status};
use crate::error::NodeError;
use crate::message::{
    AddPeer, Envelope, Heartbeat, Reply, VoteRequest, MAX_MESSAGE_BYTES,
};
use crate::util::lock_then_release;

pub struct Transport {
    addr: String,
    listener: TcpListener,
    peers: Mutex<HashSet<String>>,
    timing: Timing,
}

impl Transport {
    /// Bind the listener immediately. The bound address doubles as the node
    /// identity; a zero port is replaced by the kernel-assigned one.
    pub fn bind(addr: &str, timing: Timing) -> Result<Transport, NodeError> {
        let (host, port) = split_addr(addr)?;
        let listener = TcpListener::bind(addr).map_err(NodeError::Io)?;
        let addr = if port == 0 {
            format!("{}:{}", host, listener.local_addr()?.port())
        } else {
            addr.to_string()
        };
        Ok(Transport {
            addr,
            listener,
            peers: Mutex::new(HashSet::new()),
            timing,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Snapshot of the peer set, sorted for stable iteration.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock_then_release(&self.peers).iter().cloned().collect();
        peers.sort();
        peers
    }

    pub fn peer_count(&self) -> usize {
        lock_then_release(&self.peers).len()
    }

    /// Insert a peer address. The local address is never added and known
    /// addresses collapse; returns whether the set changed.
    pub fn add_peer(&self, addr: &str) -> bool {
        if addr.is_empty() || addr == self.addr {
            return false;
        }
        lock_then_release(&self.peers).insert(addr.to_string())
    }

    pub fn remove_peer(&self, addr: &str) -> bool {
        lock_then_release(&self.peers).remove(addr)
    }

    /// Accept loop. Blocks for the first Election handle, then dispatches
    /// every inbound connection on a worker pool, draining republished
    /// handles between accepts.
    pub fn serve(self: Arc<Self>, elections: Receiver<Arc<Election>>) {
        let mut election = match elections.recv() {
            Ok(election) => election,
            Err(_) => return,
        };

        let pool = match rayon::ThreadPoolBuilder::new()
            .thread_name(|_| "request handler".to_string())
            .num_threads(8)
            .build()
        {
            Ok(pool) => pool,
            Err(err) => {
                panic!("{:?}", err);
            }
        };

        for stream in self.listener.incoming() {
            while let Ok(swapped) = elections.try_recv() {
                election = swapped;
            }
            match stream {
                Ok(stream) => {
                    let transport = Arc::clone(&self);
                    let election = Arc::clone(&election);
                    pool.spawn(move || transport.handle_connection(stream, election));
                }
                Err(err) => {
                    debug!("accept failed: {}", err);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn handle_connection(&self, mut stream: TcpStream, election: Arc<Election>) {
        let _ = stream.set_read_timeout(Some(self.timing.redirect_timeout()));
        let bytes = read_message(&mut stream);
        if bytes.is_empty() {
            return;
        }
        if bytes.len() >= MAX_MESSAGE_BYTES {
            warn!("dropping oversized message ({} bytes)", bytes.len());
            return;
        }
        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed envelope: {}", err);
                return;
            }
        };
        if let Some(reply) = self.dispatch(envelope, &election, &bytes) {
            let _ = stream.write_all(&reply);
        }
    }

    /// Explicit dispatch table keyed by envelope type.
    fn dispatch(
        &self,
        envelope: Envelope,
        election: &Arc<Election>,
        raw: &[u8],
    ) -> Option<Vec<u8>> {
        match envelope {
            Envelope::AddPeer(message) => {
                // reply with the membership as it was before the sender joined
                let known = self.peers();
                self.add_peer(&message.payload);
                debug!("peer {} joined, membership {:?}", message.payload, known);
                if election.status() == Status::Leader {
                    // cover the newcomer without delaying the gossip reply
                    let election = Arc::clone(election);
                    thread::spawn(move || election.start_heartbeat());
                }
                encode(&Reply::AddPeer { payload: known })
            }
            Envelope::Ping => encode(&Reply::Ping {
                is_alive: true,
                addr: self.addr.clone(),
            }),
            Envelope::Heartbeat(heartbeat) => {
                let (term, commit_id) = election.heartbeat_handler(&heartbeat);
                encode(&Reply::Heartbeat { term, commit_id })
            }
            Envelope::VoteRequest(request) => {
                let (choice, term) = election.decide_vote(&request);
                encode(&Reply::VoteRequest { term, choice })
            }
            Envelope::Put(entry) => {
                if election.status() == Status::Leader {
                    let data = match election.handle_put(entry) {
                        Ok(done) => Value::Bool(done),
                        Err(err) => {
                            warn!("put failed: {}", err);
                            Value::Bool(false)
                        }
                    };
                    encode(&Reply::Put { data })
                } else {
                    Some(self.redirect_to_leader(election.leader(), raw))
                }
            }
            Envelope::Get(entry) => {
                if election.status() == Status::Leader {
                    let data = match election.handle_get(entry) {
                        Ok(found) => serde_json::to_value(found).unwrap_or(Value::Null),
                        Err(err) => {
                            warn!("get failed: {}", err);
                            Value::Null
                        }
                    };
                    encode(&Reply::Get { data })
                } else {
                    Some(self.redirect_to_leader(election.leader(), raw))
                }
            }
            Envelope::Delete(entry) => {
                if election.status() == Status::Leader {
                    let data = match election.handle_delete(entry) {
                        Ok(done) => Value::Bool(done),
                        Err(err) => {
                            warn!("delete failed: {}", err);
                            Value::Bool(false)
                        }
                    };
                    encode(&Reply::Delete { data })
                } else {
                    Some(self.redirect_to_leader(election.leader(), raw))
                }
            }
            Envelope::Peers => {
                if election.status() == Status::Leader {
                    encode(&Reply::Peers {
                        peers: self.peers(),
                    })
                } else {
                    Some(self.redirect_to_leader(election.leader(), raw))
                }
            }
        }
    }

    /// Forward a client request verbatim to the current leader and relay its
    /// reply. An unknown or unreachable leader yields the documented
    /// `leader unavailable` payload.
    fn redirect_to_leader(&self, leader: Option<String>, raw: &[u8]) -> Vec<u8> {
        let leader = match leader {
            Some(addr) if addr != self.addr => addr,
            _ => return leader_unavailable(),
        };
        info!("redirecting request to leader at {}", leader);
        match self.exchange(&leader, raw, self.timing.redirect_timeout()) {
            Some(reply) => reply,
            None => leader_unavailable(),
        }
    }

    /// Bootstrap gossip: announce this node to `addr` and union the
    /// returned membership into the local peer set.
    pub fn request_add_peer(&self, addr: &str) {
        let envelope = Envelope::AddPeer(AddPeer {
            payload: self.addr.clone(),
            sender: None,
        });
        match self.request(addr, &envelope, self.timing.request_timeout()) {
            Some(Reply::AddPeer { payload }) => {
                self.add_peer(addr);
                for peer in payload {
                    self.add_peer(&peer);
                }
            }
            _ => info!("could not connect to peer {}", addr),
        }
    }

    /// Liveness pinger: every `interval`, one worker per known peer. A peer
    /// that does not answer is evicted; eviction is idempotent.
    pub fn ping_loop(self: Arc<Self>, interval: Duration) {
        loop {
            let peers = self.peers();
            if peers.is_empty() {
                debug!("no peers to ping");
            }
            for peer in peers {
                let transport = Arc::clone(&self);
                thread::spawn(move || {
                    transport.ping(&peer);
                });
            }
            thread::sleep(interval);
        }
    }

    pub fn ping(&self, peer: &str) -> bool {
        match self.request(peer, &Envelope::Ping, self.timing.request_timeout()) {
            Some(Reply::Ping { is_alive: true, .. }) => true,
            Some(_) => false,
            None => {
                if self.remove_peer(peer) {
                    info!("lost connection to peer {}", peer);
                }
                false
            }
        }
    }

    pub fn heartbeat(&self, peer: &str, message: &Heartbeat) -> Option<(u64, u64)> {
        match self.request(
            peer,
            &Envelope::Heartbeat(message.clone()),
            self.timing.request_timeout(),
        )? {
            Reply::Heartbeat { term, commit_id } => Some((term, commit_id)),
            other => {
                debug!("unexpected heartbeat reply from {}: {:?}", peer, other);
                None
            }
        }
    }

    pub fn vote_request(&self, peer: &str, message: &VoteRequest) -> Option<(u64, bool)> {
        match self.request(
            peer,
            &Envelope::VoteRequest(message.clone()),
            self.timing.request_timeout(),
        )? {
            Reply::VoteRequest { term, choice } => Some((term, choice)),
            other => {
                debug!("unexpected vote reply from {}: {:?}", peer, other);
                None
            }
        }
    }

    /// One typed exchange: serialize, connect, send, read, decode. Any
    /// failure along the way is a no-reply (`None`); callers treat that as a
    /// missing acknowledgement.
    pub fn request(&self, addr: &str, envelope: &Envelope, read_timeout: Duration) -> Option<Reply> {
        let bytes = match serde_json::to_vec(envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("could not encode envelope: {}", err);
                return None;
            }
        };
        let reply = self.exchange(addr, &bytes, read_timeout)?;
        match serde_json::from_slice(&reply) {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!("undecodable reply from {}: {}", addr, err);
                None
            }
        }
    }

    fn exchange(&self, addr: &str, bytes: &[u8], read_timeout: Duration) -> Option<Vec<u8>> {
        let mut stream = self.connect(addr)?;
        let _ = stream.set_read_timeout(Some(read_timeout));
        if stream.write_all(bytes).is_err() {
            debug!("lost connection to {} mid-request", addr);
            return None;
        }
        let _ = stream.shutdown(Shutdown::Write);
        let reply = read_message(&mut stream);
        if reply.is_empty() {
            None
        } else {
            Some(reply)
        }
    }

    /// Open a connection with a bounded timeout. Refused or timed-out
    /// connects evict the target from the peer set.
    fn connect(&self, addr: &str) -> Option<TcpStream> {
        let socket_addr = match addr.to_socket_addrs() {
            Ok(mut addrs) => addrs.next()?,
            Err(err) => {
                debug!("cannot resolve {}: {}", addr, err);
                return None;
            }
        };
        match TcpStream::connect_timeout(&socket_addr, self.timing.request_timeout()) {
            Ok(stream) => {
                let _ = stream.set_write_timeout(Some(self.timing.request_timeout()));
                Some(stream)
            }
            Err(err) => {
                match err.kind() {
                    ErrorKind::ConnectionRefused | ErrorKind::TimedOut => {
                        if self.remove_peer(addr) {
                            info!("removing unreachable peer {}", addr);
                        }
                    }
                    _ => debug!("connect to {} failed: {}", addr, err),
                }
                None
            }
        }
    }
}

fn encode(reply: &Reply) -> Option<Vec<u8>> {
    match serde_json::to_vec(reply) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!("could not encode reply: {}", err);
            None
        }
    }
}

fn leader_unavailable() -> Vec<u8> {
    serde_json::to_vec(&json!({ "data": "leader unavailable" })).unwrap_or_default()
}

fn split_addr(addr: &str) -> Result<(&str, u16), NodeError> {
    let mut parts = addr.rsplitn(2, ':');
    let port = parts.next().unwrap_or_default();
    let host = match parts.next() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(NodeError::InvalidAddr(addr.to_string())),
    };
    match port.parse::<u16>() {
        Ok(port) => Ok((host, port)),
        Err(_) => Err(NodeError::InvalidAddr(addr.to_string())),
    }
}

/// Read one message: loop until EOF, a short read, the bound, or the read
/// timeout. One-message-per-connection framing makes this sufficient.
fn read_message(stream: &mut TcpStream) -> Vec<u8> {
    let mut message = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                message.extend_from_slice(&chunk[..n]);
                if message.len() >= MAX_MESSAGE_BYTES || n < chunk.len() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    message
}
