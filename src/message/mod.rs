//! Wire envelopes exchanged between nodes and with clients.
//!
//! Every exchange is one UTF-8 JSON object each way over a fresh TCP
//! connection. Objects are tagged by a `type` field; inbound traffic decodes
//! as [`Envelope`], responses as [`Reply`]. The receive bound is
//! [`MAX_MESSAGE_BYTES`] per message — larger than the historical 1024 so a
//! full catch-up batch of entries fits in one heartbeat.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard bound on a single wire message. Exceeding it is a protocol error.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

pub const DEFAULT_NAMESPACE: &str = "default";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// A client write or delete, and the unit the replicated log is made of.
///
/// The same record flows through the whole pipeline: client request, staged
/// slot, `log`/`commit` payload, and finally a committed log entry with
/// `commit_id` and `term` stamped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
}

impl Entry {
    pub fn new<K: Into<String>>(key: K, value: Option<Value>) -> Self {
        Entry {
            key: key.into(),
            value,
            namespace: default_namespace(),
            delete: false,
            commit_id: None,
            term: None,
        }
    }
}

/// Replication sub-command carried by a heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Stage the payload; do not apply yet.
    Log,
    /// Commit the payload (a single entry, or a catch-up batch).
    Commit,
}

/// Heartbeat payload: a single in-flight entry or a batched log tail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    One(Entry),
    Many(Vec<Entry>),
}

impl Payload {
    pub fn entries(&self) -> Vec<Entry> {
        match self {
            Payload::One(entry) => vec![entry.clone()],
            Payload::Many(entries) => entries.clone(),
        }
    }
}

/// The leader's periodic beat; doubles as the carrier for log replication
/// (`action: log`) and commit notification (`action: commit`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub term: u64,
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<u64>,
}

impl Heartbeat {
    /// A steady-state beat with no replication command attached.
    pub fn beat(term: u64, addr: &str) -> Self {
        Heartbeat {
            term,
            addr: addr.to_string(),
            action: None,
            payload: None,
            commit_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub commit_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<Entry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddPeer {
    /// Address of the node asking to be added.
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Everything a node can receive, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    AddPeer(AddPeer),
    Ping,
    Heartbeat(Heartbeat),
    VoteRequest(VoteRequest),
    Put(Entry),
    Get(Entry),
    Delete(Entry),
    Peers,
}

/// Everything a node can answer with, tagged by `type` like the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    AddPeer { payload: Vec<String> },
    Ping { is_alive: bool, addr: String },
    Heartbeat { term: u64, commit_id: u64 },
    VoteRequest { term: u64, choice: bool },
    Put { data: Value },
    Get { data: Value },
    Delete { data: Value },
    Peers { peers: Vec<String> },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn round_trip_envelope(envelope: Envelope) {
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope, back);
    }

    fn round_trip_reply(reply: Reply) {
        let bytes = serde_json::to_vec(&reply).unwrap();
        let back: Reply = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply, back);
    }

    #[test]
    fn envelopes_round_trip() {
        round_trip_envelope(Envelope::AddPeer(AddPeer {
            payload: "127.0.0.1:5000".into(),
            sender: Some("127.0.0.1:5001".into()),
        }));
        round_trip_envelope(Envelope::Ping);
        round_trip_envelope(Envelope::Heartbeat(Heartbeat::beat(3, "127.0.0.1:5000")));
        round_trip_envelope(Envelope::Heartbeat(Heartbeat {
            term: 3,
            addr: "127.0.0.1:5000".into(),
            action: Some(Action::Commit),
            payload: Some(Payload::Many(vec![Entry::new("a", Some(json!(1)))])),
            commit_id: Some(7),
        }));
        round_trip_envelope(Envelope::VoteRequest(VoteRequest {
            term: 5,
            commit_id: 2,
            staged: Some(Entry::new("name", Some(json!("John Doe")))),
        }));
        round_trip_envelope(Envelope::Put(Entry::new("name", Some(json!("John Doe")))));
        round_trip_envelope(Envelope::Get(Entry::new("name", None)));
        round_trip_envelope(Envelope::Delete(Entry::new("name", None)));
        round_trip_envelope(Envelope::Peers);
    }

    #[test]
    fn replies_round_trip() {
        round_trip_reply(Reply::AddPeer {
            payload: vec!["127.0.0.1:5001".into()],
        });
        round_trip_reply(Reply::Ping {
            is_alive: true,
            addr: "127.0.0.1:5000".into(),
        });
        round_trip_reply(Reply::Heartbeat {
            term: 3,
            commit_id: 9,
        });
        round_trip_reply(Reply::VoteRequest {
            term: 4,
            choice: false,
        });
        round_trip_reply(Reply::Put { data: json!(true) });
        round_trip_reply(Reply::Get {
            data: json!({"key": "name", "value": "John Doe"}),
        });
        round_trip_reply(Reply::Delete { data: json!(true) });
        round_trip_reply(Reply::Peers {
            peers: vec!["127.0.0.1:5001".into(), "127.0.0.1:5002".into()],
        });
    }

    #[test]
    fn client_request_fills_defaults() {
        let raw = r#"{"type": "put", "key": "name", "value": "John Doe"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        match envelope {
            Envelope::Put(entry) => {
                assert_eq!(entry.key, "name");
                assert_eq!(entry.value, Some(json!("John Doe")));
                assert_eq!(entry.namespace, DEFAULT_NAMESPACE);
                assert!(!entry.delete);
                assert_eq!(entry.commit_id, None);
            }
            other => panic!("decoded as {:?}", other),
        }
    }

    #[test]
    fn batched_payload_decodes_as_list() {
        let raw = r#"{
            "term": 2, "addr": "127.0.0.1:5000", "action": "commit",
            "payload": [{"key": "a", "value": 1, "namespace": "default", "commit_id": 1},
                        {"key": "b", "value": 2, "namespace": "default", "commit_id": 2}],
            "commit_id": 2
        }"#;
        let hb: Heartbeat = serde_json::from_str(raw).unwrap();
        assert_eq!(hb.action, Some(Action::Commit));
        assert_eq!(hb.payload.unwrap().entries().len(), 2);
    }
}
