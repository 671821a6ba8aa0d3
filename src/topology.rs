//! Topology primitives: quorum sets, peer edges and peer URIs.
//!
//! Quorum sets are declared against node *names* and resolved to live
//! `host:port` addresses only when a node starts, so declaration order is
//! decoupled from node creation order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{OrchestratorError, Result};

/// URI scheme spoken by the engine's peer channel.
pub const PEER_SCHEME: &str = "insecure-mcp";

/// A member of a quorum set: either a node referenced by name, or a nested
/// quorum set of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRef {
    Node(String),
    Nested(QuorumSet),
}

impl From<&str> for MemberRef {
    fn from(name: &str) -> Self {
        MemberRef::Node(name.to_string())
    }
}

impl From<String> for MemberRef {
    fn from(name: String) -> Self {
        MemberRef::Node(name)
    }
}

impl From<QuorumSet> for MemberRef {
    fn from(set: QuorumSet) -> Self {
        MemberRef::Nested(set)
    }
}

/// A BFT agreement requirement: `threshold` out of `members` must agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumSet {
    pub threshold: u32,
    pub members: Vec<MemberRef>,
}

impl QuorumSet {
    pub fn new(threshold: u32, members: Vec<MemberRef>) -> Self {
        Self { threshold, members }
    }

    /// Shorthand for the common flat case of plain node names.
    pub fn of_nodes(threshold: u32, names: &[&str]) -> Self {
        Self::new(threshold, names.iter().map(|n| MemberRef::from(*n)).collect())
    }

    /// Resolve node names to live addresses, producing the wire structure
    /// the engine consumes. Fails on an unknown name or on a threshold
    /// exceeding the member count, at any nesting depth.
    pub fn resolve(&self, peer_ports: &BTreeMap<String, u16>) -> Result<ResolvedQuorumSet> {
        if self.threshold as usize > self.members.len() {
            return Err(OrchestratorError::QuorumThreshold {
                threshold: self.threshold,
                members: self.members.len(),
            });
        }

        let mut resolved = Vec::with_capacity(self.members.len());
        for member in &self.members {
            match member {
                MemberRef::Node(name) => {
                    let port = peer_ports
                        .get(name)
                        .ok_or_else(|| OrchestratorError::UnknownNode(name.clone()))?;
                    resolved.push(ResolvedMember::Node(format!("localhost:{}", port)));
                }
                MemberRef::Nested(set) => {
                    resolved.push(ResolvedMember::InnerSet(set.resolve(peer_ports)?));
                }
            }
        }

        Ok(ResolvedQuorumSet {
            threshold: self.threshold,
            members: resolved,
        })
    }
}

/// Resolved quorum set as serialized into the engine's network config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedQuorumSet {
    pub threshold: u32,
    pub members: Vec<ResolvedMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args")]
pub enum ResolvedMember {
    Node(String),
    InnerSet(ResolvedQuorumSet),
}

/// A directed consensus edge. `broadcast_consensus_msgs` distinguishes "I
/// send consensus messages to this node" from "I merely know it is
/// reachable" (e.g. it appears only inside a quorum set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub broadcast_consensus_msgs: bool,
}

impl Peer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            broadcast_consensus_msgs: true,
        }
    }

    pub fn non_broadcast(name: &str) -> Self {
        Self {
            name: name.to_string(),
            broadcast_consensus_msgs: false,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A node's advertised peer address: host, peer port, the base64url
/// fingerprint of its message-signing public key, and whether consensus
/// messages should be broadcast to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUri {
    pub host: String,
    pub port: u16,
    pub consensus_msg_key: String,
    pub broadcast_consensus_msgs: bool,
}

impl fmt::Display for PeerUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}/?consensus-msg-key={}&broadcast-consensus-msgs={}",
            PEER_SCHEME,
            self.host,
            self.port,
            self.consensus_msg_key,
            if self.broadcast_consensus_msgs { "1" } else { "0" },
        )
    }
}

impl FromStr for PeerUri {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || OrchestratorError::InvalidPeerUri(s.to_string());

        let rest = s
            .strip_prefix(PEER_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(invalid)?;
        let (authority, query) = rest.split_once("/?").ok_or_else(invalid)?;
        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;

        let mut consensus_msg_key = None;
        let mut broadcast_consensus_msgs = true;
        for pair in query.split('&') {
            let (name, value) = pair.split_once('=').ok_or_else(invalid)?;
            match name {
                "consensus-msg-key" => consensus_msg_key = Some(value.to_string()),
                "broadcast-consensus-msgs" => {
                    broadcast_consensus_msgs = match value {
                        "1" => true,
                        "0" => false,
                        _ => return Err(invalid()),
                    }
                }
                _ => return Err(invalid()),
            }
        }

        Ok(PeerUri {
            host: host.to_string(),
            port,
            consensus_msg_key: consensus_msg_key.ok_or_else(invalid)?,
            broadcast_consensus_msgs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ports(pairs: &[(&str, u16)]) -> BTreeMap<String, u16> {
        pairs
            .iter()
            .map(|(name, port)| (name.to_string(), *port))
            .collect()
    }

    #[test]
    fn test_resolve_flat_set() {
        let set = QuorumSet::of_nodes(2, &["a", "b", "c"]);
        let resolved = set
            .resolve(&ports(&[("a", 3300), ("b", 3301), ("c", 3302)]))
            .unwrap();

        assert_eq!(resolved.threshold, 2);
        assert_eq!(
            serde_json::to_value(&resolved).unwrap(),
            json!({
                "threshold": 2,
                "members": [
                    { "type": "Node", "args": "localhost:3300" },
                    { "type": "Node", "args": "localhost:3301" },
                    { "type": "Node", "args": "localhost:3302" },
                ],
            })
        );
    }

    #[test]
    fn test_resolve_nested_set() {
        // 2-of-3 where one member is itself a nested 2-of-2.
        let inner = QuorumSet::of_nodes(2, &["c", "d"]);
        let set = QuorumSet::new(2, vec!["a".into(), "b".into(), inner.into()]);
        let resolved = set
            .resolve(&ports(&[("a", 3300), ("b", 3301), ("c", 3302), ("d", 3303)]))
            .unwrap();

        assert_eq!(
            serde_json::to_value(&resolved).unwrap(),
            json!({
                "threshold": 2,
                "members": [
                    { "type": "Node", "args": "localhost:3300" },
                    { "type": "Node", "args": "localhost:3301" },
                    {
                        "type": "InnerSet",
                        "args": {
                            "threshold": 2,
                            "members": [
                                { "type": "Node", "args": "localhost:3302" },
                                { "type": "Node", "args": "localhost:3303" },
                            ],
                        },
                    },
                ],
            })
        );
    }

    #[test]
    fn test_resolve_rejects_excessive_threshold() {
        let set = QuorumSet::of_nodes(3, &["a", "b"]);
        let err = set.resolve(&ports(&[("a", 3300), ("b", 3301)])).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::QuorumThreshold {
                threshold: 3,
                members: 2,
            }
        ));
    }

    #[test]
    fn test_resolve_rejects_nested_excessive_threshold() {
        let inner = QuorumSet::of_nodes(5, &["b"]);
        let set = QuorumSet::new(1, vec!["a".into(), inner.into()]);
        let err = set.resolve(&ports(&[("a", 3300), ("b", 3301)])).unwrap_err();
        assert!(matches!(err, OrchestratorError::QuorumThreshold { .. }));
    }

    #[test]
    fn test_resolve_rejects_unknown_name() {
        let set = QuorumSet::of_nodes(1, &["ghost"]);
        let err = set.resolve(&ports(&[("a", 3300)])).unwrap_err();
        match err {
            OrchestratorError::UnknownNode(name) => assert_eq!(name, "ghost"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_peer_uri_format() {
        let uri = PeerUri {
            host: "localhost".to_string(),
            port: 3301,
            consensus_msg_key: "MCowBQYDK2VwAyEA_test-key_".to_string(),
            broadcast_consensus_msgs: false,
        };
        assert_eq!(
            uri.to_string(),
            "insecure-mcp://localhost:3301/?consensus-msg-key=MCowBQYDK2VwAyEA_test-key_&broadcast-consensus-msgs=0"
        );
    }

    #[test]
    fn test_peer_uri_round_trip() {
        for broadcast in [true, false] {
            let uri = PeerUri {
                host: "localhost".to_string(),
                port: 3305,
                consensus_msg_key: "MCowBQYDK2VwAyEAq83-_0123456789abcdefghijklmno=".to_string(),
                broadcast_consensus_msgs: broadcast,
            };
            let parsed: PeerUri = uri.to_string().parse().unwrap();
            assert_eq!(parsed, uri);
            assert_eq!(parsed.consensus_msg_key, uri.consensus_msg_key);
            assert_eq!(parsed.broadcast_consensus_msgs, broadcast);
        }
    }

    #[test]
    fn test_peer_uri_rejects_garbage() {
        assert!("http://localhost:3300/?consensus-msg-key=x"
            .parse::<PeerUri>()
            .is_err());
        assert!("insecure-mcp://localhost/?consensus-msg-key=x"
            .parse::<PeerUri>()
            .is_err());
        assert!("insecure-mcp://localhost:3300/?broadcast-consensus-msgs=1"
            .parse::<PeerUri>()
            .is_err());
        assert!(
            "insecure-mcp://localhost:3300/?consensus-msg-key=x&broadcast-consensus-msgs=yes"
                .parse::<PeerUri>()
                .is_err()
        );
    }
}
