//! Message types exchanged between the supervisor and workers
//!
//! Two layers exist. [`MeshMessage`] is the serializable envelope that travels
//! over broadcast-mesh edges; its tag set is closed but versionable, and
//! receivers must treat unknown tags as a no-op so that a supervisor and
//! workers built from slightly different versions stay compatible.
//! [`Envelope`] is the in-process control channel from the supervisor to one
//! worker; it carries resources that cannot be serialized (mesh ports, socket
//! descriptors) and therefore never crosses a process boundary.

use serde::{Deserialize, Serialize};

use crate::pool::mesh::MeshPort;
use crate::pool::WorkerId;

/// A message traveling over a broadcast-mesh edge.
///
/// Serialized with a `type` tag in kebab-case. Unrecognized tags deserialize
/// to [`MeshMessage::Unknown`] and are ignored by receivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MeshMessage {
    /// Ask the receiver to stop serving and exit.
    Shutdown,
    /// Ask the supervisor to roll the sender's worker group.
    RestartRequest,
    /// Application-defined payload fanned out to every participant.
    Broadcast { payload: serde_json::Value },
    /// Any tag this build does not know about.
    #[serde(other)]
    Unknown,
}

/// Control messages delivered to a single worker over its supervisor channel.
pub enum Envelope {
    /// Graceful shutdown requested by the supervisor.
    Shutdown,
    /// Immediate termination requested from inside the worker itself
    /// (fatal internal error). Exits without graceful-shutdown semantics.
    Terminate,
    /// A new mesh edge to wire in: another participant joined after this one.
    AddedPort(MeshPort),
    /// An accepted connection handed off by the router. `prefix` holds any
    /// bytes the router consumed while making its routing decision; they
    /// belong to the stream and must be replayed before reading from it.
    Connection {
        stream: std::net::TcpStream,
        prefix: Vec<u8>,
    },
    /// A mesh message forwarded from one of this worker's edges.
    Mesh {
        from: WorkerId,
        message: MeshMessage,
    },
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Envelope::Shutdown => write!(f, "Shutdown"),
            Envelope::Terminate => write!(f, "Terminate"),
            Envelope::AddedPort(port) => write!(f, "AddedPort(peer={})", port.peer),
            Envelope::Connection { prefix, .. } => {
                write!(f, "Connection(prefix={} bytes)", prefix.len())
            }
            Envelope::Mesh { from, message } => write!(f, "Mesh(from={}, {:?})", from, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_message_tags_are_kebab_case() {
        let json = serde_json::to_value(&MeshMessage::RestartRequest).unwrap();
        assert_eq!(json["type"], "restart-request");

        let json = serde_json::to_value(&MeshMessage::Shutdown).unwrap();
        assert_eq!(json["type"], "shutdown");
    }

    #[test]
    fn test_broadcast_round_trip() {
        let msg = MeshMessage::Broadcast {
            payload: serde_json::json!({"cmd": "flush"}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: MeshMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_unknown_tag_is_tolerated() {
        // A tag from a newer build must deserialize, not fail.
        let msg: MeshMessage =
            serde_json::from_str(r#"{"type": "rebalance-shards"}"#).unwrap();
        assert_eq!(msg, MeshMessage::Unknown);
    }
}
