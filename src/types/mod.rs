//! Core connection types shared across the request pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identity of one data-plane path being established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Named transport technique realizing a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MechanismKind {
    /// Shared-memory packet interface (local IPC).
    Memif,
    /// Any mechanism this endpoint has no built-in support for.
    Other(String),
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memif => f.write_str("memif"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// A transport mechanism selected for a connection.
///
/// Immutable once negotiated; renegotiation requires a new request cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    /// Mechanism type identifier.
    pub kind: MechanismKind,
    /// Mechanism-specific parameters (socket paths, buffer sizes, ...).
    pub params: BTreeMap<String, String>,
}

impl Mechanism {
    /// A mechanism of the given kind with no parameters yet.
    pub fn new(kind: MechanismKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }
}

/// One hop already traversed by the request on its way here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    /// Endpoint name that appended this segment.
    pub name: String,
    /// Per-call credential presented by that endpoint.
    pub token: String,
    /// Expiry of the credential.
    pub expires_at: DateTime<Utc>,
}

/// Negotiation state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Request received, pipeline not yet completed.
    Pending,
    /// Open traversal completed successfully.
    Established,
    /// Close traversal completed.
    Closed,
}

/// Handle to a dataplane interface programmed for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceHandle(pub u32);

impl fmt::Display for InterfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if/{}", self.0)
    }
}

/// The in-flight request/state object for one data-plane path.
///
/// Mutated in place by successive pipeline stages. Owned exclusively by
/// the pipeline executing the current lifecycle event; the caller issues
/// at most one Open or Close per connection id at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Unique identifier.
    pub id: ConnectionId,
    /// Requested transport mechanism, if already selected.
    pub mechanism: Option<Mechanism>,
    /// Key-value labels attached to the request.
    pub labels: BTreeMap<String, String>,
    /// Hops traversed so far, most recent last.
    pub path: Vec<PathSegment>,
    /// Current negotiated state.
    pub state: ConnectionState,
    /// Server-side dataplane interface, set by the bring-up stage.
    pub interface: Option<InterfaceHandle>,
}

impl Connection {
    /// A pending connection requesting the given mechanism.
    pub fn new(mechanism: Mechanism) -> Self {
        Self {
            id: ConnectionId::new(),
            mechanism: Some(mechanism),
            labels: BTreeMap::new(),
            path: Vec::new(),
            state: ConnectionState::Pending,
            interface: None,
        }
    }

    /// Kind of the requested mechanism, if any.
    pub fn mechanism_kind(&self) -> Option<&MechanismKind> {
        self.mechanism.as_ref().map(|m| &m.kind)
    }
}
