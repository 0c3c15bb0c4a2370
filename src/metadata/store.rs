//! Store client trait and wire types.
//!
//! The store is modeled after a ZooKeeper-style tree: versioned nodes at
//! slash-separated paths, ephemeral nodes tied to a session, and one-shot
//! recursive subtree watches that must be re-armed after each firing.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

/// Identity of one connection epoch. All ephemeral nodes and listener
/// registrations are scoped to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed by the store when the owning session ends.
    Ephemeral,
}

/// Precondition for a `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteExpectation {
    /// Unconditional upsert; creates a persistent node when absent.
    Any,
    /// Succeeds only if the node exists at exactly this version.
    Version(u64),
}

/// A node's payload together with its write version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub data: Value,
    pub version: u64,
}

/// What happened to the path that fired a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Re-arm handle carried by every fired watch event. Watches are one-shot;
/// pass the token back to [`MetadataStore::rearm`] to observe further
/// changes.
#[derive(Debug, Clone)]
pub struct WatchToken {
    pub prefix: String,
}

/// A single watch firing: the triggering path plus the re-arm token.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: ChangeKind,
    pub token: WatchToken,
}

/// An armed one-shot watch over a subtree.
pub struct SubtreeWatch {
    receiver: oneshot::Receiver<WatchEvent>,
}

impl SubtreeWatch {
    pub fn new(receiver: oneshot::Receiver<WatchEvent>) -> Self {
        Self { receiver }
    }

    /// Wait for the watch to fire. Returns `None` if the store shut down
    /// before any change occurred.
    pub async fn fired(self) -> Option<WatchEvent> {
        self.receiver.await.ok()
    }
}

/// Session lifecycle notifications delivered out-of-band of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Expired(SessionId),
    Closed(SessionId),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unreachable: {message}")]
    Connection { message: String },

    #[error("session {0} expired")]
    SessionExpired(SessionId),

    #[error("version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("no node at {path}")]
    NoNode { path: String },

    #[error("record at {path} could not be decoded: {message}")]
    BadRecord { path: String, message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Client interface to the metadata store.
///
/// Implementations must be linearizable: the version returned by `write` and
/// checked by `WriteExpectation::Version` is the cross-process arbiter for
/// message claims and the leadership marker.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Open a new session. Ephemeral nodes created under it live until the
    /// session is closed or expires.
    async fn create_session(&self) -> StoreResult<SessionId>;

    /// Explicitly end a session, removing its ephemeral nodes.
    async fn close_session(&self, session: SessionId) -> StoreResult<()>;

    async fn is_session_alive(&self, session: SessionId) -> bool;

    /// Create a node. Fails with `NodeExists` when the path is taken.
    /// Intermediate path components are implicit; only leaf nodes carry data.
    async fn create(
        &self,
        path: &str,
        data: Value,
        mode: CreateMode,
        session: SessionId,
    ) -> StoreResult<()>;

    /// Read a node. `Ok(None)` when absent.
    async fn read(&self, path: &str) -> StoreResult<Option<VersionedRecord>>;

    /// Write a node under the given precondition. Returns the new version.
    async fn write(
        &self,
        path: &str,
        data: Value,
        expect: WriteExpectation,
        session: SessionId,
    ) -> StoreResult<u64>;

    /// Delete a node. Deleting an absent node is a no-op.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Names of the direct children of `path`, sorted.
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Arm a one-shot watch over every node at or under `prefix`.
    async fn watch_subtree(&self, prefix: &str) -> StoreResult<SubtreeWatch>;

    /// Re-arm a fired watch from its token.
    async fn rearm(&self, token: WatchToken) -> StoreResult<SubtreeWatch> {
        self.watch_subtree(&token.prefix).await
    }

    /// Subscribe to session expiry/close notifications.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
