//! In-process reference implementation of [`MetadataStore`].
//!
//! Backs the integration tests and single-host deployments. Linearizability
//! falls out of a single tree lock; watch and session semantics follow the
//! trait contract: one-shot subtree watches, ephemeral nodes removed on
//! session end, expiry observable through the session event channel.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use async_trait::async_trait;

use super::store::{
    ChangeKind, CreateMode, MetadataStore, SessionEvent, SessionId, StoreError, StoreResult,
    SubtreeWatch, VersionedRecord, WatchEvent, WatchToken, WriteExpectation,
};

#[derive(Debug, Clone)]
struct Node {
    data: Value,
    version: u64,
    ephemeral_owner: Option<SessionId>,
}

struct WatchEntry {
    prefix: String,
    sender: oneshot::Sender<WatchEvent>,
}

pub struct MemoryStore {
    tree: RwLock<BTreeMap<String, Node>>,
    sessions: RwLock<HashSet<SessionId>>,
    watches: Mutex<Vec<WatchEntry>>,
    session_tx: broadcast::Sender<SessionEvent>,
    next_session: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (session_tx, _) = broadcast::channel(256);
        Self {
            tree: RwLock::new(BTreeMap::new()),
            sessions: RwLock::new(HashSet::new()),
            watches: Mutex::new(Vec::new()),
            session_tx,
            next_session: AtomicU64::new(1),
        }
    }

    /// Force-expire a session, as the real store would after missed
    /// heartbeats. Ephemeral nodes are removed and an `Expired` event is
    /// broadcast. Test harnesses drive session-recovery scenarios with this.
    pub fn expire_session(&self, session: SessionId) {
        let existed = self.sessions.write().remove(&session);
        if existed {
            self.purge_ephemerals(session);
            let _ = self.session_tx.send(SessionEvent::Expired(session));
        }
    }

    fn purge_ephemerals(&self, session: SessionId) {
        let removed: Vec<String> = {
            let mut tree = self.tree.write();
            let doomed: Vec<String> = tree
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &doomed {
                tree.remove(path);
            }
            doomed
        };
        for path in removed {
            self.fire_watches(&path, ChangeKind::Deleted);
        }
    }

    fn session_alive(&self, session: SessionId) -> bool {
        self.sessions.read().contains(&session)
    }

    fn require_session(&self, session: SessionId) -> StoreResult<()> {
        if self.session_alive(session) {
            Ok(())
        } else {
            Err(StoreError::SessionExpired(session))
        }
    }

    fn fire_watches(&self, path: &str, kind: ChangeKind) {
        let mut watches = self.watches.lock();
        let mut remaining = Vec::with_capacity(watches.len());
        for entry in watches.drain(..) {
            if covers(&entry.prefix, path) {
                let event = WatchEvent {
                    path: path.to_string(),
                    kind,
                    token: WatchToken {
                        prefix: entry.prefix.clone(),
                    },
                };
                // Receiver may already be gone; nothing to re-arm then.
                let _ = entry.sender.send(event);
            } else {
                remaining.push(entry);
            }
        }
        *watches = remaining;
    }
}

fn covers(prefix: &str, path: &str) -> bool {
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_session(&self) -> StoreResult<SessionId> {
        let session = SessionId::new(self.next_session.fetch_add(1, Ordering::SeqCst));
        self.sessions.write().insert(session);
        Ok(session)
    }

    async fn close_session(&self, session: SessionId) -> StoreResult<()> {
        let existed = self.sessions.write().remove(&session);
        if existed {
            self.purge_ephemerals(session);
            let _ = self.session_tx.send(SessionEvent::Closed(session));
        }
        Ok(())
    }

    async fn is_session_alive(&self, session: SessionId) -> bool {
        self.session_alive(session)
    }

    async fn create(
        &self,
        path: &str,
        data: Value,
        mode: CreateMode,
        session: SessionId,
    ) -> StoreResult<()> {
        self.require_session(session)?;
        {
            let mut tree = self.tree.write();
            if tree.contains_key(path) {
                return Err(StoreError::NodeExists {
                    path: path.to_string(),
                });
            }
            tree.insert(
                path.to_string(),
                Node {
                    data,
                    version: 0,
                    ephemeral_owner: match mode {
                        CreateMode::Ephemeral => Some(session),
                        CreateMode::Persistent => None,
                    },
                },
            );
        }
        self.fire_watches(path, ChangeKind::Created);
        Ok(())
    }

    async fn read(&self, path: &str) -> StoreResult<Option<VersionedRecord>> {
        Ok(self.tree.read().get(path).map(|node| VersionedRecord {
            data: node.data.clone(),
            version: node.version,
        }))
    }

    async fn write(
        &self,
        path: &str,
        data: Value,
        expect: WriteExpectation,
        session: SessionId,
    ) -> StoreResult<u64> {
        self.require_session(session)?;
        let (version, kind) = {
            let mut tree = self.tree.write();
            match (tree.get_mut(path), expect) {
                (Some(node), WriteExpectation::Any) => {
                    node.data = data;
                    node.version += 1;
                    (node.version, ChangeKind::Updated)
                }
                (Some(node), WriteExpectation::Version(expected)) => {
                    if node.version != expected {
                        return Err(StoreError::BadVersion {
                            path: path.to_string(),
                            expected,
                            actual: node.version,
                        });
                    }
                    node.data = data;
                    node.version += 1;
                    (node.version, ChangeKind::Updated)
                }
                (None, WriteExpectation::Any) => {
                    tree.insert(
                        path.to_string(),
                        Node {
                            data,
                            version: 0,
                            ephemeral_owner: None,
                        },
                    );
                    (0, ChangeKind::Created)
                }
                (None, WriteExpectation::Version(_)) => {
                    return Err(StoreError::NoNode {
                        path: path.to_string(),
                    });
                }
            }
        };
        self.fire_watches(path, kind);
        Ok(version)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let removed = self.tree.write().remove(path).is_some();
        if removed {
            self.fire_watches(path, ChangeKind::Deleted);
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let prefix = format!("{path}/");
        let tree = self.tree.read();
        let names: BTreeSet<String> = tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| {
                let rest = &key[prefix.len()..];
                match rest.find('/') {
                    Some(idx) => rest[..idx].to_string(),
                    None => rest.to_string(),
                }
            })
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn watch_subtree(&self, prefix: &str) -> StoreResult<SubtreeWatch> {
        let (sender, receiver) = oneshot::channel();
        self.watches.lock().push(WatchEntry {
            prefix: prefix.to_string(),
            sender,
        });
        Ok(SubtreeWatch::new(receiver))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_read_write_delete() {
        let store = MemoryStore::new();
        let session = store.create_session().await.unwrap();

        store
            .create("/c/a", json!({"v": 1}), CreateMode::Persistent, session)
            .await
            .unwrap();
        let record = store.read("/c/a").await.unwrap().unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.data, json!({"v": 1}));

        let v = store
            .write("/c/a", json!({"v": 2}), WriteExpectation::Version(0), session)
            .await
            .unwrap();
        assert_eq!(v, 1);

        let err = store
            .write("/c/a", json!({"v": 3}), WriteExpectation::Version(0), session)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BadVersion { .. }));

        store.delete("/c/a").await.unwrap();
        assert!(store.read("/c/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_children_are_direct_only() {
        let store = MemoryStore::new();
        let session = store.create_session().await.unwrap();
        for path in ["/c/x/1", "/c/x/2", "/c/x/2/deep", "/c/y"] {
            store
                .create(path, json!(null), CreateMode::Persistent, session)
                .await
                .unwrap();
        }
        assert_eq!(store.children("/c/x").await.unwrap(), vec!["1", "2"]);
        assert_eq!(store.children("/c").await.unwrap(), vec!["x", "y"]);
        assert!(store.children("/c/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ephemeral_removed_on_expiry_and_watch_fires() {
        let store = MemoryStore::new();
        let session = store.create_session().await.unwrap();
        store
            .create("/c/live/n1", json!("up"), CreateMode::Ephemeral, session)
            .await
            .unwrap();

        let watch = store.watch_subtree("/c/live").await.unwrap();
        let mut events = store.session_events();

        store.expire_session(session);

        let fired = watch.fired().await.unwrap();
        assert_eq!(fired.path, "/c/live/n1");
        assert_eq!(fired.kind, ChangeKind::Deleted);
        assert_eq!(fired.token.prefix, "/c/live");
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired(session));
        assert!(store.read("/c/live/n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_is_one_shot() {
        let store = MemoryStore::new();
        let session = store.create_session().await.unwrap();
        let watch = store.watch_subtree("/c").await.unwrap();

        store
            .create("/c/a", json!(1), CreateMode::Persistent, session)
            .await
            .unwrap();
        let first = watch.fired().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Created);

        // A second change with no armed watch is not buffered anywhere.
        store
            .write("/c/a", json!(2), WriteExpectation::Any, session)
            .await
            .unwrap();
        let rearmed = store.rearm(first.token).await.unwrap();
        store
            .write("/c/a", json!(3), WriteExpectation::Any, session)
            .await
            .unwrap();
        let second = rearmed.fired().await.unwrap();
        assert_eq!(second.kind, ChangeKind::Updated);
    }

    #[tokio::test]
    async fn test_write_with_dead_session_rejected() {
        let store = MemoryStore::new();
        let session = store.create_session().await.unwrap();
        store.expire_session(session);
        let err = store
            .write("/c/a", json!(1), WriteExpectation::Any, session)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionExpired(_)));
    }
}
