//! Controller leader election over the ephemeral leadership marker.
//!
//! At most one controller holds `/{cluster}/CONTROLLER/LEADER` at a time;
//! the store's ephemeral-create is the mutual-exclusion primitive. A
//! controller-role manager runs one campaign task per session: acquire the
//! marker or wait for it to vanish, and on loss stop all leader-only
//! activity before campaigning again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::manager::ManagerInner;
use crate::metadata::{ChangeKind, CreateMode, SessionId, StoreError, StoreResult};
use crate::model;

/// Payload of the leadership marker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub instance: String,
    pub session: SessionId,
}

enum HoldOutcome {
    MarkerLost,
    StoreClosed,
}

/// Campaign loop for one session. Exits when the session is no longer
/// current or the store goes away; the session supervisor starts a fresh
/// campaign after reconnect.
pub(crate) async fn campaign(inner: Arc<ManagerInner>, session: SessionId) {
    let leader_path = inner.paths().leader();
    loop {
        if inner.current_session() != Some(session) {
            break;
        }
        // Arm before attempting acquisition so a marker deleted in between
        // cannot leave the campaign parked forever.
        let watch = match inner.store().watch_subtree(&leader_path).await {
            Ok(watch) => watch,
            Err(_) => break,
        };
        match try_acquire(&inner, session).await {
            Ok(true) => {
                inner.on_leadership_acquired();
                let outcome = hold(&inner, session, &leader_path).await;
                inner.on_leadership_lost();
                match outcome {
                    HoldOutcome::MarkerLost => continue,
                    HoldOutcome::StoreClosed => break,
                }
            }
            Ok(false) => {
                debug!(
                    instance = %inner.instance_name(),
                    "leadership marker held elsewhere, standing by"
                );
                if watch.fired().await.is_none() {
                    break;
                }
            }
            Err(StoreError::SessionExpired(_)) => break,
            Err(error) => {
                warn!(%error, "leadership acquisition attempt failed");
                tokio::time::sleep(std::time::Duration::from_millis(
                    inner.config().connection.backoff_base_ms,
                ))
                .await;
            }
        }
    }
}

async fn try_acquire(inner: &ManagerInner, session: SessionId) -> StoreResult<bool> {
    let record = LeaderRecord {
        instance: inner.instance_name().to_string(),
        session,
    };
    let data = model::encode(&record)?;
    match inner
        .store()
        .create(&inner.paths().leader(), data, CreateMode::Ephemeral, session)
        .await
    {
        Ok(()) => Ok(true),
        Err(StoreError::NodeExists { .. }) => Ok(false),
        Err(error) => Err(error),
    }
}

/// Hold the acquired marker until it disappears or stops being ours.
async fn hold(inner: &ManagerInner, session: SessionId, leader_path: &str) -> HoldOutcome {
    let mut watch = match inner.store().watch_subtree(leader_path).await {
        Ok(watch) => watch,
        Err(_) => return HoldOutcome::StoreClosed,
    };
    loop {
        // Verify ownership after (re-)arming so no deletion slips between
        // the previous firing and the new watch.
        match still_ours(inner, session, leader_path).await {
            Ok(true) => {}
            Ok(false) => return HoldOutcome::MarkerLost,
            Err(_) => return HoldOutcome::StoreClosed,
        }
        let Some(event) = watch.fired().await else {
            return HoldOutcome::StoreClosed;
        };
        if event.kind == ChangeKind::Deleted {
            return HoldOutcome::MarkerLost;
        }
        watch = match inner.store().rearm(event.token).await {
            Ok(watch) => watch,
            Err(_) => return HoldOutcome::StoreClosed,
        };
    }
}

async fn still_ours(
    inner: &ManagerInner,
    session: SessionId,
    leader_path: &str,
) -> StoreResult<bool> {
    match inner.store().read(leader_path).await? {
        Some(record) => {
            let leader: LeaderRecord = model::decode(leader_path, record.data)?;
            Ok(leader.session == session)
        }
        None => Ok(false),
    }
}
