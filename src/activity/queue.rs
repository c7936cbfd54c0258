//! Dependency-aware activity scheduler.
//!
//! On submission an activity is compared against every still-active older
//! activity under one narrow mutex; a release channel is recorded for every
//! true conflict predicate and execution defers until all of them fire.
//! The scheduling decision is O(active activities), not O(graph size), so
//! the critical section stays short. Dependency edges release on success
//! *and* failure: a failed store step aborts only its own activity and is
//! reported only to that activity's waiter.
//!
//! Local activities run store -> distribute -> apply, in that order, so no
//! other node can observe an effect before it is durable and broadcast.
//! Received activities skip the first two phases and only apply.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::activity::serializer::ActivitySerializer;
use crate::activity::{Activity, ActivityBody, ActivityOrigin};
use crate::db::PermDb;
use crate::error::{PermTreeError, PermTreeResult};
use crate::model::ActivityId;
use crate::network::MessageTransport;
use crate::store::DataStore;

struct ActiveEntry {
    key: u64,
    body: Arc<ActivityBody>,
    done_rx: watch::Receiver<bool>,
}

#[derive(Default)]
struct QueueState {
    next_key: u64,
    active: Vec<ActiveEntry>,
    applied_count: u64,
    last_applied_id: ActivityId,
}

/// Point-in-time scheduler counters, exposed for tests and operators.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub active_count: usize,
    pub applied_count: u64,
    pub last_applied_id: ActivityId,
}

/// Receiver side of one activity's completion signal. Dropping the handle
/// cancels only the wait, never the activity's already-in-flight effect.
pub struct CompletionHandle {
    rx: oneshot::Receiver<PermTreeResult<ActivityId>>,
}

impl CompletionHandle {
    /// Blocks until the activity's apply phase completes, or until the
    /// timeout elapses. A timeout surfaces as an error without retracting
    /// the activity's effect elsewhere.
    pub async fn wait(self, timeout: Duration) -> PermTreeResult<ActivityId> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => Err(PermTreeError::ActivityTimeout),
            Ok(Err(_)) => Err(PermTreeError::Storage(
                "activity executor dropped before completion".into(),
            )),
            Ok(Ok(result)) => result,
        }
    }
}

/// Schedules activities, resolves conflicts and applies effects to the
/// in-memory kernel.
pub struct ActivityQueue {
    db: Arc<PermDb>,
    store: Arc<dyn DataStore>,
    transport: Arc<dyn MessageTransport>,
    serializer: Arc<dyn ActivitySerializer>,
    state: Mutex<QueueState>,
}

impl ActivityQueue {
    pub fn new(
        db: Arc<PermDb>,
        store: Arc<dyn DataStore>,
        transport: Arc<dyn MessageTransport>,
        serializer: Arc<dyn ActivitySerializer>,
    ) -> Self {
        Self {
            db,
            store,
            transport,
            serializer,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        QueueStats {
            active_count: state.active.len(),
            applied_count: state.applied_count,
            last_applied_id: state.last_applied_id,
        }
    }

    /// Highest sequence id this queue has applied so far.
    pub fn last_applied_id(&self) -> ActivityId {
        self.stats().last_applied_id
    }

    /// Enqueues an activity. Dependency edges against in-flight activities
    /// are computed here, execution happens on a background task, and the
    /// returned handle resolves when the apply phase finishes.
    pub fn submit(self: &Arc<Self>, activity: Activity) -> CompletionHandle {
        let (done_tx, done_rx) = watch::channel(false);
        let (result_tx, result_rx) = oneshot::channel();
        let body = Arc::new(activity.body.clone());

        let (key, waits) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let key = state.next_key;
            state.next_key += 1;
            let waits: Vec<watch::Receiver<bool>> = state
                .active
                .iter()
                .filter(|entry| activity.body.must_wait_for(&entry.body, &self.db))
                .map(|entry| entry.done_rx.clone())
                .collect();
            state.active.push(ActiveEntry {
                key,
                body: Arc::clone(&body),
                done_rx,
            });
            (key, waits)
        };

        if !waits.is_empty() {
            debug!(
                "activity {} defers behind {} older activities",
                body.kind(),
                waits.len()
            );
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            for mut release in waits {
                // A closed channel means the older activity is gone; both
                // success and failure release the edge.
                let _ = release.wait_for(|done| *done).await;
            }

            let result = queue.execute(activity).await;

            {
                let mut state = match queue.state.lock() {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
                state.active.retain(|entry| entry.key != key);
                if let Ok(id) = &result {
                    state.applied_count += 1;
                    if *id > state.last_applied_id {
                        state.last_applied_id = *id;
                    }
                }
            }
            let _ = done_tx.send(true);

            if let Err(err) = &result {
                warn!("activity {} failed: {}", body.kind(), err);
            }
            let _ = result_tx.send(result);
        });

        CompletionHandle { rx: result_rx }
    }

    /// Runs the phases of one activity after its dependencies cleared.
    async fn execute(&self, mut activity: Activity) -> PermTreeResult<ActivityId> {
        match activity.origin {
            ActivityOrigin::Local => {
                let id = self.store.save_activity(&activity).await?;
                activity.id = Some(id);
                if !self.store.acquire_activity_lock(id).await? {
                    debug!("activity {} already locked by another executor", id);
                }
                self.store_effect(&activity).await?;
                self.distribute(&activity, id).await;
                let applied = self.apply(&activity).await;
                let _ = self.store.release_activity_lock(id).await;
                applied?;
                info!("activity {} ({}) applied", id, activity.body.kind());
                Ok(id)
            }
            ActivityOrigin::Received => {
                let id = activity.id.unwrap_or(0);
                self.apply(&activity).await?;
                debug!("received activity {} ({}) applied", id, activity.body.kind());
                Ok(id)
            }
        }
    }

    /// Broadcasts a stored activity. Transport failures are logged at this
    /// boundary and never propagate into the caller's result: the activity
    /// is already durable and the transport owns retries.
    async fn distribute(&self, activity: &Activity, id: ActivityId) {
        match self.serializer.serialize(activity) {
            Ok(bytes) => {
                if let Err(err) = self.transport.send(bytes).await {
                    error!("failed to distribute activity {}: {}", id, err);
                }
            }
            Err(err) => error!("failed to serialize activity {}: {}", id, err),
        }
    }

    /// Persists the activity's domain effect. Runs before distribution so
    /// remote nodes never see an activity that is not durable.
    async fn store_effect(&self, activity: &Activity) -> PermTreeResult<()> {
        match &activity.body {
            ActivityBody::CreateEntity {
                entity_id,
                parent_id,
                owner_id,
            } => {
                self.store
                    .upsert_entity(*entity_id, *parent_id, *owner_id)
                    .await
            }
            ActivityBody::DeleteEntity { entity_id } => {
                let subtree = self.db.entities().subtree_ids(*entity_id)?;
                if subtree.is_empty() {
                    return Ok(());
                }
                self.store.delete_entities(&subtree).await
            }
            ActivityBody::ModifyOwner {
                entity_id,
                owner_id,
            } => self.store.set_entity_owner(*entity_id, *owner_id).await,
            ActivityBody::MoveEntity {
                source_id,
                target_id,
            } => self.store.move_entity(*source_id, *target_id).await,
            ActivityBody::SetAcl(payload) => {
                for entity_id in &payload.breaks {
                    self.store.set_inheritance(*entity_id, false).await?;
                }
                for entity_id in &payload.unbreaks {
                    self.store.set_inheritance(*entity_id, true).await?;
                }
                for acl in &payload.acls {
                    let mut normalized = acl.clone();
                    normalized.normalize();
                    if normalized.is_vacant() {
                        self.store.remove_acl(normalized.entity_id).await?;
                    } else {
                        self.store.write_acl(&normalized).await?;
                    }
                }
                Ok(())
            }
            ActivityBody::AddMembers {
                group_id,
                users,
                groups,
            } => self.store.add_group_members(*group_id, users, groups).await,
            ActivityBody::RemoveMembers {
                group_id,
                users,
                groups,
            } => {
                self.store
                    .remove_group_members(*group_id, users, groups)
                    .await
            }
            ActivityBody::AddUserToGroups { user_id, groups } => {
                for group_id in groups {
                    self.store
                        .add_group_members(*group_id, &[*user_id], &[])
                        .await?;
                }
                Ok(())
            }
            ActivityBody::RemoveUserFromGroups { user_id, groups } => {
                for group_id in groups {
                    self.store
                        .remove_group_members(*group_id, &[*user_id], &[])
                        .await?;
                }
                Ok(())
            }
            ActivityBody::DeleteGroup { group_id } => {
                self.store.delete_identities(&[*group_id]).await
            }
            ActivityBody::DeleteUser { user_id } => {
                self.store.delete_identities(&[*user_id]).await
            }
            ActivityBody::DeleteIdentities { ids } => self.store.delete_identities(ids).await,
            ActivityBody::ReloadCache | ActivityBody::Placeholder => Ok(()),
        }
    }

    /// Mutates the in-memory kernel. This is the only phase received
    /// activities run.
    async fn apply(&self, activity: &Activity) -> PermTreeResult<()> {
        match &activity.body {
            ActivityBody::CreateEntity {
                entity_id,
                parent_id,
                owner_id,
            } => self.db.create_entity(*entity_id, *parent_id, *owner_id),
            ActivityBody::DeleteEntity { entity_id } => {
                self.db.delete_entity(*entity_id)?;
                Ok(())
            }
            ActivityBody::ModifyOwner {
                entity_id,
                owner_id,
            } => self.db.modify_owner(*entity_id, *owner_id),
            ActivityBody::MoveEntity {
                source_id,
                target_id,
            } => self.db.move_entity(*source_id, *target_id),
            ActivityBody::SetAcl(payload) => {
                for entity_id in &payload.breaks {
                    self.db.set_inheritance(*entity_id, false)?;
                }
                for entity_id in &payload.unbreaks {
                    self.db.set_inheritance(*entity_id, true)?;
                }
                for acl in &payload.acls {
                    self.db.set_acl(acl.clone())?;
                }
                Ok(())
            }
            ActivityBody::AddMembers {
                group_id,
                users,
                groups,
            } => self.db.membership().add_members(*group_id, users, groups),
            ActivityBody::RemoveMembers {
                group_id,
                users,
                groups,
            } => self
                .db
                .membership()
                .remove_members(*group_id, users, groups),
            ActivityBody::AddUserToGroups { user_id, groups } => {
                self.db.membership().add_user_to_groups(*user_id, groups)
            }
            ActivityBody::RemoveUserFromGroups { user_id, groups } => self
                .db
                .membership()
                .remove_user_from_groups(*user_id, groups),
            ActivityBody::DeleteGroup { group_id } => self.db.remove_identities(&[*group_id]),
            ActivityBody::DeleteUser { user_id } => self.db.remove_identities(&[*user_id]),
            ActivityBody::DeleteIdentities { ids } => self.db.remove_identities(ids),
            ActivityBody::ReloadCache => {
                let snapshot = self.store.load_all().await?;
                self.db
                    .load(snapshot.entities, snapshot.acls, snapshot.groups)
            }
            ActivityBody::Placeholder => Ok(()),
        }
    }
}
