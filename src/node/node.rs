use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::activity::{
    Activity, ActivityBody, ActivityQueue, ActivitySerializer, JsonActivitySerializer, QueueStats,
};
use crate::db::PermDb;
use crate::error::{PermTreeError, PermTreeResult};
use crate::model::{ActivityId, EntityId, IdentityId, PermissionValue};
use crate::network::{MessageTransport, TransportError};
use crate::node::config::SecurityConfig;
use crate::permissions::{AclEditor, PermissionEvaluator, UserPrincipal};
use crate::store::DataStore;

/// A node of the distributed authorization kernel.
///
/// PermTreeNode wires the in-memory kernel, the activity scheduler, the
/// persistence boundary and the message transport into one handle with an
/// explicit start/reset/shutdown lifecycle. Every mutating operation is
/// wrapped as an activity, ordered against conflicting in-flight
/// activities, persisted and broadcast before it is applied locally.
/// Permission checks are read-only and never wait for activities.
pub struct PermTreeNode {
    db: Arc<PermDb>,
    queue: Arc<ActivityQueue>,
    evaluator: PermissionEvaluator,
    store: Arc<dyn DataStore>,
    transport: Arc<dyn MessageTransport>,
    serializer: Arc<dyn ActivitySerializer>,
    config: SecurityConfig,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl PermTreeNode {
    /// Creates a node with the default JSON activity serializer. The node
    /// is inert until [`Self::start`] runs.
    pub fn new(
        config: SecurityConfig,
        store: Arc<dyn DataStore>,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        Self::with_serializer(config, store, transport, Arc::new(JsonActivitySerializer))
    }

    pub fn with_serializer(
        config: SecurityConfig,
        store: Arc<dyn DataStore>,
        transport: Arc<dyn MessageTransport>,
        serializer: Arc<dyn ActivitySerializer>,
    ) -> Self {
        let db = Arc::new(PermDb::new());
        let queue = Arc::new(ActivityQueue::new(
            Arc::clone(&db),
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&serializer),
        ));
        let evaluator = PermissionEvaluator::new(Arc::clone(&db));
        Self {
            db,
            queue,
            evaluator,
            store,
            transport,
            serializer,
            config,
            receive_task: Mutex::new(None),
        }
    }

    /// Cold start: bulk-loads the kernel mirror from the data store,
    /// starts the transport and begins consuming the inbound activity
    /// feed.
    pub async fn start(&self) -> PermTreeResult<()> {
        let snapshot = self.store.load_all().await?;
        self.db
            .load(snapshot.entities, snapshot.acls, snapshot.groups)?;

        self.transport.start().await?;
        let inbox = self.transport.take_inbox().ok_or_else(|| {
            PermTreeError::Transport(TransportError::ReceiveFailed(
                "transport inbox already taken".into(),
            ))
        })?;
        let last_seen = self.store.last_activity_id().await?;

        let queue = Arc::clone(&self.queue);
        let serializer = Arc::clone(&self.serializer);
        let handle = tokio::spawn(async move {
            receive_loop(queue, serializer, inbox, last_seen).await;
        });
        if let Ok(mut task) = self.receive_task.lock() {
            *task = Some(handle);
        }
        info!(
            "node {} started with {} entities",
            self.transport.receiver_id(),
            self.db.entities().len()?
        );
        Ok(())
    }

    /// Discards and rebuilds the in-memory mirror from the data store
    /// without going through the activity stream.
    pub async fn reset(&self) -> PermTreeResult<()> {
        let snapshot = self.store.load_all().await?;
        self.db
            .load(snapshot.entities, snapshot.acls, snapshot.groups)
    }

    /// Stops the inbound feed and shuts the transport down.
    pub async fn shutdown(&self) -> PermTreeResult<()> {
        if let Ok(mut task) = self.receive_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        self.transport.shutdown().await?;
        info!("node {} shut down", self.transport.receiver_id());
        Ok(())
    }

    /// Handle to the in-memory kernel, for read-only inspection.
    pub fn db(&self) -> Arc<PermDb> {
        Arc::clone(&self.db)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    // ----- structural operations -----

    /// Creates an entity under a parent. Fails with `InvalidArgument` on a
    /// zero id and `EntityNotFound` when the parent is absent; re-creating
    /// an existing id only updates the owner.
    pub async fn create_entity(
        &self,
        entity_id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: IdentityId,
    ) -> PermTreeResult<()> {
        if entity_id == 0 || parent_id == Some(0) {
            return Err(PermTreeError::InvalidArgument(
                "entity and parent ids must not be zero".into(),
            ));
        }
        self.run(ActivityBody::CreateEntity {
            entity_id,
            parent_id,
            owner_id,
        })
        .await
    }

    /// Removes an entity with its whole subtree and every ACL entry
    /// referencing a removed id. Deleting a missing id is a successful
    /// no-op.
    pub async fn delete_entity(&self, entity_id: EntityId) -> PermTreeResult<()> {
        self.run(ActivityBody::DeleteEntity { entity_id }).await
    }

    /// Reparents `source_id` under `target_id`.
    pub async fn move_entity(
        &self,
        source_id: EntityId,
        target_id: EntityId,
    ) -> PermTreeResult<()> {
        if source_id == 0 || target_id == 0 {
            return Err(PermTreeError::InvalidArgument(
                "move requires non-zero source and target ids".into(),
            ));
        }
        self.run(ActivityBody::MoveEntity {
            source_id,
            target_id,
        })
        .await
    }

    /// Changes an entity's owner, with create's validation rules.
    pub async fn modify_owner(
        &self,
        entity_id: EntityId,
        owner_id: IdentityId,
    ) -> PermTreeResult<()> {
        if entity_id == 0 {
            return Err(PermTreeError::InvalidArgument(
                "entity id must not be zero".into(),
            ));
        }
        self.run(ActivityBody::ModifyOwner {
            entity_id,
            owner_id,
        })
        .await
    }

    // ----- inheritance -----

    /// Stops ancestor entries from propagating to the entity and its
    /// descendants. With `copy_existing`, the currently effective
    /// permissions are materialized as explicit entries first, so checks
    /// at and below the entity are unchanged immediately after the break;
    /// without it, the entity's explicit ACL is cleared. Breaking an
    /// already-broken entity is a successful no-op.
    pub async fn break_inheritance(
        &self,
        entity_id: EntityId,
        copy_existing: bool,
    ) -> PermTreeResult<()> {
        let entity = self
            .db
            .entities()
            .get(entity_id)?
            .ok_or(PermTreeError::EntityNotFound(entity_id))?;
        if !entity.is_inherited {
            debug!("entity {} already breaks inheritance", entity_id);
            return Ok(());
        }
        let mut editor = self.edit_acls();
        if copy_existing {
            editor.copy_effective_permissions(entity_id)?;
        } else {
            editor.clear_acl(entity_id)?;
        }
        editor.break_inheritance(entity_id)?;
        self.apply_edit(editor).await
    }

    /// Restores inheritance. With `normalize`, explicit entries that are
    /// bit-for-bit redundant with what inheritance alone now produces are
    /// removed, and the ACL is dropped entirely if it becomes empty.
    /// Unbreaking an unbroken entity is a successful no-op.
    pub async fn unbreak_inheritance(
        &self,
        entity_id: EntityId,
        normalize: bool,
    ) -> PermTreeResult<()> {
        let entity = self
            .db
            .entities()
            .get(entity_id)?
            .ok_or(PermTreeError::EntityNotFound(entity_id))?;
        if entity.is_inherited {
            debug!("entity {} already inherits", entity_id);
            return Ok(());
        }
        let mut editor = self.edit_acls();
        if normalize {
            editor.normalize_explicit_permissions(entity_id)?;
        }
        editor.unbreak_inheritance(entity_id)?;
        self.apply_edit(editor).await
    }

    // ----- acl editing -----

    /// Opens a batching editor over the current ACL state. Finish with
    /// [`Self::apply_edit`].
    pub fn edit_acls(&self) -> AclEditor {
        AclEditor::new(Arc::clone(&self.db))
    }

    /// Submits an editor's batch as one atomic set-acl activity. An empty
    /// batch is a no-op.
    pub async fn apply_edit(&self, editor: AclEditor) -> PermTreeResult<()> {
        if editor.is_empty() {
            return Ok(());
        }
        self.run(editor.build()?).await
    }

    // ----- membership -----

    /// Adds user and group members to a group.
    pub async fn add_members(
        &self,
        group_id: IdentityId,
        users: Vec<IdentityId>,
        groups: Vec<IdentityId>,
    ) -> PermTreeResult<()> {
        self.run(ActivityBody::AddMembers {
            group_id,
            users,
            groups,
        })
        .await
    }

    /// Removes user and group members from a group.
    pub async fn remove_members(
        &self,
        group_id: IdentityId,
        users: Vec<IdentityId>,
        groups: Vec<IdentityId>,
    ) -> PermTreeResult<()> {
        self.run(ActivityBody::RemoveMembers {
            group_id,
            users,
            groups,
        })
        .await
    }

    pub async fn add_user_to_groups(
        &self,
        user_id: IdentityId,
        groups: Vec<IdentityId>,
    ) -> PermTreeResult<()> {
        self.run(ActivityBody::AddUserToGroups { user_id, groups })
            .await
    }

    pub async fn remove_user_from_groups(
        &self,
        user_id: IdentityId,
        groups: Vec<IdentityId>,
    ) -> PermTreeResult<()> {
        self.run(ActivityBody::RemoveUserFromGroups { user_id, groups })
            .await
    }

    /// Deletes a group with all of its edges and ACL entries.
    pub async fn delete_group(&self, group_id: IdentityId) -> PermTreeResult<()> {
        self.run(ActivityBody::DeleteGroup { group_id }).await
    }

    /// Deletes a user with all of its memberships and ACL entries.
    pub async fn delete_user(&self, user_id: IdentityId) -> PermTreeResult<()> {
        self.run(ActivityBody::DeleteUser { user_id }).await
    }

    /// Deletes a batch of identities wholesale.
    pub async fn delete_identities(&self, ids: Vec<IdentityId>) -> PermTreeResult<()> {
        self.run(ActivityBody::DeleteIdentities { ids }).await
    }

    /// Discards and rebuilds every node's in-memory stores from the
    /// persistence layer, after all older activities have finished.
    pub async fn reload_cache(&self) -> PermTreeResult<()> {
        self.run(ActivityBody::ReloadCache).await
    }

    // ----- evaluation -----

    /// True when every requested bit is Allowed for the user at the
    /// entity.
    pub fn has_permission(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
        bits: u64,
    ) -> PermTreeResult<bool> {
        self.evaluator.has_permission(user, entity_id, bits)
    }

    /// Raises `AccessDenied` unless every requested bit is Allowed.
    pub fn assert_permission(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
        bits: u64,
    ) -> PermTreeResult<()> {
        self.evaluator.assert_permission(user, entity_id, bits)
    }

    /// True when every requested bit is Allowed at the entity and at every
    /// descendant.
    pub fn has_subtree_permission(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
        bits: u64,
    ) -> PermTreeResult<bool> {
        self.evaluator.has_subtree_permission(user, entity_id, bits)
    }

    /// Decision for a single bit.
    pub fn permission_value(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
        bit: u64,
    ) -> PermTreeResult<PermissionValue> {
        self.evaluator.permission_value(user, entity_id, bit)
    }

    /// Per-identity merged allow/deny masks at the entity.
    pub fn effective_entries(
        &self,
        entity_id: EntityId,
    ) -> PermTreeResult<BTreeMap<IdentityId, (u64, u64)>> {
        self.evaluator.effective_entries(entity_id)
    }

    /// Submits a local activity and waits for its apply phase with the
    /// configured timeout.
    async fn run(&self, body: ActivityBody) -> PermTreeResult<()> {
        let handle = self.queue.submit(Activity::local(body));
        handle.wait(self.config.completion_timeout()).await?;
        Ok(())
    }
}

/// Consumes the inbound feed: decodes activities, fills sequence gaps with
/// placeholders and hands everything to the queue in order.
async fn receive_loop(
    queue: Arc<ActivityQueue>,
    serializer: Arc<dyn ActivitySerializer>,
    mut inbox: mpsc::Receiver<Vec<u8>>,
    mut last_seen: ActivityId,
) {
    while let Some(bytes) = inbox.recv().await {
        let activity = match serializer.deserialize(&bytes) {
            Ok(activity) => activity,
            Err(err) => {
                error!("dropping undecodable activity: {}", err);
                continue;
            }
        };
        let Some(id) = activity.id else {
            warn!("dropping received activity without a sequence id");
            continue;
        };

        last_seen = last_seen.max(queue.last_applied_id());
        if id <= last_seen {
            debug!("skipping already-seen activity {}", id);
            continue;
        }
        for missing in (last_seen + 1)..id {
            debug!("filling sequence gap {} with a placeholder", missing);
            let _ = queue.submit(Activity::received(missing, ActivityBody::Placeholder));
        }
        last_seen = id;
        debug!("received activity {} ({})", id, activity.body.kind());
        let _ = queue.submit(activity);
    }
    debug!("inbound activity feed closed");
}
