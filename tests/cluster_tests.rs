use std::sync::Arc;
use std::time::Duration;

use permtree::activity::{Activity, ActivityBody, ActivitySerializer, JsonActivitySerializer};
use permtree::network::InProcessHub;
use permtree::store::MemoryDataStore;
use permtree::testing::TestPrincipal;
use permtree::{bits, MessageTransport, PermTreeNode, SecurityConfig};

const GROUP: u32 = 500;
const USER: u32 = 100;

/// Two nodes sharing one data store and one in-process hub, the way
/// production nodes share one database and one message broker.
async fn two_nodes() -> (Arc<PermTreeNode>, Arc<PermTreeNode>, Arc<MemoryDataStore>) {
    let store = Arc::new(MemoryDataStore::new());
    let hub = InProcessHub::new();
    let node_a = Arc::new(PermTreeNode::new(
        SecurityConfig::default(),
        store.clone(),
        Arc::new(hub.transport()),
    ));
    let node_b = Arc::new(PermTreeNode::new(
        SecurityConfig::default(),
        store.clone(),
        Arc::new(hub.transport()),
    ));
    node_a.start().await.unwrap();
    node_b.start().await.unwrap();
    (node_a, node_b, store)
}

/// Polls until the condition holds; panics after two seconds.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}

#[tokio::test]
async fn structural_changes_converge_across_nodes() {
    let (node_a, node_b, _store) = two_nodes().await;
    node_a.create_entity(1, None, 10).await.unwrap();
    node_a.create_entity(2, Some(1), 10).await.unwrap();
    node_a.create_entity(3, Some(1), 10).await.unwrap();

    let db_b = node_b.db();
    wait_until(move || db_b.entities().len().unwrap_or(0) == 3).await;
    assert_eq!(
        node_b.db().entities().get(2).unwrap().unwrap().parent_id,
        Some(1)
    );

    // a move issued on the other node comes back the same way
    node_b.move_entity(3, 2).await.unwrap();
    let db_a = node_a.db();
    wait_until(move || {
        db_a.entities()
            .get(3)
            .ok()
            .flatten()
            .map(|e| e.parent_id == Some(2))
            .unwrap_or(false)
    })
    .await;

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn acl_and_membership_changes_converge() {
    let (node_a, node_b, _store) = two_nodes().await;
    node_a.create_entity(1, None, 10).await.unwrap();
    node_a.create_entity(2, Some(1), 10).await.unwrap();
    node_a.add_members(GROUP, vec![USER], vec![]).await.unwrap();

    let mut editor = node_a.edit_acls();
    editor.allow(1, GROUP, false, bits::SEE).unwrap();
    node_a.apply_edit(editor).await.unwrap();

    let user = TestPrincipal::new(USER);
    let node_b_clone = Arc::clone(&node_b);
    wait_until(move || {
        node_b_clone
            .has_permission(&user, 2, bits::SEE)
            .unwrap_or(false)
    })
    .await;

    // deleting the group on node B flips the check on node A
    node_b.delete_group(GROUP).await.unwrap();
    let user = TestPrincipal::new(USER);
    let node_a_clone = Arc::clone(&node_a);
    wait_until(move || {
        !node_a_clone
            .has_permission(&user, 2, bits::SEE)
            .unwrap_or(true)
    })
    .await;
    assert!(node_a.db().acls().get(1).unwrap().is_none());
}

#[tokio::test]
async fn sequence_gaps_are_filled_with_placeholders() {
    let store = Arc::new(MemoryDataStore::new());
    let hub = InProcessHub::new();
    let node = Arc::new(PermTreeNode::new(
        SecurityConfig::default(),
        store.clone(),
        Arc::new(hub.transport()),
    ));
    node.start().await.unwrap();

    // a raw peer endpoint plays the remote node
    let peer = hub.transport();
    peer.start().await.unwrap();
    let serializer = JsonActivitySerializer;

    // the peer announces activity 5; ids 1-4 never reach this node
    let activity = Activity::received(
        5,
        ActivityBody::CreateEntity {
            entity_id: 42,
            parent_id: None,
            owner_id: 10,
        },
    );
    let bytes = serializer.serialize(&activity).unwrap();
    peer.send(bytes).await.unwrap();

    let db = node.db();
    wait_until(move || db.entities().get(42).ok().flatten().is_some()).await;
    let stats = node.queue_stats();
    assert_eq!(stats.last_applied_id, 5);
    assert_eq!(stats.applied_count, 5, "four placeholders plus the activity");
}

#[tokio::test]
async fn reload_cache_rebuilds_from_the_store() {
    let (node_a, node_b, _store) = two_nodes().await;
    node_a.create_entity(1, None, 10).await.unwrap();
    node_a.create_entity(2, Some(1), 10).await.unwrap();

    let db_b = node_b.db();
    wait_until(move || db_b.entities().len().unwrap_or(0) == 2).await;

    // poison node B's mirror behind the kernel's back, then reload
    node_b.db().create_entity(77, Some(1), 10).unwrap();
    node_b.reload_cache().await.unwrap();
    assert!(node_b.db().entities().get(77).unwrap().is_none());
    assert_eq!(node_b.db().entities().len().unwrap(), 2);
    assert!(node_b.db().entities().get(2).unwrap().is_some());

    // a local reset rebuilds without going through the activity stream
    node_a.db().create_entity(78, Some(1), 10).unwrap();
    node_a.reset().await.unwrap();
    assert!(node_a.db().entities().get(78).unwrap().is_none());
}

#[tokio::test]
async fn identity_batch_deletion_sweeps_everything() {
    let (node_a, node_b, _store) = two_nodes().await;
    node_a.create_entity(1, None, 10).await.unwrap();
    node_a
        .add_members(GROUP, vec![USER], vec![GROUP + 1])
        .await
        .unwrap();
    let mut editor = node_a.edit_acls();
    editor.allow(1, GROUP, false, bits::SEE).unwrap();
    editor.allow(1, USER, false, bits::OPEN).unwrap();
    node_a.apply_edit(editor).await.unwrap();

    node_a
        .delete_identities(vec![GROUP, USER])
        .await
        .unwrap();

    let acl = node_a.db().acls().get(1).unwrap();
    assert!(acl.is_none(), "both entries referenced deleted identities");
    assert!(node_a.db().membership().group(GROUP).unwrap().is_none());

    let db_b = node_b.db();
    wait_until(move || {
        db_b.acls().get(1).map(|a| a.is_none()).unwrap_or(false)
            && db_b.membership().group(GROUP).map(|g| g.is_none()).unwrap_or(false)
    })
    .await;
}
