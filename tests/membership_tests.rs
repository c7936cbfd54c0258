use std::sync::Arc;

use permtree::network::InProcessHub;
use permtree::store::MemoryDataStore;
use permtree::testing::TestPrincipal;
use permtree::{bits, PermTreeNode, SecurityConfig};

const USER: u32 = 100;

async fn test_node() -> Arc<PermTreeNode> {
    let store = Arc::new(MemoryDataStore::new());
    let hub = InProcessHub::new();
    let node = Arc::new(PermTreeNode::new(
        SecurityConfig::default(),
        store,
        Arc::new(hub.transport()),
    ));
    node.start().await.unwrap();
    node
}

#[tokio::test]
async fn user_centric_membership_ops() {
    let node = test_node().await;
    node.add_user_to_groups(USER, vec![1, 2]).await.unwrap();
    let groups = node.db().membership().groups_of(USER).unwrap();
    assert_eq!(groups, [1, 2].into_iter().collect());
    assert_eq!(node.db().membership().group_snapshot().unwrap().len(), 2);
    let flat = node.db().membership().flat_snapshot().unwrap();
    assert_eq!(flat[&USER].len(), 2);

    node.remove_user_from_groups(USER, vec![1]).await.unwrap();
    let groups = node.db().membership().groups_of(USER).unwrap();
    assert_eq!(groups, [2].into_iter().collect());
}

#[tokio::test]
async fn nested_membership_reaches_containers() {
    let node = test_node().await;
    // USER in G10, G10 in G20: the user transitively reaches G20
    node.add_members(10, vec![USER], vec![]).await.unwrap();
    node.add_members(20, vec![], vec![10]).await.unwrap();
    assert!(node.db().membership().is_member(USER, 20).unwrap());

    node.remove_members(20, vec![], vec![10]).await.unwrap();
    assert!(!node.db().membership().is_member(USER, 20).unwrap());
    assert!(node.db().membership().is_member(USER, 10).unwrap());
}

#[tokio::test]
async fn deleting_a_user_sweeps_entries_and_edges() {
    let node = test_node().await;
    node.create_entity(1, None, 10).await.unwrap();
    node.create_entity(2, Some(1), 10).await.unwrap();
    node.add_members(10, vec![USER], vec![]).await.unwrap();

    let mut editor = node.edit_acls();
    editor.allow(1, USER, false, bits::SEE).unwrap();
    editor.allow(2, 10, false, bits::OPEN).unwrap();
    node.apply_edit(editor).await.unwrap();

    let user = TestPrincipal::new(USER);
    assert!(node.has_permission(&user, 2, bits::SEE).unwrap());
    assert!(node.has_permission(&user, 2, bits::OPEN).unwrap());

    node.delete_user(USER).await.unwrap();

    // the user's own entry is gone, the group entry no longer matches
    assert_eq!(
        node.permission_value(&user, 2, bits::SEE).unwrap(),
        permtree::model::PermissionValue::Undefined
    );
    assert!(!node.has_permission(&user, 2, bits::SEE).unwrap());
    assert!(!node.has_permission(&user, 2, bits::OPEN).unwrap());
    assert!(node.db().acls().get(1).unwrap().is_none());
    // the group's entry survives: the group itself was not deleted
    assert!(node.db().acls().get(2).unwrap().is_some());
    assert!(node.db().membership().group(10).unwrap().is_some());
    assert!(node
        .db()
        .membership()
        .group(10)
        .unwrap()
        .unwrap()
        .user_members
        .is_empty());
}
