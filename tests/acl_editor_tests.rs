use std::sync::Arc;

use permtree::model::EntryKind;
use permtree::network::InProcessHub;
use permtree::store::MemoryDataStore;
use permtree::testing::TestPrincipal;
use permtree::{bits, PermTreeError, PermTreeNode, SecurityConfig};

const GROUP: u32 = 500;
const USER: u32 = 100;

async fn test_node() -> (Arc<PermTreeNode>, Arc<MemoryDataStore>) {
    let store = Arc::new(MemoryDataStore::new());
    let hub = InProcessHub::new();
    let node = Arc::new(PermTreeNode::new(
        SecurityConfig::default(),
        store.clone(),
        Arc::new(hub.transport()),
    ));
    node.start().await.unwrap();
    (node, store)
}

/// E1 -> E2 -> E3 with a group grant on the root.
async fn node_with_tree() -> (Arc<PermTreeNode>, Arc<MemoryDataStore>) {
    let (node, store) = test_node().await;
    node.create_entity(1, None, 10).await.unwrap();
    node.create_entity(2, Some(1), 10).await.unwrap();
    node.create_entity(3, Some(2), 10).await.unwrap();
    node.add_members(GROUP, vec![USER], vec![]).await.unwrap();
    let mut editor = node.edit_acls();
    editor.allow(1, GROUP, false, bits::SEE | bits::OPEN).unwrap();
    node.apply_edit(editor).await.unwrap();
    (node, store)
}

#[tokio::test]
async fn repeated_edits_for_one_key_merge() {
    let (node, _store) = node_with_tree().await;
    let mut editor = node.edit_acls();
    editor.allow(2, USER, false, bits::SAVE).unwrap();
    editor.deny(2, USER, false, bits::DELETE).unwrap();
    editor.allow(2, USER, false, bits::OPEN).unwrap();
    // denying a previously allowed bit flips it
    editor.deny(2, USER, false, bits::OPEN).unwrap();
    node.apply_edit(editor).await.unwrap();

    let acl = node.db().acls().get(2).unwrap().unwrap();
    assert_eq!(acl.entries.len(), 1);
    let entry = acl
        .entry((USER, false, EntryKind::Normal))
        .expect("merged entry");
    assert_eq!(entry.allow, bits::SAVE);
    assert_eq!(entry.deny, bits::DELETE | bits::OPEN);
}

#[tokio::test]
async fn zero_mask_entries_are_never_persisted() {
    let (node, _store) = node_with_tree().await;
    let mut editor = node.edit_acls();
    editor.allow(2, USER, false, bits::SAVE).unwrap();
    editor.clear(2, USER, false, bits::SAVE).unwrap();
    node.apply_edit(editor).await.unwrap();

    // the merged entry is empty, so the ACL stays vacant and absent
    assert!(node.db().acls().get(2).unwrap().is_none());
}

#[tokio::test]
async fn set_replaces_masks_wholesale() {
    let (node, _store) = node_with_tree().await;
    let mut editor = node.edit_acls();
    editor.allow(2, USER, false, bits::SAVE | bits::OPEN).unwrap();
    editor.set(2, USER, false, bits::SEE, bits::DELETE).unwrap();
    node.apply_edit(editor).await.unwrap();

    let acl = node.db().acls().get(2).unwrap().unwrap();
    assert_eq!(acl.entries[0].allow, bits::SEE);
    assert_eq!(acl.entries[0].deny, bits::DELETE);
}

#[tokio::test]
async fn reset_discards_earlier_batch_edits() {
    let (node, _store) = node_with_tree().await;
    let mut editor = node.edit_acls();
    editor.allow(2, USER, false, bits::SAVE).unwrap();
    editor.reset(2, USER, false, bits::OPEN, 0).unwrap();
    node.apply_edit(editor).await.unwrap();

    let acl = node.db().acls().get(2).unwrap().unwrap();
    assert_eq!(acl.entries[0].allow, bits::OPEN);
    assert_eq!(acl.entries[0].deny, 0);
}

#[tokio::test]
async fn batch_spanning_entities_is_one_activity() {
    let (node, store) = node_with_tree().await;
    let persisted_before = store.activity_count().await;
    let mut editor = node.edit_acls();
    editor.allow(2, USER, false, bits::SAVE).unwrap();
    editor.allow(3, USER, false, bits::SAVE).unwrap();
    editor.deny(1, USER, false, bits::DELETE).unwrap();
    node.apply_edit(editor).await.unwrap();

    assert_eq!(store.activity_count().await, persisted_before + 1);
    assert!(node.db().acls().get(2).unwrap().is_some());
    assert!(node.db().acls().get(3).unwrap().is_some());
    assert_eq!(node.db().acls().snapshot().unwrap().len(), 3);
}

#[tokio::test]
async fn editing_a_missing_entity_fails() {
    let (node, _store) = node_with_tree().await;
    let mut editor = node.edit_acls();
    assert!(matches!(
        editor.allow(99, USER, false, bits::SEE).unwrap_err(),
        PermTreeError::EntityNotFound(99)
    ));
}

#[tokio::test]
async fn break_with_copy_preserves_every_check() {
    let (node, _store) = node_with_tree().await;
    let user = TestPrincipal::new(USER);
    let effective_before = node.effective_entries(3).unwrap();
    assert!(node.has_permission(&user, 3, bits::SEE).unwrap());

    node.break_inheritance(3, true).await.unwrap();

    assert_eq!(node.effective_entries(3).unwrap(), effective_before);
    assert!(node.has_permission(&user, 3, bits::SEE).unwrap());

    // only future ancestor changes stop propagating
    let mut editor = node.edit_acls();
    editor.deny(1, GROUP, false, bits::SEE).unwrap();
    node.apply_edit(editor).await.unwrap();
    assert!(node.has_permission(&user, 3, bits::SEE).unwrap());
    assert!(!node.has_permission(&user, 2, bits::SEE).unwrap());
}

#[tokio::test]
async fn break_without_copy_cuts_inherited_grants() {
    let (node, _store) = node_with_tree().await;
    let user = TestPrincipal::new(USER);
    assert!(node.has_permission(&user, 3, bits::SEE).unwrap());

    node.break_inheritance(3, false).await.unwrap();
    assert!(!node.has_permission(&user, 3, bits::SEE).unwrap());

    // breaking again is a successful no-op
    node.break_inheritance(3, false).await.unwrap();
}

#[tokio::test]
async fn unbreak_with_normalize_round_trips() {
    let (node, _store) = node_with_tree().await;
    assert!(node.db().acls().get(3).unwrap().is_none());

    node.break_inheritance(3, true).await.unwrap();
    assert!(node.db().acls().get(3).unwrap().is_some());

    node.unbreak_inheritance(3, true).await.unwrap();
    // every materialized entry was redundant with inheritance, so the ACL
    // is dropped and the pre-break state is restored exactly
    assert!(node.db().acls().get(3).unwrap().is_none());
    let entity = node.db().entities().get(3).unwrap().unwrap();
    assert!(entity.is_inherited);

    // unbreaking again is a successful no-op
    node.unbreak_inheritance(3, true).await.unwrap();
}

#[tokio::test]
async fn unbreak_without_normalize_keeps_explicit_entries() {
    let (node, _store) = node_with_tree().await;
    node.break_inheritance(3, true).await.unwrap();
    node.unbreak_inheritance(3, false).await.unwrap();

    let acl = node.db().acls().get(3).unwrap().unwrap();
    assert!(acl.inherits);
    assert!(!acl.entries.is_empty());

    // the redundant explicit entry changes no decision
    let user = TestPrincipal::new(USER);
    assert!(node.has_permission(&user, 3, bits::SEE).unwrap());
}
