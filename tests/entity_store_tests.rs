use permtree::model::{Acl, AclEntry};
use permtree::{bits, PermDb, PermTreeError};

fn db_with_tree() -> PermDb {
    // 1
    // ├── 2
    // │   ├── 4
    // │   └── 5
    // └── 3
    let db = PermDb::new();
    db.create_entity(1, None, 10).unwrap();
    db.create_entity(2, Some(1), 10).unwrap();
    db.create_entity(3, Some(1), 10).unwrap();
    db.create_entity(4, Some(2), 10).unwrap();
    db.create_entity(5, Some(2), 10).unwrap();
    db
}

#[test]
fn create_rejects_zero_id() {
    let db = PermDb::new();
    let err = db.create_entity(0, None, 10).unwrap_err();
    assert!(matches!(err, PermTreeError::InvalidArgument(_)));
}

#[test]
fn create_rejects_missing_parent() {
    let db = PermDb::new();
    let err = db.create_entity(7, Some(99), 10).unwrap_err();
    assert!(matches!(err, PermTreeError::EntityNotFound(99)));
}

#[test]
fn recreate_updates_owner_last_write_wins() {
    let db = db_with_tree();
    db.create_entity(4, Some(2), 77).unwrap();
    let entity = db.entities().get(4).unwrap().unwrap();
    assert_eq!(entity.owner_id, 77);
    assert_eq!(entity.parent_id, Some(2));
}

#[test]
fn levels_follow_parents() {
    let db = db_with_tree();
    for entity in db.entities().snapshot().unwrap() {
        match entity.parent_id {
            Some(parent_id) => {
                let parent = db.entities().get(parent_id).unwrap().unwrap();
                assert_eq!(entity.level, parent.level + 1);
            }
            None => assert_eq!(entity.level, 0),
        }
    }
}

#[test]
fn delete_removes_subtree_and_referencing_acls() {
    let db = db_with_tree();
    let mut acl = Acl::new(4);
    acl.upsert(AclEntry::new(50, false, bits::SEE, 0));
    db.set_acl(acl).unwrap();

    let removed = db.delete_entity(2).unwrap();
    assert_eq!(removed.len(), 3);
    for id in [2, 4, 5] {
        assert!(db.entities().get(id).unwrap().is_none());
    }
    assert!(db.acls().get(4).unwrap().is_none());
    // siblings survive
    assert!(db.entities().get(3).unwrap().is_some());
}

#[test]
fn delete_missing_entity_is_a_no_op() {
    let db = db_with_tree();
    let removed = db.delete_entity(99).unwrap();
    assert!(removed.is_empty());
    assert_eq!(db.entities().len().unwrap(), 5);
}

#[test]
fn move_rejects_zero_and_missing_ids() {
    let db = db_with_tree();
    assert!(matches!(
        db.move_entity(0, 3).unwrap_err(),
        PermTreeError::InvalidArgument(_)
    ));
    assert!(matches!(
        db.move_entity(2, 99).unwrap_err(),
        PermTreeError::EntityNotFound(99)
    ));
    assert!(matches!(
        db.move_entity(99, 3).unwrap_err(),
        PermTreeError::EntityNotFound(99)
    ));
}

#[test]
fn move_under_own_subtree_is_rejected() {
    let db = db_with_tree();
    assert!(matches!(
        db.move_entity(2, 4).unwrap_err(),
        PermTreeError::InvalidArgument(_)
    ));
    assert!(matches!(
        db.move_entity(2, 2).unwrap_err(),
        PermTreeError::InvalidArgument(_)
    ));
}

#[test]
fn move_reparents_and_recomputes_levels() {
    let db = db_with_tree();
    db.move_entity(4, 3).unwrap();
    let moved = db.entities().get(4).unwrap().unwrap();
    assert_eq!(moved.parent_id, Some(3));
    assert_eq!(moved.level, 2);
    assert!(db.entities().is_same_or_descendant(3, 4).unwrap());
    assert!(!db.entities().is_same_or_descendant(2, 4).unwrap());
    assert_eq!(db.entities().children_of(3).unwrap(), vec![4]);
    assert_eq!(db.entities().children_of(2).unwrap(), vec![5]);
}

#[test]
fn move_keeps_holder_index_when_subtree_has_no_acl() {
    // Mirrors the documented example: E202 moves from under E201 to under
    // E203; with no explicit ACL inside the moved subtree, descendants
    // still point at the same holder.
    let db = PermDb::new();
    db.create_entity(200, None, 10).unwrap();
    db.create_entity(201, Some(200), 10).unwrap();
    db.create_entity(203, Some(200), 10).unwrap();
    db.create_entity(202, Some(201), 10).unwrap();
    db.create_entity(204, Some(202), 10).unwrap();

    let mut acl = Acl::new(200);
    acl.upsert(AclEntry::new(50, false, bits::SEE, 0));
    db.set_acl(acl).unwrap();

    let before = db.entities().get(204).unwrap().unwrap().nearest_holder_id;
    assert_eq!(before, 200);

    db.move_entity(202, 203).unwrap();
    assert_eq!(
        db.entities().get(202).unwrap().unwrap().parent_id,
        Some(203)
    );
    let after = db.entities().get(204).unwrap().unwrap().nearest_holder_id;
    assert_eq!(after, before);
}

#[test]
fn acl_changes_update_holder_index() {
    let db = db_with_tree();
    // no ACL anywhere: everyone points at the root
    assert_eq!(db.entities().get(4).unwrap().unwrap().nearest_holder_id, 1);

    let mut acl = Acl::new(2);
    acl.upsert(AclEntry::new(50, false, bits::SEE, 0));
    db.set_acl(acl).unwrap();
    assert_eq!(db.entities().get(4).unwrap().unwrap().nearest_holder_id, 2);
    assert_eq!(db.entities().get(3).unwrap().unwrap().nearest_holder_id, 1);

    // dropping the ACL moves the subtree back to the root holder
    db.set_acl(Acl::new(2)).unwrap();
    assert_eq!(db.entities().get(4).unwrap().unwrap().nearest_holder_id, 1);
}

#[test]
fn break_boundary_stops_holder_lookups_even_without_acl() {
    let db = db_with_tree();
    db.set_inheritance(2, false).unwrap();
    assert_eq!(db.entities().get(2).unwrap().unwrap().nearest_holder_id, 2);
    assert_eq!(db.entities().get(4).unwrap().unwrap().nearest_holder_id, 2);
    // restoring inheritance reverts the subtree to the root
    db.set_inheritance(2, true).unwrap();
    assert_eq!(db.entities().get(4).unwrap().unwrap().nearest_holder_id, 1);
}

#[test]
fn modify_owner_validates_like_create() {
    let db = db_with_tree();
    db.modify_owner(3, 42).unwrap();
    assert_eq!(db.entities().get(3).unwrap().unwrap().owner_id, 42);
    assert!(matches!(
        db.modify_owner(0, 42).unwrap_err(),
        PermTreeError::InvalidArgument(_)
    ));
    assert!(matches!(
        db.modify_owner(99, 42).unwrap_err(),
        PermTreeError::EntityNotFound(99)
    ));
}
