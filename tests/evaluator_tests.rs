use std::sync::Arc;

use permtree::model::{Acl, AclEntry};
use permtree::permissions::PermissionEvaluator;
use permtree::testing::TestPrincipal;
use permtree::{bits, PermDb, PermTreeError, OWNERS};

const GROUP: u32 = 500;
const USER: u32 = 100;

/// E1 (root, ACL: GROUP allowed SEE) -> E2 -> E3, user 100 in GROUP.
fn fixture() -> (Arc<PermDb>, PermissionEvaluator) {
    let db = Arc::new(PermDb::new());
    db.create_entity(1, None, 10).unwrap();
    db.create_entity(2, Some(1), 10).unwrap();
    db.create_entity(3, Some(2), 10).unwrap();
    let mut acl = Acl::new(1);
    acl.upsert(AclEntry::new(GROUP, false, bits::SEE, 0));
    db.set_acl(acl).unwrap();
    db.membership().add_members(GROUP, &[USER], &[]).unwrap();
    let evaluator = PermissionEvaluator::new(Arc::clone(&db));
    (db, evaluator)
}

#[test]
fn group_entry_propagates_to_descendants() {
    let (_db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    assert!(evaluator.has_permission(&user, 3, bits::SEE).unwrap());
    assert!(!evaluator.has_permission(&user, 3, bits::SAVE).unwrap());
}

#[test]
fn missing_entity_is_an_error() {
    let (_db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    assert!(matches!(
        evaluator.has_permission(&user, 99, bits::SEE).unwrap_err(),
        PermTreeError::EntityNotFound(99)
    ));
}

#[test]
fn break_without_copy_denies_inherited_grants() {
    let (db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    assert!(evaluator.has_permission(&user, 3, bits::SEE).unwrap());

    // break at E3 with no copied entries: the walk stops at E3
    db.set_inheritance(3, false).unwrap();
    assert!(!evaluator.has_permission(&user, 3, bits::SEE).unwrap());
    // the ancestor itself is untouched
    assert!(evaluator.has_permission(&user, 1, bits::SEE).unwrap());
}

#[test]
fn deny_wins_over_allow_in_one_entry() {
    let (db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    let mut acl = Acl::new(2);
    acl.upsert(AclEntry::new(USER, false, 0xF, 0x3));
    db.set_acl(acl).unwrap();

    let (allow, deny) = evaluator.permission_totals(&user, 2).unwrap();
    assert_eq!(allow & !deny & 0xF, 0xC);
    assert!(evaluator.has_permission(&user, 2, 0xC).unwrap());
    assert!(!evaluator.has_permission(&user, 2, 0x1).unwrap());
}

#[test]
fn nearer_level_decides_before_farther() {
    let (db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    // root denies SAVE, the child allows it: the child is nearer, so the
    // deny upstream cannot reach E3
    let mut root = Acl::new(1);
    root.upsert(AclEntry::new(GROUP, false, bits::SEE, bits::SAVE));
    db.set_acl(root).unwrap();
    let mut child = Acl::new(2);
    child.upsert(AclEntry::new(GROUP, false, bits::SAVE, 0));
    db.set_acl(child).unwrap();

    assert!(evaluator.has_permission(&user, 3, bits::SAVE).unwrap());
    assert!(evaluator.has_permission(&user, 3, bits::SEE).unwrap());
    // at the root itself the deny stands
    assert!(!evaluator.has_permission(&user, 1, bits::SAVE).unwrap());
}

#[test]
fn local_only_entries_do_not_propagate() {
    let (db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    let mut acl = Acl::new(2);
    acl.upsert(AclEntry {
        identity_id: USER,
        local_only: true,
        kind: Default::default(),
        allow: bits::SAVE,
        deny: 0,
    });
    db.set_acl(acl).unwrap();

    assert!(evaluator.has_permission(&user, 2, bits::SAVE).unwrap());
    assert!(!evaluator.has_permission(&user, 3, bits::SAVE).unwrap());
}

#[test]
fn local_entry_takes_precedence_over_propagating_neighbor() {
    let (db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    let mut acl = Acl::new(2);
    acl.upsert(AclEntry {
        identity_id: USER,
        local_only: true,
        kind: Default::default(),
        allow: bits::OPEN,
        deny: 0,
    });
    acl.upsert(AclEntry::new(USER, false, 0, bits::OPEN));
    db.set_acl(acl).unwrap();

    // at E2 the local allow decides OPEN first
    assert!(evaluator.has_permission(&user, 2, bits::OPEN).unwrap());
    // below E2 only the propagating deny is visible
    assert!(!evaluator.has_permission(&user, 3, bits::OPEN).unwrap());
}

#[test]
fn owner_marker_matches_the_target_entitys_owner() {
    let (db, evaluator) = fixture();
    let mut acl = Acl::new(1);
    acl.upsert(AclEntry::new(OWNERS, false, bits::DELETE, 0));
    db.set_acl(acl).unwrap();

    let owner = TestPrincipal::new(10);
    let stranger = TestPrincipal::new(11);
    assert!(evaluator.has_permission(&owner, 3, bits::DELETE).unwrap());
    assert!(!evaluator.has_permission(&stranger, 3, bits::DELETE).unwrap());

    // ownership is taken from the entity under evaluation
    db.modify_owner(3, 11).unwrap();
    assert!(evaluator.has_permission(&stranger, 3, bits::DELETE).unwrap());
    assert!(!evaluator.has_permission(&stranger, 2, bits::DELETE).unwrap());
}

#[test]
fn dynamic_groups_apply_per_entity_only() {
    let (_db, evaluator) = fixture();
    // user 200 is not in GROUP statically, but its principal reports a
    // dynamic membership at E3 only
    let user = TestPrincipal::new(200).with_dynamic(3, vec![GROUP]);
    assert!(evaluator.has_permission(&user, 3, bits::SEE).unwrap());
    assert!(!evaluator.has_permission(&user, 2, bits::SEE).unwrap());
}

#[test]
fn per_bit_values_distinguish_denied_from_undefined() {
    let (db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    let mut acl = Acl::new(2);
    acl.upsert(AclEntry::new(USER, false, 0, bits::SAVE));
    db.set_acl(acl).unwrap();

    use permtree::model::PermissionValue;
    assert_eq!(
        evaluator.permission_value(&user, 3, bits::SEE).unwrap(),
        PermissionValue::Allowed
    );
    assert_eq!(
        evaluator.permission_value(&user, 3, bits::SAVE).unwrap(),
        PermissionValue::Denied
    );
    assert_eq!(
        evaluator.permission_value(&user, 3, bits::DELETE).unwrap(),
        PermissionValue::Undefined
    );
}

#[test]
fn assert_permission_raises_access_denied() {
    let (_db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    evaluator.assert_permission(&user, 3, bits::SEE).unwrap();
    let err = evaluator
        .assert_permission(&user, 3, bits::SEE | bits::SAVE)
        .unwrap_err();
    match err {
        PermTreeError::AccessDenied {
            entity_id,
            identity_id,
            bits: wanted,
        } => {
            assert_eq!(entity_id, 3);
            assert_eq!(identity_id, USER);
            assert_eq!(wanted, bits::SEE | bits::SAVE);
        }
        other => panic!("expected AccessDenied, got {other}"),
    }
}

#[test]
fn subtree_permission_short_circuits_on_failing_descendant() {
    let (db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    db.create_entity(6, Some(1), 10).unwrap();
    assert!(evaluator
        .has_subtree_permission(&user, 1, bits::SEE)
        .unwrap());

    // denying the group on E3 poisons every subtree that contains it
    let mut acl = Acl::new(3);
    acl.upsert(AclEntry::new(GROUP, false, 0, bits::SEE));
    db.set_acl(acl).unwrap();
    assert!(!evaluator
        .has_subtree_permission(&user, 1, bits::SEE)
        .unwrap());
    assert!(!evaluator
        .has_subtree_permission(&user, 2, bits::SEE)
        .unwrap());
    // a subtree that does not contain E3 is unaffected
    assert!(evaluator
        .has_subtree_permission(&user, 6, bits::SEE)
        .unwrap());
}

#[test]
fn effective_entries_merge_identities_across_levels() {
    let (db, evaluator) = fixture();
    let mut acl = Acl::new(2);
    acl.upsert(AclEntry::new(GROUP, false, bits::OPEN, 0));
    acl.upsert(AclEntry::new(USER, false, 0, bits::DELETE));
    db.set_acl(acl).unwrap();

    let effective = evaluator.effective_entries(3).unwrap();
    assert_eq!(effective[&GROUP], (bits::SEE | bits::OPEN, 0));
    assert_eq!(effective[&USER], (0, bits::DELETE));
}

#[test]
fn identity_deletion_flips_dependent_checks() {
    let (db, evaluator) = fixture();
    let user = TestPrincipal::new(USER);
    assert!(evaluator.has_permission(&user, 3, bits::SEE).unwrap());

    db.remove_identities(&[GROUP]).unwrap();
    assert!(!evaluator.has_permission(&user, 3, bits::SEE).unwrap());
    // both the membership edge and the ACL entry are gone
    assert!(db.membership().groups_of(USER).unwrap().is_empty());
    assert!(db.acls().get(1).unwrap().is_none());
}
