use serde::{Deserialize, Serialize};

use super::{EntityId, IdentityId};

/// Distinguishes regular permission entries from entries created by the
/// sharing surface. Both kinds evaluate identically; the kind only controls
/// which editing surface may remove them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    #[default]
    Normal,
    Sharing,
}

/// Key that makes an entry unique inside one ACL.
pub type EntryKey = (IdentityId, bool, EntryKind);

/// One identity's allow/deny bitmask attached to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// User or group the entry applies to. May be [`super::OWNERS`].
    pub identity_id: IdentityId,
    /// Local-only entries apply exclusively at the entity they are stored
    /// on and never propagate to descendants.
    pub local_only: bool,
    #[serde(default)]
    pub kind: EntryKind,
    /// Allowed permission bits.
    pub allow: u64,
    /// Denied permission bits. Deny always wins: after normalization
    /// `allow & deny == 0`.
    pub deny: u64,
}

impl AclEntry {
    /// Creates a normalized entry.
    pub fn new(identity_id: IdentityId, local_only: bool, allow: u64, deny: u64) -> Self {
        let mut entry = Self {
            identity_id,
            local_only,
            kind: EntryKind::Normal,
            allow,
            deny,
        };
        entry.normalize();
        entry
    }

    /// Clears denied bits out of the allow mask. Deny wins.
    pub fn normalize(&mut self) {
        self.allow &= !self.deny;
    }

    /// True when both masks are zero. Such entries are never persisted or
    /// cached.
    pub fn is_empty(&self) -> bool {
        self.allow == 0 && self.deny == 0
    }

    /// Uniqueness key of this entry inside an ACL.
    pub fn key(&self) -> EntryKey {
        (self.identity_id, self.local_only, self.kind)
    }
}

/// The full set of entries for one entity plus its inherit flag.
///
/// An `Acl` with zero entries and `inherits == true` carries no information
/// and is treated as absent everywhere (never persisted, never cached). An
/// empty `Acl` with `inherits == false` is meaningful: it marks an
/// inheritance break boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub entity_id: EntityId,
    /// Whether ancestor entries still propagate past this entity.
    pub inherits: bool,
    /// Entries ordered by key for deterministic iteration.
    pub entries: Vec<AclEntry>,
}

impl Acl {
    /// Creates an empty inheriting ACL for the given entity.
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            inherits: true,
            entries: Vec::new(),
        }
    }

    /// True when the ACL carries no information at all and is treated as
    /// absent.
    pub fn is_vacant(&self) -> bool {
        self.entries.is_empty() && self.inherits
    }

    /// Looks up an entry by key.
    pub fn entry(&self, key: EntryKey) -> Option<&AclEntry> {
        self.entries.iter().find(|e| e.key() == key)
    }

    /// Inserts or replaces an entry, keeping the entry list normalized,
    /// free of zero-mask entries and sorted by key.
    pub fn upsert(&mut self, mut entry: AclEntry) {
        entry.normalize();
        self.entries.retain(|e| e.key() != entry.key());
        if !entry.is_empty() {
            self.entries.push(entry);
        }
        self.entries.sort_by_key(AclEntry::key);
    }

    /// Removes every entry referencing one of the given identities.
    /// Returns true when anything was removed.
    pub fn remove_identities(&mut self, ids: &[IdentityId]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !ids.contains(&e.identity_id));
        self.entries.len() != before
    }

    /// Drops zero-mask entries and re-sorts. Called before an ACL is cached
    /// or persisted.
    pub fn normalize(&mut self) {
        for entry in &mut self.entries {
            entry.normalize();
        }
        self.entries.retain(|e| !e.is_empty());
        self.entries.sort_by_key(AclEntry::key);
    }
}
