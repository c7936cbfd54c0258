use serde::{Deserialize, Serialize};

/// Named permission bits.
///
/// The low bits carry the built-in repository permissions; everything from
/// [`bits::CUSTOM_START`] upward is application-defined. Masks are plain
/// `u64` values so callers can OR them freely.
pub mod bits {
    /// The entity is visible at all.
    pub const SEE: u64 = 1 << 0;
    /// The entity's content can be opened.
    pub const OPEN: u64 = 1 << 1;
    /// The entity can be modified.
    pub const SAVE: u64 = 1 << 2;
    /// The entity can be deleted.
    pub const DELETE: u64 = 1 << 3;
    /// The entity's access control list can be edited.
    pub const MANAGE_ACCESS: u64 = 1 << 4;
    /// Every built-in permission.
    pub const FULL_CONTROL: u64 = SEE | OPEN | SAVE | DELETE | MANAGE_ACCESS;
    /// First bit applications may assign their own meaning to.
    pub const CUSTOM_START: u64 = 1 << 32;
}

/// Decision for a single permission bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionValue {
    /// The bit is present in the allow total and absent from the deny total.
    Allowed,
    /// The bit is present in the deny total.
    Denied,
    /// No entry decided the bit; treated as denied by default.
    Undefined,
}

impl PermissionValue {
    /// Resolves one bit against accumulated allow/deny totals.
    pub fn from_totals(bit: u64, allow: u64, deny: u64) -> Self {
        if deny & bit != 0 {
            PermissionValue::Denied
        } else if allow & bit != 0 {
            PermissionValue::Allowed
        } else {
            PermissionValue::Undefined
        }
    }
}
