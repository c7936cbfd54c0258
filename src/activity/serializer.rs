//! Activity marshaling boundary.
//!
//! The same serializer is used for the activity log and for the wire, so a
//! node can replay persisted activities through the exact code path that
//! handles received ones.

use crate::activity::Activity;
use crate::error::PermTreeResult;

/// Marshals activities to and from bytes.
pub trait ActivitySerializer: Send + Sync {
    fn serialize(&self, activity: &Activity) -> PermTreeResult<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> PermTreeResult<Activity>;
}

/// JSON serializer, the default wire and log format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonActivitySerializer;

impl ActivitySerializer for JsonActivitySerializer {
    fn serialize(&self, activity: &Activity) -> PermTreeResult<Vec<u8>> {
        Ok(serde_json::to_vec(activity)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> PermTreeResult<Activity> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityBody, ActivityOrigin};

    #[test]
    fn wire_round_trip_marks_activities_as_received() {
        let serializer = JsonActivitySerializer;
        let mut activity = Activity::local(ActivityBody::CreateEntity {
            entity_id: 7,
            parent_id: Some(1),
            owner_id: 42,
        });
        activity.id = Some(99);

        let bytes = serializer.serialize(&activity).unwrap();
        let decoded = serializer.deserialize(&bytes).unwrap();
        assert_eq!(decoded.id, Some(99));
        assert_eq!(decoded.origin, ActivityOrigin::Received);
        assert_eq!(decoded.body, activity.body);
    }
}
