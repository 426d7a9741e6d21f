use std::str::FromStr;

use crate::node::{NodeDetail, PropertiesMap};

/// Kind of membership change recorded in the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipEventType {
    MemberAdded,
    MemberRemoved,
    CoordinatorChanged,
}

impl MembershipEventType {
    /// Column encoding shared by every node using the same store.
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipEventType::MemberAdded => "MEMBER_ADDED",
            MembershipEventType::MemberRemoved => "MEMBER_REMOVED",
            MembershipEventType::CoordinatorChanged => "COORDINATOR_CHANGED",
        }
    }
}

impl std::fmt::Display for MembershipEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MembershipEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MEMBER_ADDED" => Ok(MembershipEventType::MemberAdded),
            "MEMBER_REMOVED" => Ok(MembershipEventType::MemberRemoved),
            "COORDINATOR_CHANGED" => Ok(MembershipEventType::CoordinatorChanged),
            other => Err(format!("unknown membership event type: {}", other)),
        }
    }
}

/// One pending notification for `target_node_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberEvent {
    /// Insertion order; increases monotonically per store
    pub sequence: i64,
    pub target_node_id: String,
    pub target_group_id: String,
    pub event_type: MembershipEventType,
    /// The node the event is about
    pub subject_node_id: String,
    /// Properties of the subject captured when a removal was recorded
    pub subject_properties: Option<PropertiesMap>,
}

/// Application callback for membership changes in one group.
///
/// Callbacks run on the event listener task, so they should return quickly.
/// Re-delivery is not expected, but added/removed handlers should still be
/// idempotent since a node can leave and rejoin under the same id.
pub trait MemberEventListener: Send + Sync {
    /// Group whose events this listener wants
    fn group_id(&self) -> &str;

    fn member_added(&self, node: &NodeDetail);

    fn member_removed(&self, node: &NodeDetail);

    fn coordinator_changed(&self, node: &NodeDetail);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_column_encoding() {
        for ty in [
            MembershipEventType::MemberAdded,
            MembershipEventType::MemberRemoved,
            MembershipEventType::CoordinatorChanged,
        ] {
            assert_eq!(ty.as_str().parse::<MembershipEventType>(), Ok(ty));
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!("MEMBER_SUSPECTED".parse::<MembershipEventType>().is_err());
    }

    #[test]
    fn event_type_display() {
        assert_eq!(
            MembershipEventType::CoordinatorChanged.to_string(),
            "COORDINATOR_CHANGED"
        );
    }
}
