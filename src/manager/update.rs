//! Quota group update requests
//!
//! [`QuotaUpdate`] is what the manager applies: each kind of change is its
//! own optional field, and orphaning versus moving is one enum, so a request
//! cannot ask for both. [`QuotaGroupUpdate`] is the flat form task handlers
//! receive and converts into it.

use serde::{Deserialize, Serialize};

use crate::quota::Size;

use super::QuotaError;

/// Change to the snaps of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// Append snaps to the group
    Add(Vec<String>),
    /// Make these the only snaps of the group
    Replace(Vec<String>),
}

/// Change to where a group sits in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentChange {
    /// Detach from the current parent and become top-level
    Orphan,
    /// Become a sub-group of the named group
    MoveTo(String),
}

/// A validated update to one quota group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaUpdate {
    pub membership: Option<MembershipChange>,
    pub memory_limit: Option<Size>,
    pub parent: Option<ParentChange>,
}

impl QuotaUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snaps<I, S>(mut self, snaps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership = Some(MembershipChange::Add(snaps.into_iter().map(Into::into).collect()));
        self
    }

    pub fn replace_snaps<I, S>(mut self, snaps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership = Some(MembershipChange::Replace(
            snaps.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn memory_limit(mut self, limit: Size) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn orphan(mut self) -> Self {
        self.parent = Some(ParentChange::Orphan);
        self
    }

    pub fn move_to(mut self, parent: &str) -> Self {
        self.parent = Some(ParentChange::MoveTo(parent.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.membership.is_none() && self.memory_limit.is_none() && self.parent.is_none()
    }
}

/// Flat update as sent by clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QuotaGroupUpdate {
    /// Snaps to add, or the full new list with `replace_snaps`
    pub add_snaps: Vec<String>,
    /// Zero leaves the limit unchanged
    pub new_memory_limit: Size,
    pub replace_snaps: bool,
    /// Empty leaves the parent unchanged
    pub new_parent_group: String,
    pub orphan_sub_group: bool,
}

impl TryFrom<QuotaGroupUpdate> for QuotaUpdate {
    type Error = QuotaError;

    fn try_from(flat: QuotaGroupUpdate) -> Result<Self, Self::Error> {
        let parent = match (flat.orphan_sub_group, flat.new_parent_group.is_empty()) {
            (true, false) => return Err(QuotaError::ConflictingParentChange),
            (true, true) => Some(ParentChange::Orphan),
            (false, false) => Some(ParentChange::MoveTo(flat.new_parent_group)),
            (false, true) => None,
        };

        let membership = if flat.replace_snaps {
            Some(MembershipChange::Replace(flat.add_snaps))
        } else if !flat.add_snaps.is_empty() {
            Some(MembershipChange::Add(flat.add_snaps))
        } else {
            None
        };

        let memory_limit = (!flat.new_memory_limit.is_zero()).then_some(flat.new_memory_limit);

        Ok(Self {
            membership,
            memory_limit,
            parent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_flat_update() {
        let update = QuotaUpdate::try_from(QuotaGroupUpdate::default()).unwrap();
        assert!(update.is_empty());
    }

    #[test]
    fn test_zero_memory_limit_means_unchanged() {
        let flat = QuotaGroupUpdate {
            new_memory_limit: Size(0),
            ..Default::default()
        };
        assert_eq!(QuotaUpdate::try_from(flat).unwrap().memory_limit, None);

        let flat = QuotaGroupUpdate {
            new_memory_limit: Size::mib(128),
            ..Default::default()
        };
        assert_eq!(
            QuotaUpdate::try_from(flat).unwrap().memory_limit,
            Some(Size::mib(128))
        );
    }

    #[test]
    fn test_orphan_and_move_conflict() {
        let flat = QuotaGroupUpdate {
            orphan_sub_group: true,
            new_parent_group: "web".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            QuotaUpdate::try_from(flat),
            Err(QuotaError::ConflictingParentChange)
        ));
    }

    #[test]
    fn test_parent_changes() {
        let orphan = QuotaGroupUpdate {
            orphan_sub_group: true,
            ..Default::default()
        };
        assert_eq!(
            QuotaUpdate::try_from(orphan).unwrap(),
            QuotaUpdate::new().orphan()
        );

        let adopt = QuotaGroupUpdate {
            new_parent_group: "web".to_string(),
            ..Default::default()
        };
        assert_eq!(
            QuotaUpdate::try_from(adopt).unwrap(),
            QuotaUpdate::new().move_to("web")
        );
    }

    #[test]
    fn test_membership_changes() {
        let add = QuotaGroupUpdate {
            add_snaps: vec!["svc-a".to_string()],
            ..Default::default()
        };
        assert_eq!(
            QuotaUpdate::try_from(add).unwrap(),
            QuotaUpdate::new().add_snaps(["svc-a"])
        );

        // replacing with nothing empties the group
        let clear = QuotaGroupUpdate {
            replace_snaps: true,
            ..Default::default()
        };
        assert_eq!(
            QuotaUpdate::try_from(clear).unwrap().membership,
            Some(MembershipChange::Replace(Vec::new()))
        );
    }

    #[test]
    fn test_flat_update_field_names() {
        let flat = QuotaGroupUpdate {
            add_snaps: vec!["svc-a".to_string()],
            orphan_sub_group: true,
            ..Default::default()
        };
        let encoded = rmp_serde::to_vec_named(&flat).unwrap();
        let text = String::from_utf8_lossy(&encoded);
        assert!(text.contains("add-snaps"));
        assert!(text.contains("orphan-sub-group"));

        let decoded: QuotaGroupUpdate = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, flat);
    }
}
