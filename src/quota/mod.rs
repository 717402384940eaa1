//! Quota group model
//!
//! A quota group is a named memory limit over a set of snaps. Groups nest:
//! a group names its parent and its sub-groups by name, and the links must
//! agree in both directions. The persisted form stores only those names, so
//! every loaded set is passed through [`GroupSet::resolve_cross_references`]
//! which checks the links and fills in derived fields (the slice name).
//!
//! ```text
//! web            snap.web.slice        64MiB   [svc-a]
//! └── api        snap.web-api.slice    32MiB   [svc-b]
//! ```

mod size;
pub mod slice;

pub use size::{ParseSizeError, Size};

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Smallest memory limit a group may carry
pub const MIN_MEMORY_LIMIT: Size = Size::kib(4);

/// Longest allowed group name
pub const MAX_NAME_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    #[error("invalid quota group name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("group {0:?} memory limit must be non-zero")]
    MemoryLimitZero(String),

    #[error("memory limit {limit} of group {name:?} is too small: size must be at least {min}", min = MIN_MEMORY_LIMIT)]
    MemoryLimitTooSmall { name: String, limit: Size },

    #[error("group {0:?} has circular parent reference to itself")]
    SelfParent(String),

    #[error("group {0:?} has circular sub-group reference to itself")]
    SelfSubGroup(String),

    #[error("group {group:?} lists sub-group {sub:?} more than once")]
    DuplicateSubGroup { group: String, sub: String },

    #[error("group {group:?} lists snap {snap:?} more than once")]
    DuplicateSnap { group: String, snap: String },

    #[error("group has name {name:?}, but is referenced as {key:?}")]
    KeyMismatch { key: String, name: String },

    #[error("missing group {parent:?} referenced as the parent of group {group:?}")]
    MissingParent { group: String, parent: String },

    #[error("group {parent:?} does not reference necessary child group {child:?}")]
    MissingChildLink { parent: String, child: String },

    #[error("missing sub-group {sub:?} referenced as the child of group {group:?}")]
    MissingSubGroup { group: String, sub: String },

    #[error("group {child:?} does not reference necessary parent group {parent:?}")]
    MissingParentLink { child: String, parent: String },

    #[error("circular reference between quota groups: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("snap {snap:?} is in both quota group {first:?} and {second:?}")]
    SnapInMultipleGroups {
        snap: String,
        first: String,
        second: String,
    },
}

/// Check a group name against the snap naming rules
///
/// Names are 2-40 characters of lowercase letters, digits and dashes, with
/// at least one letter and no leading, trailing, or doubled dashes.
pub fn validate_name(name: &str) -> Result<(), GroupError> {
    let invalid = |reason| {
        Err(GroupError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.len() < 2 || name.len() > MAX_NAME_LEN {
        return invalid("length must be between 2 and 40 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return invalid("contains invalid characters");
    }
    if !name.chars().any(|c| c.is_ascii_lowercase()) {
        return invalid("must contain at least one letter");
    }
    if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return invalid("dashes must separate letters or digits");
    }
    Ok(())
}

fn validate_memory_limit(name: &str, limit: Size) -> Result<(), GroupError> {
    if limit.is_zero() {
        return Err(GroupError::MemoryLimitZero(name.to_string()));
    }
    if limit < MIN_MEMORY_LIMIT {
        return Err(GroupError::MemoryLimitTooSmall {
            name: name.to_string(),
            limit,
        });
    }
    Ok(())
}

/// A named memory limit over a set of snaps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuotaGroup {
    pub name: String,
    /// Name of the containing group, empty for top-level groups
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_group: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snaps: Vec<String>,
    pub memory_limit: Size,
    /// Filled in by cross-reference resolution
    #[serde(skip)]
    slice: String,
}

impl QuotaGroup {
    /// Create a top-level group
    pub fn new(name: &str, memory_limit: Size) -> Result<Self, GroupError> {
        validate_name(name)?;
        validate_memory_limit(name, memory_limit)?;

        Ok(Self {
            name: name.to_string(),
            parent_group: String::new(),
            sub_groups: Vec::new(),
            snaps: Vec::new(),
            memory_limit,
            slice: String::new(),
        })
    }

    /// Create a group nested under this one, linking both directions
    pub fn new_sub_group(&mut self, name: &str, memory_limit: Size) -> Result<Self, GroupError> {
        if name == self.name {
            return Err(GroupError::SelfSubGroup(name.to_string()));
        }
        if self.sub_groups.iter().any(|sub| sub == name) {
            return Err(GroupError::DuplicateSubGroup {
                group: self.name.clone(),
                sub: name.to_string(),
            });
        }

        let mut sub = Self::new(name, memory_limit)?;
        sub.parent_group = self.name.clone();
        self.sub_groups.push(name.to_string());
        Ok(sub)
    }

    pub fn has_parent(&self) -> bool {
        !self.parent_group.is_empty()
    }

    pub fn contains_snap(&self, snap: &str) -> bool {
        self.snaps.iter().any(|s| s == snap)
    }

    /// Slice unit name, e.g. "snap.web-api.slice"
    ///
    /// Empty until the group has gone through cross-reference resolution.
    pub fn slice_file_name(&self) -> &str {
        &self.slice
    }

    /// Drop a sub-group link, returns whether it was present
    pub(crate) fn unlink_sub_group(&mut self, name: &str) -> bool {
        let before = self.sub_groups.len();
        self.sub_groups.retain(|sub| sub != name);
        self.sub_groups.len() != before
    }

    /// Checks that only need the group itself
    fn validate(&self) -> Result<(), GroupError> {
        validate_name(&self.name)?;
        validate_memory_limit(&self.name, self.memory_limit)?;

        if self.parent_group == self.name {
            return Err(GroupError::SelfParent(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for sub in &self.sub_groups {
            if *sub == self.name {
                return Err(GroupError::SelfSubGroup(self.name.clone()));
            }
            if !seen.insert(sub.as_str()) {
                return Err(GroupError::DuplicateSubGroup {
                    group: self.name.clone(),
                    sub: sub.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        for snap in &self.snaps {
            if !seen.insert(snap.as_str()) {
                return Err(GroupError::DuplicateSnap {
                    group: self.name.clone(),
                    snap: snap.clone(),
                });
            }
        }

        Ok(())
    }
}

/// All quota groups, keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupSet(BTreeMap<String, QuotaGroup>);

impl GroupSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&QuotaGroup> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut QuotaGroup> {
        self.0.get_mut(name)
    }

    /// Insert or replace a group under its own name
    pub fn insert(&mut self, group: QuotaGroup) -> Option<QuotaGroup> {
        self.0.insert(group.name.clone(), group)
    }

    pub fn remove(&mut self, name: &str) -> Option<QuotaGroup> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuotaGroup> {
        self.0.values()
    }

    /// Find the group a snap belongs to
    pub fn group_of_snap(&self, snap: &str) -> Option<&QuotaGroup> {
        self.iter().find(|grp| grp.contains_snap(snap))
    }

    /// The chain of groups from the root down to `name` (inclusive)
    pub fn ancestry(&self, name: &str) -> Result<Vec<&QuotaGroup>, GroupError> {
        let mut chain = Vec::new();
        let mut current = name;

        loop {
            let grp = match self.0.get(current) {
                Some(grp) => grp,
                None => {
                    let group = chain
                        .last()
                        .map(|g: &&QuotaGroup| g.name.clone())
                        .unwrap_or_default();
                    return Err(GroupError::MissingParent {
                        group,
                        parent: current.to_string(),
                    });
                }
            };

            if chain.iter().any(|g: &&QuotaGroup| g.name == grp.name) {
                let mut names: Vec<String> = chain.iter().map(|g| g.name.clone()).collect();
                names.push(grp.name.clone());
                return Err(GroupError::Cycle(names));
            }
            chain.push(grp);

            if !grp.has_parent() {
                break;
            }
            current = &grp.parent_group;
        }

        chain.reverse();
        Ok(chain)
    }

    /// Validate every link in the set and fill in derived fields
    pub fn resolve_cross_references(&mut self) -> Result<(), GroupError> {
        for (key, grp) in &self.0 {
            if *key != grp.name {
                return Err(GroupError::KeyMismatch {
                    key: key.clone(),
                    name: grp.name.clone(),
                });
            }
            grp.validate()?;

            if grp.has_parent() {
                let parent = self.0.get(&grp.parent_group).ok_or_else(|| GroupError::MissingParent {
                    group: grp.name.clone(),
                    parent: grp.parent_group.clone(),
                })?;
                if !parent.sub_groups.contains(&grp.name) {
                    return Err(GroupError::MissingChildLink {
                        parent: parent.name.clone(),
                        child: grp.name.clone(),
                    });
                }
            }

            for sub_name in &grp.sub_groups {
                let sub = self.0.get(sub_name).ok_or_else(|| GroupError::MissingSubGroup {
                    group: grp.name.clone(),
                    sub: sub_name.clone(),
                })?;
                if sub.parent_group != grp.name {
                    return Err(GroupError::MissingParentLink {
                        child: sub.name.clone(),
                        parent: grp.name.clone(),
                    });
                }
            }
        }

        // A snap may only be limited by one group
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for grp in self.0.values() {
            for snap in &grp.snaps {
                if let Some(first) = owners.insert(snap, &grp.name) {
                    return Err(GroupError::SnapInMultipleGroups {
                        snap: snap.clone(),
                        first: first.to_string(),
                        second: grp.name.clone(),
                    });
                }
            }
        }

        // Links agree; walking parents now only fails on cycles
        let mut slices = Vec::with_capacity(self.0.len());
        for name in self.0.keys() {
            let path: Vec<&str> = self
                .ancestry(name)?
                .iter()
                .map(|grp| grp.name.as_str())
                .collect();
            slices.push((name.clone(), slice::slice_name(&path)));
        }
        for (name, slice) in slices {
            if let Some(grp) = self.0.get_mut(&name) {
                grp.slice = slice;
            }
        }

        Ok(())
    }
}

impl FromIterator<QuotaGroup> for GroupSet {
    fn from_iter<I: IntoIterator<Item = QuotaGroup>>(iter: I) -> Self {
        let mut set = GroupSet::new();
        for grp in iter {
            set.insert(grp);
        }
        set
    }
}
