//! Quota group manager
//!
//! Creates, updates, and removes quota groups, then brings the unit layer
//! in line with the new hierarchy:
//!
//! ```text
//!  validate ──► patch groups ──► persist ──► reconcile ──► restart
//!  (no state     (touched        (one         (unit sync)   (slices, then
//!   changes)      groups only)    value)                      services)
//! ```
//!
//! Validation failures leave the state untouched. Reconciliation runs after
//! the new groups are persisted and is not rolled back: if it fails, the
//! declared groups are ahead of the live units until the next
//! reconciliation of an affected group.

pub mod deps;
mod ensure;
mod quotas;
pub mod restart;
mod update;

pub use deps::CycleError;
pub use quotas::{all_quotas, get_quota, QUOTAS_KEY};
pub use restart::{RestartError, RestartPhase, RestartPlan, RestartSequencer};
pub use update::{MembershipChange, ParentChange, QuotaGroupUpdate, QuotaUpdate};

use std::time::Duration;

use crate::backend::{Backend, BackendError, EnsureOptions};
use crate::quota::{GroupError, GroupSet, QuotaGroup, Size};
use crate::state::{State, StateError};

/// Feature flag that gates quota creation and updates
pub const QUOTA_GROUPS_FLAG: &str = "quota-groups";

/// Oldest systemd that supports the slice properties quotas rely on
pub const MIN_SYSTEMD_VERSION: u32 = 205;

/// Timeout for each slice stop or restart
pub const SLICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("experimental feature disabled - test it by setting 'experimental.{0}' to true")]
    FeatureDisabled(String),

    #[error("systemd version too old: snap quotas requires systemd {need} and newer (currently have {have})")]
    SystemdTooOld { have: u32, need: u32 },

    #[error("group {0:?} already exists")]
    AlreadyExists(String),

    #[error("quota group {0:?} does not exist")]
    NotFound(String),

    #[error("cannot create group under non-existent parent group {0:?}")]
    ParentNotFound(String),

    #[error("cannot move quota group {group:?} to non-existent parent group {parent:?}")]
    NewParentNotFound { group: String, parent: String },

    #[error("cannot remove quota group {0:?} with sub-groups, remove the sub-groups first")]
    HasSubGroups(String),

    #[error("cannot orphan quota group {0:?}: it is already without a parent")]
    OrphanWithoutParent(String),

    #[error("cannot both orphan a sub-group and move to a new parent group")]
    ConflictingParentChange,

    #[error("cannot use snap {snap:?} in group {group:?}: {source}")]
    InvalidSnap {
        snap: String,
        group: String,
        source: BackendError,
    },

    #[error("cannot add snap {snap:?} to group {group:?}: snap already in quota group {other:?}")]
    SnapAlreadyGrouped {
        snap: String,
        group: String,
        other: String,
    },

    #[error("snap {snap:?} is not in quota group {group:?}")]
    SnapNotInGroup { snap: String, group: String },

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error("cannot update quotas: {0}")]
    Inconsistent(GroupError),

    #[error("persisted quota groups are inconsistent: {0}")]
    Corrupt(GroupError),

    #[error("cannot remove quota {name:?}: {source}")]
    RemoveInconsistent { name: String, source: GroupError },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("cannot reconcile quota group {group:?}: {source}")]
    Restart { group: String, source: RestartError },
}

/// Tunables for the quota manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    /// Flag that must be enabled for create and update
    pub feature_flag: String,
    pub min_systemd_version: u32,
    /// Timeout for each slice stop or restart
    pub slice_timeout: Duration,
    /// Passed through to every unit sync
    pub ensure: EnsureOptions,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            feature_flag: QUOTA_GROUPS_FLAG.to_string(),
            min_systemd_version: MIN_SYSTEMD_VERSION,
            slice_timeout: SLICE_TIMEOUT,
            ensure: EnsureOptions::default(),
        }
    }
}

impl ControlConfig {
    /// Defaults, with preseeding taken from `SNAPD_PRESEED=1`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.ensure.preseeding = preseeding(std::env::var("SNAPD_PRESEED").ok().as_deref());
        config
    }

    /// Require the snapd snap to be mounted before services start
    pub fn require_mounted_snapd_snap(mut self, required: bool) -> Self {
        self.ensure.require_mounted_snapd_snap = required;
        self
    }
}

/// Only "1" turns preseeding on
fn preseeding(value: Option<&str>) -> bool {
    value == Some("1")
}

/// Applies quota group operations through a [`Backend`]
///
/// Every operation takes `&mut State`: the caller holds the state lock for
/// the whole operation, reconciliation included.
pub struct QuotaManager<B> {
    backend: B,
    config: ControlConfig,
}

impl<B: Backend> QuotaManager<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, ControlConfig::default())
    }

    pub fn with_config(backend: B, config: ControlConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Check the feature flag and the service manager version
    async fn quota_groups_available(&self) -> Result<(), QuotaError> {
        if !self.backend.is_enabled(&self.config.feature_flag) {
            return Err(QuotaError::FeatureDisabled(self.config.feature_flag.clone()));
        }

        let have = self.backend.version().await?;
        if have < self.config.min_systemd_version {
            return Err(QuotaError::SystemdTooOld {
                have,
                need: self.config.min_systemd_version,
            });
        }
        Ok(())
    }

    /// Check that each snap is installed and not in any group yet
    async fn validate_snaps_for_group(
        &self,
        snaps: &[String],
        group: &str,
        all: &GroupSet,
    ) -> Result<(), QuotaError> {
        for snap in snaps {
            self.backend
                .current_info(snap)
                .await
                .map_err(|source| QuotaError::InvalidSnap {
                    snap: snap.clone(),
                    group: group.to_string(),
                    source,
                })?;

            if let Some(other) = all.group_of_snap(snap) {
                return Err(QuotaError::SnapAlreadyGrouped {
                    snap: snap.clone(),
                    group: group.to_string(),
                    other: other.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Create a quota group, optionally as a sub-group of `parent`
    pub async fn create_quota(
        &self,
        st: &mut State,
        name: &str,
        parent: Option<&str>,
        snaps: &[String],
        memory_limit: Size,
    ) -> Result<(), QuotaError> {
        self.quota_groups_available().await?;

        let all = all_quotas(st)?;
        if all.contains(name) {
            return Err(QuotaError::AlreadyExists(name.to_string()));
        }

        self.validate_snaps_for_group(snaps, name, &all).await?;

        let mut updated = Vec::with_capacity(2);
        let mut grp = match parent {
            Some(parent_name) => {
                let mut parent = all
                    .get(parent_name)
                    .cloned()
                    .ok_or_else(|| QuotaError::ParentNotFound(parent_name.to_string()))?;
                let grp = parent.new_sub_group(name, memory_limit)?;
                updated.push(parent);
                grp
            }
            None => QuotaGroup::new(name, memory_limit)?,
        };
        grp.snaps = snaps.to_vec();
        updated.push(grp);

        let all = quotas::patch_quotas(st, updated)?;
        log::info!(
            "Created quota group {} (memory limit {}, {} snaps)",
            name,
            memory_limit,
            snaps.len()
        );

        let grp = resolved(&all, name)?;
        self.ensure_services_for_group(grp, &all, &[]).await
    }

    /// Delete a quota group that has no sub-groups
    ///
    /// The group's snaps end up in no group at all, even if the group was a
    /// sub-group.
    pub async fn remove_quota(&self, st: &mut State, name: &str) -> Result<(), QuotaError> {
        let mut all = all_quotas(st)?;

        let grp = all
            .get(name)
            .cloned()
            .ok_or_else(|| QuotaError::NotFound(name.to_string()))?;

        if !grp.sub_groups.is_empty() {
            return Err(QuotaError::HasSubGroups(name.to_string()));
        }

        if grp.has_parent() {
            let parent = all.get_mut(&grp.parent_group).ok_or_else(|| {
                QuotaError::Internal(format!(
                    "parent group {:?} of group {:?} not found",
                    grp.parent_group, name
                ))
            })?;
            parent.unlink_sub_group(name);
        }

        all.remove(name);
        all.resolve_cross_references()
            .map_err(|source| QuotaError::RemoveInconsistent {
                name: name.to_string(),
                source,
            })?;
        quotas::save_quotas(st, &all)?;
        log::info!("Removed quota group {}", name);

        // The deleted group is absent from `all`, so its slice is torn down
        self.ensure_services_for_group(&grp, &all, &[]).await
    }

    /// Apply an update to an existing quota group
    pub async fn update_quota(
        &self,
        st: &mut State,
        name: &str,
        update: QuotaUpdate,
    ) -> Result<(), QuotaError> {
        self.quota_groups_available().await?;

        let all = all_quotas(st)?;
        let mut grp = all
            .get(name)
            .cloned()
            .ok_or_else(|| QuotaError::NotFound(name.to_string()))?;

        match &update.parent {
            Some(ParentChange::Orphan) if !grp.has_parent() => {
                return Err(QuotaError::OrphanWithoutParent(name.to_string()));
            }
            Some(ParentChange::MoveTo(parent)) if !all.contains(parent) => {
                return Err(QuotaError::NewParentNotFound {
                    group: name.to_string(),
                    parent: parent.clone(),
                });
            }
            Some(ParentChange::MoveTo(parent)) if parent == name => {
                return Err(QuotaError::Inconsistent(GroupError::SelfParent(name.to_string())));
            }
            _ => {}
        }

        // Snaps dropped by a replacement still need their units rewritten
        let mut dropped = Vec::new();
        match update.membership {
            Some(MembershipChange::Add(snaps)) => {
                self.validate_snaps_for_group(&snaps, name, &all).await?;
                grp.snaps.extend(snaps);
            }
            Some(MembershipChange::Replace(snaps)) => {
                let incoming: Vec<String> = snaps
                    .iter()
                    .filter(|snap| !grp.contains_snap(snap))
                    .cloned()
                    .collect();
                self.validate_snaps_for_group(&incoming, name, &all).await?;

                dropped = grp
                    .snaps
                    .iter()
                    .filter(|snap| !snaps.contains(snap))
                    .cloned()
                    .collect();
                grp.snaps = snaps;
            }
            None => {}
        }

        if let Some(limit) = update.memory_limit {
            grp.memory_limit = limit;
        }

        let mut modified = Vec::with_capacity(3);
        match update.parent {
            Some(ParentChange::Orphan) => {
                let mut old_parent = current_parent(&all, &grp)?;
                old_parent.unlink_sub_group(name);
                grp.parent_group.clear();
                modified.push(old_parent);
            }
            Some(ParentChange::MoveTo(parent)) if parent == grp.parent_group => {
                log::debug!("Quota group {} is already a sub-group of {}", name, parent);
            }
            Some(ParentChange::MoveTo(parent)) => {
                if grp.has_parent() {
                    let mut old_parent = current_parent(&all, &grp)?;
                    old_parent.unlink_sub_group(name);
                    modified.push(old_parent);
                }

                let mut new_parent = all.get(&parent).cloned().ok_or_else(|| {
                    QuotaError::Internal(format!("new parent group {:?} vanished", parent))
                })?;
                new_parent.sub_groups.push(name.to_string());
                grp.parent_group = parent;
                modified.push(new_parent);
            }
            None => {}
        }
        modified.push(grp);

        let all = quotas::patch_quotas(st, modified)?;
        log::info!("Updated quota group {}", name);

        let grp = resolved(&all, name)?;
        self.ensure_services_for_group(grp, &all, &dropped).await
    }

    /// Take one snap out of a quota group
    pub async fn remove_snap_from_quota(
        &self,
        st: &mut State,
        group: &str,
        snap: &str,
    ) -> Result<(), QuotaError> {
        let all = all_quotas(st)?;

        let mut grp = all
            .get(group)
            .cloned()
            .ok_or_else(|| QuotaError::NotFound(group.to_string()))?;

        if !grp.contains_snap(snap) {
            return Err(QuotaError::SnapNotInGroup {
                snap: snap.to_string(),
                group: group.to_string(),
            });
        }
        grp.snaps.retain(|s| s != snap);

        let all = quotas::patch_quotas(st, vec![grp])?;
        log::info!("Removed snap {} from quota group {}", snap, group);

        // The snap is no longer in the group, so pass it explicitly
        let grp = resolved(&all, group)?;
        self.ensure_services_for_group(grp, &all, &[snap.to_string()])
            .await
    }
}

fn current_parent(all: &GroupSet, grp: &QuotaGroup) -> Result<QuotaGroup, QuotaError> {
    all.get(&grp.parent_group).cloned().ok_or_else(|| {
        QuotaError::Internal(format!(
            "existing parent group {:?} of group {:?} not found",
            grp.parent_group, grp.name
        ))
    })
}

/// Look up a group that was just persisted
fn resolved<'a>(all: &'a GroupSet, name: &str) -> Result<&'a QuotaGroup, QuotaError> {
    all.get(name)
        .ok_or_else(|| QuotaError::Internal(format!("group {:?} missing after update", name)))
}
