//! Collaborators of the quota control plane
//!
//! Quota operations decide *what* should change; these traits are how
//! they reach the rest of the system to make it happen:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    QuotaManager                      │
//! ├─────────────┬─────────────┬─────────────┬────────────┤
//! │ SnapRegistry│  UnitSync   │ServiceManager│ServiceCtl │
//! │ (snap info) │ (unit files)│ (systemctl) │(start/stop)│
//! └─────────────┴─────────────┴─────────────┴────────────┘
//! ```
//!
//! The host daemon provides one type implementing all of them; [`Backend`]
//! is the blanket bundle the manager is generic over.

#![allow(async_fn_in_trait)]

pub mod systemctl;

pub use systemctl::Systemctl;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::manager::deps::{self, CycleError};
use crate::quota::{GroupSet, QuotaGroup};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("snap {0:?} is not installed")]
    SnapNotFound(String),

    #[error("timeout after {timeout:?} waiting for {unit}")]
    Timeout { unit: String, timeout: Duration },

    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// One service (daemon app) of a snap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    /// Instance name of the owning snap
    pub snap: String,
    /// App name within the snap
    pub name: String,
    /// Apps of the same snap that must start before this one
    pub after: Vec<String>,
    /// Apps of the same snap that must start after this one
    pub before: Vec<String>,
}

impl AppInfo {
    pub fn new(snap: &str, name: &str) -> Self {
        Self {
            snap: snap.to_string(),
            name: name.to_string(),
            after: Vec::new(),
            before: Vec::new(),
        }
    }

    /// Service unit name
    /// e.g., snap "svc-a", app "daemon" -> "snap.svc-a.daemon.service"
    pub fn service_name(&self) -> String {
        format!("snap.{}.{}.service", self.snap, self.name)
    }
}

/// Current revision metadata of an installed snap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapInfo {
    /// Instance name
    pub name: String,
    pub revision: String,
    /// Service apps, in declaration order
    pub services: Vec<AppInfo>,
}

/// Desired resource policy for the services of one snap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Group the snap is in, if any
    pub quota_group: Option<QuotaGroup>,
    /// The group's ancestor chain, root first, ending with the group itself
    pub ancestry: Vec<QuotaGroup>,
}

impl ServiceOptions {
    /// Slice the snap's services should run in
    pub fn slice(&self) -> Option<&str> {
        self.quota_group.as_ref().map(|grp| grp.slice_file_name())
    }
}

/// Options that apply to a whole unit sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureOptions {
    /// Image is being preseeded; units are written but nothing is started
    pub preseeding: bool,
    /// Units must wait for the snapd snap to be mounted (Ubuntu Core 18+)
    pub require_mounted_snapd_snap: bool,
}

/// A unit rewritten by [`UnitSync::ensure_snap_services`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifiedUnit {
    /// Aggregate resource unit of a quota group
    Slice {
        group: String,
        unit: String,
        old: String,
        new: String,
    },
    /// Unit running one app of a snap
    Service {
        app: AppInfo,
        unit: String,
        old: String,
        new: String,
    },
    /// Socket or timer that activates an app
    Activation { app: AppInfo, unit: String },
}

/// Why services are being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QuotaGroupModified,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaGroupModified => "quota-group-modified",
        }
    }
}

/// Lookup of installed snaps
pub trait SnapRegistry {
    async fn current_info(&self, snap: &str) -> Result<SnapInfo, BackendError>;
}

/// Computes the effective resource policy of a snap from the group hierarchy
pub trait OptionsResolver {
    fn snap_service_options(&self, snap: &str, groups: &GroupSet) -> Result<ServiceOptions, BackendError> {
        default_service_options(snap, groups)
    }
}

/// Applies desired options to the unit layer
pub trait UnitSync {
    /// Write units for every snap in `snaps`, reporting each changed unit
    async fn ensure_snap_services(
        &self,
        snaps: &BTreeMap<String, (SnapInfo, ServiceOptions)>,
        options: &EnsureOptions,
        on_modified: &mut (dyn FnMut(ModifiedUnit) + Send),
    ) -> Result<(), BackendError>;

    /// Remove the slice unit of a deleted group
    async fn remove_quota_group(&self, group: &QuotaGroup) -> Result<(), BackendError>;
}

/// Control over individual units of the service manager
pub trait ServiceManager {
    async fn restart(&self, unit: &str, timeout: Duration) -> Result<(), BackendError>;

    async fn stop(&self, unit: &str, timeout: Duration) -> Result<(), BackendError>;

    async fn version(&self) -> Result<u32, BackendError>;
}

/// Starting and stopping the services of a snap
pub trait ServiceControl {
    /// Names of apps the administrator disabled
    async fn query_disabled_services(&self, snap: &SnapInfo) -> Result<HashSet<String>, BackendError>;

    /// Order apps so dependencies start first
    fn sort_services(&self, apps: &[AppInfo]) -> Result<Vec<AppInfo>, CycleError> {
        deps::sort_services(apps)
    }

    async fn stop_services(&self, apps: &[AppInfo], reason: StopReason) -> Result<(), BackendError>;

    /// Start apps in the given order, skipping disabled ones
    async fn start_services(&self, apps: &[AppInfo], disabled: &HashSet<String>) -> Result<(), BackendError>;
}

/// Feature flag lookup
pub trait FeatureFlags {
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Everything the quota manager needs from its host
pub trait Backend:
    SnapRegistry + OptionsResolver + UnitSync + ServiceManager + ServiceControl + FeatureFlags
{
}

impl<T> Backend for T where
    T: SnapRegistry + OptionsResolver + UnitSync + ServiceManager + ServiceControl + FeatureFlags
{
}

/// Membership lookup: a snap gets the policy of the group it is in
pub fn default_service_options(snap: &str, groups: &GroupSet) -> Result<ServiceOptions, BackendError> {
    let grp = match groups.group_of_snap(snap) {
        Some(grp) => grp,
        None => return Ok(ServiceOptions::default()),
    };

    let ancestry = groups
        .ancestry(&grp.name)
        .map_err(|e| BackendError::Other(e.to_string()))?
        .into_iter()
        .cloned()
        .collect();

    Ok(ServiceOptions {
        quota_group: Some(grp.clone()),
        ancestry,
    })
}
