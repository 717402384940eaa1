//! Request protocol for quota task handlers
//!
//! Defines request/response types the host daemon decodes from its clients
//! and a dispatcher that runs them against the quota manager.

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::manager::{all_quotas, get_quota, QuotaError, QuotaGroupUpdate, QuotaManager, QuotaUpdate};
use crate::quota::{QuotaGroup, Size};
use crate::state::State;

/// Request from a client to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Create a group, optionally under a parent
    Create {
        name: String,
        parent: Option<String>,
        snaps: Vec<String>,
        memory_limit: Size,
    },
    /// Update an existing group
    Update {
        name: String,
        update: QuotaGroupUpdate,
    },
    /// Remove a leaf group
    Remove { name: String },
    /// Take a snap out of a group
    RemoveSnap { group: String, snap: String },
    /// List every group
    List,
    /// Get one group
    Get { name: String },
}

/// Group info returned by list/get
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub parent: Option<String>,
    pub sub_groups: Vec<String>,
    pub snaps: Vec<String>,
    pub memory_limit: Size,
    pub slice: String,
}

impl From<&QuotaGroup> for GroupInfo {
    fn from(grp: &QuotaGroup) -> Self {
        Self {
            name: grp.name.clone(),
            parent: grp.has_parent().then(|| grp.parent_group.clone()),
            sub_groups: grp.sub_groups.clone(),
            snaps: grp.snaps.clone(),
            memory_limit: grp.memory_limit,
            slice: grp.slice_file_name().to_string(),
        }
    }
}

/// Response from the daemon to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Success with no data
    Ok,
    /// Groups, ordered by name
    Groups(Vec<GroupInfo>),
    /// One group, `None` if it does not exist
    Group(Option<GroupInfo>),
    /// Error with message
    Error(String),
}

impl<B: Backend> QuotaManager<B> {
    /// Run one request with the state lock held
    pub async fn handle(&self, st: &mut State, request: Request) -> Response {
        match self.dispatch(st, request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Quota request failed: {}", e);
                Response::Error(e.to_string())
            }
        }
    }

    async fn dispatch(&self, st: &mut State, request: Request) -> Result<Response, QuotaError> {
        match request {
            Request::Create {
                name,
                parent,
                snaps,
                memory_limit,
            } => {
                // An empty parent means top-level
                let parent = parent.as_deref().filter(|p| !p.is_empty());
                self.create_quota(st, &name, parent, &snaps, memory_limit)
                    .await?;
                Ok(Response::Ok)
            }
            Request::Update { name, update } => {
                let update = QuotaUpdate::try_from(update)?;
                self.update_quota(st, &name, update).await?;
                Ok(Response::Ok)
            }
            Request::Remove { name } => {
                self.remove_quota(st, &name).await?;
                Ok(Response::Ok)
            }
            Request::RemoveSnap { group, snap } => {
                self.remove_snap_from_quota(st, &group, &snap).await?;
                Ok(Response::Ok)
            }
            Request::List => {
                let groups = all_quotas(st)?;
                Ok(Response::Groups(groups.iter().map(GroupInfo::from).collect()))
            }
            Request::Get { name } => {
                let grp = get_quota(st, &name)?;
                Ok(Response::Group(grp.as_ref().map(GroupInfo::from)))
            }
        }
    }
}
