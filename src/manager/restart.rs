//! Restart sequencing after a unit sync
//!
//! ```text
//!     ┌──────────────────┐
//!     │       Idle       │
//!     └────────┬─────────┘
//!              │ run
//!     ┌────────▼─────────┐
//!     │ SlicesRestarting │──────────┐
//!     └────────┬─────────┘          │
//!     ┌────────▼─────────┐          │
//!     │ ServicesStopping │──────────┤ any error
//!     └────────┬─────────┘          │
//!     ┌────────▼─────────┐     ┌────▼────┐
//!     │ ServicesStarting │────►│ Failed  │
//!     └────────┬─────────┘     └─────────┘
//!     ┌────────▼─────────┐
//!     │       Done       │
//!     └──────────────────┘
//! ```
//!
//! Nothing is rolled back on failure: restarts that already happened stay.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use crate::backend::{AppInfo, BackendError, ServiceControl, ServiceManager, SnapInfo, StopReason, UnitSync};
use crate::manager::deps::CycleError;
use crate::quota::QuotaGroup;

/// Where a restart sequence is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    Idle,
    SlicesRestarting,
    ServicesStopping,
    ServicesStarting,
    Done,
    Failed,
}

impl RestartPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SlicesRestarting => "restarting slices",
            Self::ServicesStopping => "stopping services",
            Self::ServicesStarting => "starting services",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RestartPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("error while {phase}: {source}")]
    Backend {
        phase: RestartPhase,
        source: BackendError,
    },

    #[error("error while {phase}: cannot order services of snap {snap:?}: {source}")]
    Cycle {
        phase: RestartPhase,
        snap: String,
        source: CycleError,
    },
}

impl RestartError {
    /// Phase the sequence was in when it failed
    pub fn phase(&self) -> RestartPhase {
        match self {
            Self::Backend { phase, .. } | Self::Cycle { phase, .. } => *phase,
        }
    }
}

/// Services of one snap touched by a unit sync
#[derive(Debug, Clone)]
pub struct SnapRestart {
    pub info: SnapInfo,
    /// Apps whose units changed; these are stopped
    pub affected: Vec<AppInfo>,
}

/// Everything a reconciliation pass needs restarted
#[derive(Debug, Clone, Default)]
pub struct RestartPlan {
    /// (group, slice unit), one entry per group, in the order reported
    pub slices: Vec<(String, String)>,
    /// Group that no longer exists and whose slice must go away
    pub removed: Option<QuotaGroup>,
    pub services: BTreeMap<String, SnapRestart>,
}

impl RestartPlan {
    /// Queue a slice restart, once per group
    pub fn add_slice(&mut self, group: &str, unit: &str) {
        if !self.slices.iter().any(|(g, _)| g == group) {
            self.slices.push((group.to_string(), unit.to_string()));
        }
    }

    /// Queue an app for stop and restart, once per app
    pub fn add_service(&mut self, info: &SnapInfo, app: AppInfo) {
        let entry = self
            .services
            .entry(info.name.clone())
            .or_insert_with(|| SnapRestart {
                info: info.clone(),
                affected: Vec::new(),
            });
        if !entry.affected.iter().any(|a| a.name == app.name) {
            entry.affected.push(app);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty() && self.removed.is_none() && self.services.is_empty()
    }
}

/// Start order and disabled set of one snap, resolved before anything stops
struct StartPlan<'a> {
    snap: &'a SnapRestart,
    order: Vec<AppInfo>,
    disabled: HashSet<String>,
}

/// Runs a [`RestartPlan`] against the service manager
#[derive(Debug)]
pub struct RestartSequencer {
    phase: RestartPhase,
    slice_timeout: Duration,
}

impl RestartSequencer {
    pub fn new(slice_timeout: Duration) -> Self {
        Self {
            phase: RestartPhase::Idle,
            slice_timeout,
        }
    }

    pub fn phase(&self) -> RestartPhase {
        self.phase
    }

    fn enter(&mut self, phase: RestartPhase) {
        log::debug!("Restart sequence: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    fn backend_err(&self, source: BackendError) -> RestartError {
        RestartError::Backend {
            phase: self.phase,
            source,
        }
    }

    /// Run the whole sequence; the sequencer ends in `Done` or `Failed`
    pub async fn run<B>(&mut self, backend: &B, plan: &RestartPlan) -> Result<(), RestartError>
    where
        B: ServiceManager + ServiceControl + UnitSync,
    {
        match self.run_phases(backend, plan).await {
            Ok(()) => {
                self.enter(RestartPhase::Done);
                Ok(())
            }
            Err(e) => {
                log::warn!("Restart sequence failed: {}", e);
                self.enter(RestartPhase::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases<B>(&mut self, backend: &B, plan: &RestartPlan) -> Result<(), RestartError>
    where
        B: ServiceManager + ServiceControl + UnitSync,
    {
        self.enter(RestartPhase::SlicesRestarting);
        for (group, unit) in &plan.slices {
            log::info!("Restarting slice {} of quota group {}", unit, group);
            backend
                .restart(unit, self.slice_timeout)
                .await
                .map_err(|e| self.backend_err(e))?;
        }

        if let Some(grp) = &plan.removed {
            log::info!(
                "Removing slice {} of deleted quota group {}",
                grp.slice_file_name(),
                grp.name
            );
            backend
                .stop(grp.slice_file_name(), self.slice_timeout)
                .await
                .map_err(|e| self.backend_err(e))?;
            backend
                .remove_quota_group(grp)
                .await
                .map_err(|e| self.backend_err(e))?;
        }

        self.enter(RestartPhase::ServicesStopping);

        // Resolve every start order first so a cycle aborts before any stop
        let mut starts = Vec::with_capacity(plan.services.len());
        for (name, snap) in &plan.services {
            let disabled = backend
                .query_disabled_services(&snap.info)
                .await
                .map_err(|e| self.backend_err(e))?;
            let order = backend
                .sort_services(&snap.info.services)
                .map_err(|source| RestartError::Cycle {
                    phase: self.phase,
                    snap: name.clone(),
                    source,
                })?;
            starts.push(StartPlan {
                snap,
                order,
                disabled,
            });
        }

        for start in &starts {
            let names: Vec<&str> = start.snap.affected.iter().map(|a| a.name.as_str()).collect();
            log::info!(
                "Stopping services of snap {}: {}",
                start.snap.info.name,
                names.join(", ")
            );
            backend
                .stop_services(&start.snap.affected, StopReason::QuotaGroupModified)
                .await
                .map_err(|e| self.backend_err(e))?;
        }

        self.enter(RestartPhase::ServicesStarting);
        for start in &starts {
            log::info!(
                "Starting services of snap {} ({} disabled)",
                start.snap.info.name,
                start.disabled.len()
            );
            backend
                .start_services(&start.order, &start.disabled)
                .await
                .map_err(|e| self.backend_err(e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EnsureOptions, ModifiedUnit, ServiceOptions};
    use crate::quota::{GroupSet, Size};
    use std::sync::Mutex;

    /// Records every call in order
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Recorder {
        fn failing_on(call: &str) -> Self {
            Self {
                fail_on: Some(call.to_string()),
                ..Default::default()
            }
        }

        fn record(&self, call: String) -> Result<(), BackendError> {
            let fail = self.fail_on.as_deref() == Some(call.as_str());
            self.calls.lock().unwrap().push(call);
            if fail {
                return Err(BackendError::Other("injected".to_string()));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ServiceManager for Recorder {
        async fn restart(&self, unit: &str, _timeout: Duration) -> Result<(), BackendError> {
            self.record(format!("restart {}", unit))
        }

        async fn stop(&self, unit: &str, _timeout: Duration) -> Result<(), BackendError> {
            self.record(format!("stop {}", unit))
        }

        async fn version(&self) -> Result<u32, BackendError> {
            Ok(249)
        }
    }

    impl UnitSync for Recorder {
        async fn ensure_snap_services(
            &self,
            _snaps: &BTreeMap<String, (SnapInfo, ServiceOptions)>,
            _options: &EnsureOptions,
            _on_modified: &mut (dyn FnMut(ModifiedUnit) + Send),
        ) -> Result<(), BackendError> {
            Ok(())
        }

        async fn remove_quota_group(&self, group: &QuotaGroup) -> Result<(), BackendError> {
            self.record(format!("remove-group {}", group.name))
        }
    }

    impl ServiceControl for Recorder {
        async fn query_disabled_services(&self, _snap: &SnapInfo) -> Result<HashSet<String>, BackendError> {
            Ok(["worker".to_string()].into_iter().collect())
        }

        async fn stop_services(&self, apps: &[AppInfo], reason: StopReason) -> Result<(), BackendError> {
            let names: Vec<&str> = apps.iter().map(|a| a.name.as_str()).collect();
            self.record(format!("stop-services {} ({})", names.join(","), reason.as_str()))
        }

        async fn start_services(&self, apps: &[AppInfo], disabled: &HashSet<String>) -> Result<(), BackendError> {
            let names: Vec<&str> = apps
                .iter()
                .filter(|a| !disabled.contains(&a.name))
                .map(|a| a.name.as_str())
                .collect();
            self.record(format!("start-services {}", names.join(",")))
        }
    }

    fn snap_info() -> SnapInfo {
        let db = AppInfo::new("svc-a", "db");
        let mut web = AppInfo::new("svc-a", "web");
        web.after = vec!["db".to_string()];
        let worker = AppInfo::new("svc-a", "worker");
        SnapInfo {
            name: "svc-a".to_string(),
            revision: "1".to_string(),
            services: vec![web, db, worker],
        }
    }

    fn plan() -> RestartPlan {
        let info = snap_info();
        let mut plan = RestartPlan::default();
        plan.add_slice("web", "snap.web.slice");
        plan.add_slice("web", "snap.web.slice");
        plan.add_service(&info, info.services[0].clone());
        plan.add_service(&info, info.services[0].clone());
        plan
    }

    #[test]
    fn test_phase_as_str() {
        assert_eq!(RestartPhase::Idle.as_str(), "idle");
        assert_eq!(RestartPhase::SlicesRestarting.as_str(), "restarting slices");
        assert_eq!(RestartPhase::ServicesStopping.as_str(), "stopping services");
        assert_eq!(RestartPhase::ServicesStarting.as_str(), "starting services");
        assert_eq!(RestartPhase::Done.as_str(), "done");
        assert_eq!(RestartPhase::Failed.as_str(), "failed");
    }

    #[test]
    fn test_plan_dedups() {
        let plan = plan();
        assert_eq!(plan.slices.len(), 1);
        assert_eq!(plan.services["svc-a"].affected.len(), 1);
        assert!(!plan.is_empty());
        assert!(RestartPlan::default().is_empty());
    }

    #[tokio::test]
    async fn test_full_sequence_order() {
        let backend = Recorder::default();
        let mut seq = RestartSequencer::new(Duration::from_secs(5));
        assert_eq!(seq.phase(), RestartPhase::Idle);

        seq.run(&backend, &plan()).await.unwrap();
        assert_eq!(seq.phase(), RestartPhase::Done);
        assert_eq!(
            backend.calls(),
            vec![
                "restart snap.web.slice",
                "stop-services web (quota-group-modified)",
                "start-services db,web",
            ]
        );
    }

    #[tokio::test]
    async fn test_removed_group_slice_is_stopped_and_removed() {
        let backend = Recorder::default();
        let mut set: GroupSet = [QuotaGroup::new("gone", Size::mib(8)).unwrap()]
            .into_iter()
            .collect();
        set.resolve_cross_references().unwrap();
        let grp = set.remove("gone").unwrap();

        let plan = RestartPlan {
            removed: Some(grp),
            ..Default::default()
        };
        RestartSequencer::new(Duration::from_secs(5))
            .run(&backend, &plan)
            .await
            .unwrap();
        assert_eq!(
            backend.calls(),
            vec!["stop snap.gone.slice", "remove-group gone"]
        );
    }

    #[tokio::test]
    async fn test_failure_stops_sequence() {
        let backend = Recorder::failing_on("restart snap.web.slice");
        let mut seq = RestartSequencer::new(Duration::from_secs(5));

        let err = seq.run(&backend, &plan()).await.unwrap_err();
        assert_eq!(err.phase(), RestartPhase::SlicesRestarting);
        assert_eq!(seq.phase(), RestartPhase::Failed);
        assert_eq!(backend.calls(), vec!["restart snap.web.slice"]);
    }

    #[tokio::test]
    async fn test_start_failure_keeps_stops() {
        let backend = Recorder::failing_on("start-services db,web");
        let mut seq = RestartSequencer::new(Duration::from_secs(5));

        let err = seq.run(&backend, &plan()).await.unwrap_err();
        assert_eq!(err.phase(), RestartPhase::ServicesStarting);
        assert_eq!(backend.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_stopping() {
        let backend = Recorder::default();
        let mut info = snap_info();
        info.services[1].after = vec!["web".to_string()];

        let mut plan = RestartPlan::default();
        plan.add_service(&info, info.services[0].clone());

        let err = RestartSequencer::new(Duration::from_secs(5))
            .run(&backend, &plan)
            .await
            .unwrap_err();
        assert!(matches!(err, RestartError::Cycle { .. }));
        assert_eq!(err.phase(), RestartPhase::ServicesStopping);
        assert!(backend.calls().is_empty());
    }
}
