//! In-memory backend for quota integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use snapquota::backend::{
    AppInfo, BackendError, EnsureOptions, FeatureFlags, ModifiedUnit, OptionsResolver,
    ServiceControl, ServiceManager, ServiceOptions, SnapInfo, SnapRegistry, StopReason, UnitSync,
};
use snapquota::QuotaGroup;

/// Installed snaps, rendered units, and a log of service manager calls
pub struct FakeBackend {
    snaps: BTreeMap<String, SnapInfo>,
    disabled: HashMap<String, HashSet<String>>,
    flag_enabled: AtomicBool,
    systemd_version: u32,
    units: Mutex<BTreeMap<String, String>>,
    ensure_options: Mutex<Vec<EnsureOptions>>,
    stray: Option<AppInfo>,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            snaps: BTreeMap::new(),
            disabled: HashMap::new(),
            flag_enabled: AtomicBool::new(true),
            systemd_version: 249,
            units: Mutex::new(BTreeMap::new()),
            ensure_options: Mutex::new(Vec::new()),
            stray: None,
            calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        }
    }

    /// Install a snap with one service per app name
    pub fn with_snap(mut self, name: &str, apps: &[&str]) -> Self {
        let services = apps.iter().map(|app| AppInfo::new(name, app)).collect();
        self.snaps.insert(
            name.to_string(),
            SnapInfo {
                name: name.to_string(),
                revision: "1".to_string(),
                services,
            },
        );
        self
    }

    /// Make `app` of `snap` start after `dep`
    pub fn with_ordering(mut self, snap: &str, app: &str, dep: &str) -> Self {
        if let Some(info) = self.snaps.get_mut(snap) {
            if let Some(a) = info.services.iter_mut().find(|a| a.name == app) {
                a.after.push(dep.to_string());
            }
        }
        self
    }

    pub fn with_disabled(mut self, snap: &str, app: &str) -> Self {
        self.disabled
            .entry(snap.to_string())
            .or_default()
            .insert(app.to_string());
        self
    }

    pub fn set_flag_enabled(&self, enabled: bool) {
        self.flag_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn with_systemd_version(mut self, version: u32) -> Self {
        self.systemd_version = version;
        self
    }

    /// Report a changed service of `snap` on every unit sync, whatever snaps were asked for
    pub fn with_stray_service(mut self, snap: &str, app: &str) -> Self {
        self.stray = Some(AppInfo::new(snap, app));
        self
    }

    /// Options passed to each unit sync, in order
    pub fn ensure_options(&self) -> Vec<EnsureOptions> {
        self.ensure_options.lock().unwrap().clone()
    }

    /// Fail the first call whose log entry starts with `prefix`
    pub fn fail_on(&self, prefix: &str) {
        *self.fail_on.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Calls that touched the service manager
    pub fn restarts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("ensure ") && !c.starts_with("query "))
            .collect()
    }

    pub fn unit(&self, name: &str) -> Option<String> {
        self.units.lock().unwrap().get(name).cloned()
    }

    fn record(&self, call: String) -> Result<(), BackendError> {
        let fail = {
            let mut fail_on = self.fail_on.lock().unwrap();
            let hit = fail_on.as_deref().is_some_and(|prefix| call.starts_with(prefix));
            if hit {
                *fail_on = None;
            }
            hit
        };
        self.calls.lock().unwrap().push(call.clone());
        if fail {
            return Err(BackendError::Other(format!("injected failure: {}", call)));
        }
        Ok(())
    }

    /// Store `content` for `unit`, returning the previous content if it changed
    fn write_unit(&self, unit: &str, content: String) -> Option<String> {
        let mut units = self.units.lock().unwrap();
        let old = units.get(unit).cloned().unwrap_or_default();
        if old == content {
            return None;
        }
        units.insert(unit.to_string(), content);
        Some(old)
    }
}

impl SnapRegistry for FakeBackend {
    async fn current_info(&self, snap: &str) -> Result<SnapInfo, BackendError> {
        self.snaps
            .get(snap)
            .cloned()
            .ok_or_else(|| BackendError::SnapNotFound(snap.to_string()))
    }
}

impl OptionsResolver for FakeBackend {}

impl UnitSync for FakeBackend {
    async fn ensure_snap_services(
        &self,
        snaps: &BTreeMap<String, (SnapInfo, ServiceOptions)>,
        options: &EnsureOptions,
        on_modified: &mut (dyn FnMut(ModifiedUnit) + Send),
    ) -> Result<(), BackendError> {
        let names: Vec<&str> = snaps.keys().map(String::as_str).collect();
        self.record(format!("ensure {}", names.join(",")))?;
        self.ensure_options.lock().unwrap().push(*options);

        if let Some(app) = &self.stray {
            on_modified(ModifiedUnit::Service {
                app: app.clone(),
                unit: app.service_name(),
                old: String::new(),
                new: "Slice=".to_string(),
            });
        }

        for (info, opts) in snaps.values() {
            for grp in &opts.ancestry {
                let unit = grp.slice_file_name().to_string();
                let new = format!("MemoryMax={}", grp.memory_limit.bytes());
                if let Some(old) = self.write_unit(&unit, new.clone()) {
                    on_modified(ModifiedUnit::Slice {
                        group: grp.name.clone(),
                        unit,
                        old,
                        new,
                    });
                }
            }

            for app in &info.services {
                let unit = app.service_name();
                let new = format!("Slice={}", opts.slice().unwrap_or(""));
                if let Some(old) = self.write_unit(&unit, new.clone()) {
                    on_modified(ModifiedUnit::Service {
                        app: app.clone(),
                        unit,
                        old,
                        new,
                    });
                }
            }
        }
        Ok(())
    }

    async fn remove_quota_group(&self, group: &QuotaGroup) -> Result<(), BackendError> {
        self.record(format!("remove-group {}", group.name))?;
        self.units.lock().unwrap().remove(group.slice_file_name());
        Ok(())
    }
}

impl ServiceManager for FakeBackend {
    async fn restart(&self, unit: &str, _timeout: Duration) -> Result<(), BackendError> {
        self.record(format!("restart {}", unit))
    }

    async fn stop(&self, unit: &str, _timeout: Duration) -> Result<(), BackendError> {
        self.record(format!("stop {}", unit))
    }

    async fn version(&self) -> Result<u32, BackendError> {
        Ok(self.systemd_version)
    }
}

impl ServiceControl for FakeBackend {
    async fn query_disabled_services(&self, snap: &SnapInfo) -> Result<HashSet<String>, BackendError> {
        self.record(format!("query {}", snap.name))?;
        Ok(self.disabled.get(&snap.name).cloned().unwrap_or_default())
    }

    async fn stop_services(&self, apps: &[AppInfo], reason: StopReason) -> Result<(), BackendError> {
        for app in apps {
            self.record(format!("stop-service {} ({})", app.service_name(), reason.as_str()))?;
        }
        Ok(())
    }

    async fn start_services(&self, apps: &[AppInfo], disabled: &HashSet<String>) -> Result<(), BackendError> {
        for app in apps.iter().filter(|a| !disabled.contains(&a.name)) {
            self.record(format!("start-service {}", app.service_name()))?;
        }
        Ok(())
    }
}

impl FeatureFlags for FakeBackend {
    fn is_enabled(&self, flag: &str) -> bool {
        self.flag_enabled.load(Ordering::SeqCst) && flag == "quota-groups"
    }
}

/// Snaps most tests use: three single-service snaps and one with two apps
pub fn backend() -> FakeBackend {
    FakeBackend::new()
        .with_snap("svc-a", &["daemon"])
        .with_snap("svc-b", &["daemon"])
        .with_snap("svc-c", &["daemon"])
        .with_snap("multi", &["server", "worker"])
}

pub fn snaps(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
