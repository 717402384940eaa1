//! Reconciliation of one quota group with the unit layer
//!
//! Computes the desired options for every snap the group touches, lets the
//! unit sync rewrite what changed, and turns the reported changes into a
//! [`RestartPlan`]. Running it twice in a row is harmless: the second unit
//! sync reports nothing and nothing is restarted.

use std::collections::BTreeMap;

use crate::backend::{Backend, ModifiedUnit, ServiceOptions, SnapInfo};
use crate::quota::{GroupSet, QuotaGroup};

use super::restart::{RestartPlan, RestartSequencer};
use super::{QuotaError, QuotaManager};

impl<B: Backend> QuotaManager<B> {
    /// Bring the units of `grp`'s snaps (plus `extra_snaps`) in line with `all`
    ///
    /// `grp` may be a group that was just deleted from `all`; its slice is
    /// then stopped and removed.
    pub async fn ensure_services_for_group(
        &self,
        grp: &QuotaGroup,
        all: &GroupSet,
        extra_snaps: &[String],
    ) -> Result<(), QuotaError> {
        let mut snaps: BTreeMap<String, (SnapInfo, ServiceOptions)> = BTreeMap::new();
        for snap in grp.snaps.iter().chain(extra_snaps) {
            if snaps.contains_key(snap) {
                continue;
            }
            let info = self.backend.current_info(snap).await?;
            let opts = self.backend.snap_service_options(snap, all)?;
            snaps.insert(snap.clone(), (info, opts));
        }

        log::info!(
            "Reconciling quota group {} ({} snaps)",
            grp.name,
            snaps.len()
        );

        let mut plan = RestartPlan::default();
        {
            let mut on_modified = |unit: ModifiedUnit| match unit {
                ModifiedUnit::Slice { group, unit, .. } => {
                    log::debug!("Slice {} of quota group {} changed", unit, group);
                    plan.add_slice(&group, &unit);
                }
                ModifiedUnit::Service { app, unit, .. } => {
                    log::debug!("Service {} changed", unit);
                    match snaps.get(&app.snap) {
                        Some((info, _)) => plan.add_service(info, app),
                        None => log::warn!(
                            "Not restarting {}: snap {} is outside this reconciliation",
                            unit,
                            app.snap
                        ),
                    }
                }
                ModifiedUnit::Activation { unit, .. } => {
                    // Restarting the service covers its sockets and timers
                    log::debug!("Ignoring changed activation unit {}", unit);
                }
            };

            self.backend
                .ensure_snap_services(&snaps, &self.config.ensure, &mut on_modified)
                .await?;
        }

        if !all.contains(&grp.name) {
            plan.removed = Some(grp.clone());
        }

        if plan.is_empty() {
            log::debug!("Quota group {} already up to date", grp.name);
            return Ok(());
        }

        RestartSequencer::new(self.config.slice_timeout)
            .run(&self.backend, &plan)
            .await
            .map_err(|source| QuotaError::Restart {
                group: grp.name.clone(),
                source,
            })
    }
}
