//! Validate persisted quota groups and the host service manager

use std::path::Path;
use snapquota::backend::{ServiceManager, Systemctl};
use snapquota::manager::QUOTAS_KEY;
use snapquota::{ControlConfig, GroupSet, State};

pub async fn check(state_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = ControlConfig::from_env();
    let st = State::load(state_path).await?;

    if config.ensure.preseeding {
        println!("preseeding: units are written but not started");
    }

    match Systemctl::default().version().await {
        Ok(version) if version < config.min_systemd_version => {
            println!(
                "systemd {} is too old for quota groups (need {})",
                version, config.min_systemd_version
            );
        }
        Ok(version) => println!("systemd {}", version),
        Err(e) => log::warn!("Cannot query systemd version: {}", e),
    }

    let mut groups: GroupSet = st.get(QUOTAS_KEY)?.unwrap_or_default();
    match groups.resolve_cross_references() {
        Ok(()) => {
            println!("{} quota groups, all consistent", groups.len());
            Ok(())
        }
        Err(e) => {
            log::error!("Quota groups in {} are inconsistent", state_path.display());
            Err(e.into())
        }
    }
}
