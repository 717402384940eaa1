//! Show one quota group

use std::path::Path;
use snapquota::{get_quota, State};

pub async fn show(state_path: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let st = State::load(state_path).await?;

    let grp = get_quota(&st, name)?
        .ok_or_else(|| format!("quota group {:?} does not exist", name))?;

    println!("name:    {}", grp.name);
    println!("slice:   {}", grp.slice_file_name());
    if grp.has_parent() {
        println!("parent:  {}", grp.parent_group);
    }
    if !grp.sub_groups.is_empty() {
        println!("subgroups:");
        for sub in &grp.sub_groups {
            println!("  - {}", sub);
        }
    }
    println!("memory:  {}", grp.memory_limit);
    if !grp.snaps.is_empty() {
        println!("snaps:");
        for snap in &grp.snaps {
            println!("  - {}", snap);
        }
    }

    Ok(())
}
