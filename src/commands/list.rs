//! List quota groups

use std::path::Path;
use snapquota::{all_quotas, State};

pub async fn list(state_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let st = State::load(state_path).await?;
    let groups = all_quotas(&st)?;

    println!("{:<24} {:<24} {:>10}  SNAPS", "GROUP", "PARENT", "MEMORY");

    for grp in groups.iter() {
        let parent = if grp.has_parent() { grp.parent_group.as_str() } else { "-" };
        println!(
            "{:<24} {:<24} {:>10}  {}",
            grp.name,
            parent,
            grp.memory_limit.to_string(),
            grp.snaps.join(",")
        );
    }

    println!();
    println!("{} quota groups listed", groups.len());

    Ok(())
}
