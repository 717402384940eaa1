//! Loading and saving the group set
//!
//! All groups live under one state key and are always read and written as
//! a whole. Every load goes through cross-reference resolution, and so does
//! every save, so an inconsistent set never reaches the state.

use crate::quota::{GroupSet, QuotaGroup};
use crate::state::State;

use super::QuotaError;

/// State key holding the group set
pub const QUOTAS_KEY: &str = "quotas";

/// All quota groups, resolved
pub fn all_quotas(st: &State) -> Result<GroupSet, QuotaError> {
    let mut groups: GroupSet = st.get(QUOTAS_KEY)?.unwrap_or_default();
    groups
        .resolve_cross_references()
        .map_err(QuotaError::Corrupt)?;
    Ok(groups)
}

/// One quota group, `None` if it does not exist
pub fn get_quota(st: &State, name: &str) -> Result<Option<QuotaGroup>, QuotaError> {
    let mut groups = all_quotas(st)?;
    Ok(groups.remove(name))
}

/// Replace the given groups in the set and persist the result
///
/// Either every group is written or, if the patched set does not resolve,
/// none is.
pub(super) fn patch_quotas(st: &mut State, groups: Vec<QuotaGroup>) -> Result<GroupSet, QuotaError> {
    let mut all = all_quotas(st)?;
    for grp in groups {
        all.insert(grp);
    }

    all.resolve_cross_references()
        .map_err(QuotaError::Inconsistent)?;
    st.set(QUOTAS_KEY, &all)?;
    Ok(all)
}

/// Persist a full group set that the caller already resolved
pub(super) fn save_quotas(st: &mut State, groups: &GroupSet) -> Result<(), QuotaError> {
    st.set(QUOTAS_KEY, groups)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{GroupError, Size};

    #[test]
    fn test_no_quotas() {
        let st = State::new();
        assert!(all_quotas(&st).unwrap().is_empty());
        assert!(get_quota(&st, "web").unwrap().is_none());
    }

    #[test]
    fn test_patch_then_load() {
        let mut st = State::new();
        let mut web = QuotaGroup::new("web", Size::mib(64)).unwrap();
        let api = web.new_sub_group("api", Size::mib(32)).unwrap();

        patch_quotas(&mut st, vec![web, api]).unwrap();

        let api = get_quota(&st, "api").unwrap().unwrap();
        assert_eq!(api.parent_group, "web");
        assert_eq!(api.slice_file_name(), "snap.web-api.slice");
    }

    #[test]
    fn test_patch_rejects_dangling_link() {
        let mut st = State::new();
        let mut web = QuotaGroup::new("web", Size::mib(64)).unwrap();
        // child never saved
        let _api = web.new_sub_group("api", Size::mib(32)).unwrap();

        let err = patch_quotas(&mut st, vec![web]).unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Inconsistent(GroupError::MissingSubGroup { .. })
        ));
        assert!(!st.is_modified());
    }

    #[test]
    fn test_load_inconsistent_state() {
        let mut st = State::new();
        let mut api = QuotaGroup::new("api", Size::mib(32)).unwrap();
        api.parent_group = "web".to_string();
        let raw: GroupSet = [api].into_iter().collect();
        st.set(QUOTAS_KEY, &raw).unwrap();

        assert!(matches!(all_quotas(&st), Err(QuotaError::Corrupt(_))));
    }
}
