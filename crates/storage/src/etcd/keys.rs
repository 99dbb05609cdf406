//! Key layout under the configured prefix.

use uuid::Uuid;

use crate::config::LockName;

#[derive(Debug, Clone)]
pub(super) struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn power_status_master(&self) -> String {
        format!("{}/power_status_master", self.prefix)
    }

    pub fn power_status(&self, xname: &str) -> String {
        format!("{}/power_status/{xname}", self.prefix)
    }

    /// Plain string prefix, so `x1c0s1b1` also covers `x1c0s1b10n0`.
    pub fn power_status_prefix(&self, xname_prefix: &str) -> String {
        self.power_status(xname_prefix)
    }

    pub fn transition(&self, id: Uuid) -> String {
        format!("{}/transition/{id}", self.prefix)
    }

    pub fn transitions(&self) -> String {
        format!("{}/transition/", self.prefix)
    }

    pub fn transition_page(&self, id: Uuid, page: usize) -> String {
        // Zero-padded so pages sort numerically.
        format!("{}/transition_page/{id}/{page:05}", self.prefix)
    }

    pub fn transition_pages(&self, id: Uuid) -> String {
        format!("{}/transition_page/{id}/", self.prefix)
    }

    pub fn all_transition_pages(&self) -> String {
        format!("{}/transition_page/", self.prefix)
    }

    pub fn transition_task(&self, transition_id: Uuid, task_id: Uuid) -> String {
        format!("{}/transition_task/{transition_id}/{task_id}", self.prefix)
    }

    pub fn transition_tasks(&self, transition_id: Uuid) -> String {
        format!("{}/transition_task/{transition_id}/", self.prefix)
    }

    pub fn power_cap_task(&self, id: Uuid) -> String {
        format!("{}/power_cap_task/{id}", self.prefix)
    }

    pub fn power_cap_tasks(&self) -> String {
        format!("{}/power_cap_task/", self.prefix)
    }

    pub fn power_cap_op(&self, task_id: Uuid, op_id: Uuid) -> String {
        format!("{}/power_cap_op/{task_id}/{op_id}", self.prefix)
    }

    pub fn power_cap_ops(&self, task_id: Uuid) -> String {
        format!("{}/power_cap_op/{task_id}/", self.prefix)
    }

    pub fn lock(&self, name: &LockName) -> String {
        format!("{}/lock/{}/{}", self.prefix, name.namespace, name.name)
    }

    /// Transition id of an overflow page key, e.g. `<prefix>/transition_page/<id>/00001`.
    pub fn page_owner(&self, key: &str) -> Option<Uuid> {
        let rest = key.strip_prefix(&self.all_transition_pages())?;
        let (id, _) = rest.split_once('/')?;
        id.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_in_prefix_is_ignored() {
        let a = Keys::new("/pcs/");
        let b = Keys::new("/pcs");
        assert_eq!(a.power_status("x0c0"), b.power_status("x0c0"));
        assert_eq!(a.power_status("x0c0"), "/pcs/power_status/x0c0");
    }

    #[test]
    fn pages_sort_in_page_order() {
        let keys = Keys::new("/pcs");
        let id = Uuid::new_v4();
        let mut pages: Vec<String> = [10, 2, 1].iter().map(|n| keys.transition_page(id, *n)).collect();
        pages.sort();
        assert!(pages[0].ends_with("/00001"));
        assert!(pages[2].ends_with("/00010"));
    }

    #[test]
    fn page_owner_parses_transition_id() {
        let keys = Keys::new("/pcs");
        let id = Uuid::new_v4();
        assert_eq!(keys.page_owner(&keys.transition_page(id, 3)), Some(id));
        assert_eq!(keys.page_owner(&keys.transition(id)), None);
    }

    #[test]
    fn transition_prefix_does_not_cover_pages_or_tasks() {
        let keys = Keys::new("/pcs");
        let id = Uuid::new_v4();
        assert!(!keys.transition_page(id, 1).starts_with(&keys.transitions()));
        assert!(!keys
            .transition_task(id, Uuid::new_v4())
            .starts_with(&keys.transitions()));
    }
}
