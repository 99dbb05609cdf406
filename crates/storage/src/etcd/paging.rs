//! Splitting a transition's location list across several keys.
//!
//! The record key holds the transition with its first `page_size`
//! locations plus the number of overflow pages; the remaining locations
//! live in overflow page keys. All pages are written in one transaction,
//! so a transition is limited to what fits in a single etcd `Txn`.

use pcs_model::{Location, Transition};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// etcd's default `--max-txn-ops`.
pub(super) const MAX_TXN_OPS: usize = 128;

/// Value stored under the transition record key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct StoredTransition {
    /// The transition with only the first page of locations.
    pub transition: Transition,
    /// Number of overflow page keys.
    #[serde(default)]
    pub page_count: usize,
}

#[derive(Debug)]
pub(super) struct Paged {
    pub head: StoredTransition,
    pub overflow: Vec<Vec<Location>>,
}

pub(super) fn split(transition: &Transition, page_size: usize) -> Paged {
    let mut chunks = transition.location.chunks(page_size.max(1));
    let first = chunks.next().map(<[Location]>::to_vec).unwrap_or_default();
    let overflow: Vec<Vec<Location>> = chunks.map(<[Location]>::to_vec).collect();

    let mut head = transition.clone();
    head.location = first;
    Paged {
        head: StoredTransition {
            transition: head,
            page_count: overflow.len(),
        },
        overflow,
    }
}

/// Reassemble the full transition from its record and overflow pages in order.
pub(super) fn join(
    head: &StoredTransition,
    overflow: Vec<Vec<Location>>,
) -> Result<Transition, StorageError> {
    let id = head.transition.transition_id;
    if overflow.len() != head.page_count {
        return Err(StorageError::transaction(
            format!("read transition {id}"),
            format!(
                "expected {} location pages, found {}",
                head.page_count,
                overflow.len()
            ),
        ));
    }
    let mut full = head.transition.clone();
    full.location.extend(overflow.into_iter().flatten());
    Ok(full)
}

/// Fail with [`StorageError::ConflictRetry`] when `ops` writes cannot go in one `Txn`.
pub(super) fn check_op_count(key: &str, ops: usize) -> Result<(), StorageError> {
    if ops > MAX_TXN_OPS {
        return Err(StorageError::ConflictRetry {
            key: key.to_string(),
            reason: format!("{ops} writes exceed the {MAX_TXN_OPS} allowed in one transaction"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pcs_model::PowerOperation;

    use super::*;

    fn transition_with(n: usize) -> Transition {
        let locations = (0..n)
            .map(|i| Location::new(format!("x0c0s{i}b0n0")))
            .collect();
        Transition::new(PowerOperation::On, locations, 5)
    }

    #[test]
    fn small_transition_has_no_overflow() {
        let t = transition_with(3);
        let paged = split(&t, 10);
        assert_eq!(paged.head.page_count, 0);
        assert!(paged.overflow.is_empty());
        assert_eq!(paged.head.transition, t);
    }

    #[test]
    fn large_transition_splits_and_joins_in_order() {
        let t = transition_with(25);
        let paged = split(&t, 10);
        assert_eq!(paged.head.transition.location.len(), 10);
        assert_eq!(paged.head.page_count, 2);
        assert_eq!(paged.overflow[0].len(), 10);
        assert_eq!(paged.overflow[1].len(), 5);

        let full = join(&paged.head, paged.overflow).unwrap();
        assert_eq!(full, t);
    }

    #[test]
    fn exact_multiple_of_page_size() {
        let t = transition_with(20);
        let paged = split(&t, 10);
        assert_eq!(paged.head.page_count, 1);
        assert_eq!(join(&paged.head, paged.overflow).unwrap(), t);
    }

    #[test]
    fn missing_page_is_reported() {
        let t = transition_with(25);
        let mut paged = split(&t, 10);
        paged.overflow.pop();
        assert!(join(&paged.head, paged.overflow).is_err());
    }

    #[test]
    fn too_many_pages_for_one_txn() {
        assert!(check_op_count("k", MAX_TXN_OPS).is_ok());
        let err = check_op_count("k", MAX_TXN_OPS + 1).unwrap_err();
        assert!(matches!(err, StorageError::ConflictRetry { .. }));
    }
}
