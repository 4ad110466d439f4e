//! Sorted page number lists.
//!
//! The reusable page pool of a write transaction is kept as an ascending
//! list of page numbers so that runs of consecutive pages can be found for
//! overflow data.

use crate::page::Pgno;

/// Insert `id` keeping `ids` sorted. Duplicates are ignored.
pub(crate) fn insert(ids: &mut Vec<Pgno>, id: Pgno) {
    if let Err(pos) = ids.binary_search(&id) {
        ids.insert(pos, id);
    }
}

/// Merge a batch of ids into a sorted list.
pub(crate) fn merge(ids: &mut Vec<Pgno>, other: &[Pgno]) {
    if other.is_empty() {
        return;
    }
    ids.extend_from_slice(other);
    ids.sort_unstable();
    ids.dedup();
}

/// Add the run `first..first + count` to a sorted list.
pub(crate) fn insert_run(ids: &mut Vec<Pgno>, first: Pgno, count: usize) {
    if count == 1 {
        insert(ids, first);
        return;
    }
    let run: Vec<Pgno> = (first..first + count as Pgno).collect();
    merge(ids, &run);
}

/// Remove and return the first page of a run of `count` consecutive ids.
pub(crate) fn take_run(ids: &mut Vec<Pgno>, count: usize) -> Option<Pgno> {
    if count == 0 || ids.len() < count {
        return None;
    }
    if count == 1 {
        return Some(ids.remove(0));
    }
    let span = count - 1;
    let start = (0..ids.len() - span).find(|&i| ids[i + span] - ids[i] == span as Pgno)?;
    let first = ids[start];
    ids.drain(start..start + count);
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_order() {
        let mut ids = vec![];
        for id in [9, 3, 7, 3, 1] {
            insert(&mut ids, id);
        }
        assert_eq!(ids, vec![1, 3, 7, 9]);
    }

    #[test]
    fn runs_are_found() {
        let mut ids = vec![2, 4, 5, 6, 9, 10];
        assert_eq!(take_run(&mut ids, 3), Some(4));
        assert_eq!(ids, vec![2, 9, 10]);
        assert_eq!(take_run(&mut ids, 3), None);
        assert_eq!(take_run(&mut ids, 2), Some(9));
        assert_eq!(take_run(&mut ids, 1), Some(2));
        assert!(ids.is_empty());
    }

    #[test]
    fn merged_runs() {
        let mut ids = vec![1, 20];
        insert_run(&mut ids, 10, 3);
        merge(&mut ids, &[11, 30]);
        assert_eq!(ids, vec![1, 10, 11, 12, 20, 30]);
    }
}
