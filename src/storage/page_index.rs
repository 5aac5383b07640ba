//! Free-space histogram: guides DM's page selection on insert. A plain
//! latch-serialized map, the same shape as the other small in-memory indexes
//! in this crate.

use parking_lot::Mutex;

use crate::common::{PageNo, PAGE_SIZE};

const BUCKETS: usize = 41;
const QUANTUM: usize = PAGE_SIZE / 40;

fn bucket_of(free: usize) -> usize {
    (free / QUANTUM).min(BUCKETS - 1)
}

pub struct PageIndex {
    buckets: Mutex<Vec<Vec<PageNo>>>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![Vec::new(); BUCKETS]),
        }
    }

    /// Places `pgno` into the bucket for its free-space amount.
    pub fn add(&self, pgno: PageNo, free: usize) {
        let b = bucket_of(free);
        self.buckets.lock()[b].push(pgno);
    }

    /// Removes and returns a page with at least `need` bytes free, if any.
    pub fn select(&self, need: usize) -> Option<PageNo> {
        let start = bucket_of(need) + 1;
        let mut buckets = self.buckets.lock();
        for b in start..BUCKETS {
            if let Some(pgno) = buckets[b].pop() {
                return Some(pgno);
            }
        }
        None
    }

    /// Total free bytes tracked across all buckets, using each bucket's
    /// quantum as the lower bound for its members (a rounding-down estimate,
    /// not an exact sum).
    #[cfg(test)]
    pub fn total_free_lower_bound(&self) -> usize {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .enumerate()
            .map(|(b, pages)| b * QUANTUM * pages.len())
            .sum()
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_returns_smallest_sufficient_bucket() {
        let idx = PageIndex::new();
        idx.add(1, 100);
        idx.add(2, PAGE_SIZE - 10);
        let picked = idx.select(PAGE_SIZE - 100).unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn select_returns_none_when_nothing_fits() {
        let idx = PageIndex::new();
        idx.add(1, 10);
        assert!(idx.select(PAGE_SIZE - 1).is_none());
    }

    #[test]
    fn reinsertion_after_use() {
        let idx = PageIndex::new();
        idx.add(1, PAGE_SIZE);
        let picked = idx.select(10).unwrap();
        assert_eq!(picked, 1);
        assert!(idx.select(10).is_none());
        idx.add(picked, PAGE_SIZE - 20);
        assert_eq!(idx.select(10), Some(1));
    }
}
