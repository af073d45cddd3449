//! Per-delegation sets of resource UIDs already counted. Shared by every
//! trigger of one delegation; entries are never evicted.

use std::sync::{Mutex, MutexGuard};

use kdelegate_core::Uid;
use rustc_hash::FxHashSet;

#[derive(Debug, Default)]
pub struct DedupTracker {
    seen: Mutex<FxHashSet<Uid>>,
    deleted: Mutex<FxHashSet<Uid>>,
}

fn lock(m: &Mutex<FxHashSet<Uid>>) -> MutexGuard<'_, FxHashSet<Uid>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DedupTracker {
    pub fn new() -> Self { Self::default() }

    pub fn add_uid(&self, id: Uid) { lock(&self.seen).insert(id); }
    pub fn delete_uid(&self, id: Uid) { lock(&self.deleted).insert(id); }
    pub fn seen_uid(&self, id: &Uid) -> bool { lock(&self.seen).contains(id) }
    pub fn deleted_uid(&self, id: &Uid) -> bool { lock(&self.deleted).contains(id) }

    /// Check-and-set on `seen`; true when `id` was not seen before.
    pub fn mark_seen(&self, id: Uid) -> bool { lock(&self.seen).insert(id) }

    /// Check-and-set on `deleted`; true when `id` was not deleted before.
    pub fn mark_deleted(&self, id: Uid) -> bool { lock(&self.deleted).insert(id) }

    pub fn seen_len(&self) -> usize { lock(&self.seen).len() }
    pub fn deleted_len(&self) -> usize { lock(&self.deleted).len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn uid(n: u8) -> Uid { let mut u = [0u8; 16]; u[0] = n; u }

    #[test]
    fn seen_and_deleted_are_separate() {
        let d = DedupTracker::new();
        d.add_uid(uid(1));
        assert!(d.seen_uid(&uid(1)));
        assert!(!d.deleted_uid(&uid(1)));
        d.delete_uid(uid(1));
        assert!(d.deleted_uid(&uid(1)));
        assert!(d.seen_uid(&uid(1)));
    }

    #[test]
    fn mark_is_check_and_set() {
        let d = DedupTracker::new();
        assert!(d.mark_seen(uid(2)));
        assert!(!d.mark_seen(uid(2)));
        assert!(d.mark_deleted(uid(2)));
        assert!(!d.mark_deleted(uid(2)));
    }

    #[test]
    fn concurrent_marks_count_each_uid_once() {
        let d = Arc::new(DedupTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let d = Arc::clone(&d);
                std::thread::spawn(move || (0..=255u8).filter(|n| d.mark_seen(uid(*n))).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 256);
        assert_eq!(d.seen_len(), 256);
    }
}
