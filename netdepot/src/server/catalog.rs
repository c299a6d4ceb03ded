//! The server-side catalog: which names this server advertises and how much
//! of its byte budget is spoken for.
//!
//! Names and space are distinct synchronisation domains: the name set is a
//! mutex-guarded ordered set, the space counter a lone atomic. Admission
//! composes the two as reserve-then-add; its unwind runs in the opposite
//! order. Neither is ever held across I/O.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Advertised names plus space accounting for one server.
#[derive(Debug)]
pub struct Catalog {
    names: Mutex<BTreeSet<String>>,
    space_taken: AtomicU64,
    max_space: u64,
}

impl Catalog {
    /// An empty catalog offering `max_space` bytes.
    #[must_use]
    pub fn new(max_space: u64) -> Self {
        Self::with_contents(max_space, BTreeSet::new(), 0)
    }

    /// A catalog pre-seeded with the shared folder's contents. The seed may
    /// exceed `max_space`; [`Catalog::left_space`] then reports zero until
    /// enough is deleted.
    #[must_use]
    pub fn with_contents(max_space: u64, names: BTreeSet<String>, space_taken: u64) -> Self {
        Self {
            names: Mutex::new(names),
            space_taken: AtomicU64::new(space_taken),
            max_space,
        }
    }

    fn names_guard(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.names.lock().expect("name set lock poisoned")
    }

    /// Whether `name` is currently advertised.
    pub fn contains(&self, name: &str) -> bool {
        self.names_guard().contains(name)
    }

    /// Claims `name`; false when it is already taken.
    pub fn add(&self, name: &str) -> bool {
        self.names_guard().insert(name.to_owned())
    }

    /// Drops `name`, reporting whether anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        self.names_guard().remove(name)
    }

    /// Snapshot of the names containing `pattern`, in set order. The empty
    /// pattern matches every name. Snapshotting keeps iteration stable
    /// against concurrent mutation without pinning the lock.
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        self.names_guard()
            .iter()
            .filter(|name| name.contains(pattern))
            .cloned()
            .collect()
    }

    /// Lock-free snapshot of the unreserved budget, clamped at zero.
    pub fn left_space(&self) -> u64 {
        let taken = self.space_taken.load(Ordering::Relaxed);
        self.max_space.saturating_sub(taken)
    }

    /// Atomically claims `n` bytes if the budget allows it.
    pub fn reserve(&self, n: u64) -> bool {
        let mut taken = self.space_taken.load(Ordering::Relaxed);
        loop {
            let Some(would_be) = taken.checked_add(n) else {
                return false;
            };
            if would_be > self.max_space {
                return false;
            }
            match self.space_taken.compare_exchange_weak(
                taken,
                would_be,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => taken = actual,
            }
        }
    }

    /// Returns `n` bytes to the budget, unconditionally.
    pub fn release(&self, n: u64) {
        self.space_taken.fetch_sub(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn names_insert_once() {
        let catalog = Catalog::new(100);
        assert!(catalog.add("a.txt"));
        assert!(!catalog.add("a.txt"));
        assert!(catalog.contains("a.txt"));
        assert!(catalog.remove("a.txt"));
        assert!(!catalog.remove("a.txt"));
        assert!(!catalog.contains("a.txt"));
    }

    #[test]
    fn matching_is_a_substring_filter() {
        let catalog = Catalog::new(100);
        for name in ["notes.txt", "song.mp3", "txt_backup"] {
            assert!(catalog.add(name));
        }
        assert_eq!(catalog.matching("txt"), ["notes.txt", "txt_backup"]);
        assert_eq!(
            catalog.matching(""),
            ["notes.txt", "song.mp3", "txt_backup"]
        );
        assert!(catalog.matching("flac").is_empty());
    }

    #[test]
    fn reserve_respects_the_budget() {
        let catalog = Catalog::new(100);
        assert!(catalog.reserve(60));
        assert_eq!(catalog.left_space(), 40);
        assert!(!catalog.reserve(41));
        assert!(catalog.reserve(40));
        assert_eq!(catalog.left_space(), 0);
        catalog.release(100);
        assert_eq!(catalog.left_space(), 100);
    }

    #[test]
    fn oversubscribed_seed_clamps_to_zero() {
        let catalog = Catalog::with_contents(100, BTreeSet::new(), 150);
        assert_eq!(catalog.left_space(), 0);
        assert!(!catalog.reserve(1));
        catalog.release(60);
        assert_eq!(catalog.left_space(), 10);
    }

    #[test]
    fn concurrent_accounting_balances_at_quiescence() {
        let catalog = Arc::new(Catalog::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    let mut granted = 0u64;
                    for _ in 0..1_000 {
                        if catalog.reserve(8) {
                            granted += 1;
                            assert!(catalog.left_space() <= 64);
                            catalog.release(8);
                        }
                    }
                    granted
                })
            })
            .collect();
        let granted: u64 = handles.into_iter().map(|h| h.join().expect("join")).sum();
        assert!(granted > 0);
        assert_eq!(catalog.left_space(), 64);
    }

    #[test]
    fn admission_of_one_name_has_a_single_winner() {
        // Room for one: both racers want 60 of 100 bytes.
        let catalog = Arc::new(Catalog::new(100));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    if !catalog.reserve(60) {
                        return false;
                    }
                    if !catalog.add("dup.bin") {
                        catalog.release(60);
                        return false;
                    }
                    true
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(catalog.left_space(), 40);
        assert!(catalog.contains("dup.bin"));
    }
}
