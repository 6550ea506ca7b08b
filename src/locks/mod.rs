// Module: Locks
// Named and exclusive locking across parallel scenarios.
//
// Two-level scheme: `@lock=*` takes the write side of a global RwLock and
// excludes everything; `@lock=<name>` takes the read side plus a named mutex
// created on demand. Named mutexes are acquired in lexicographic order so two
// scenarios holding overlapping name sets cannot deadlock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawMutex, RawRwLock, RwLock};

use crate::feature::tags::LockSpec;

type NamedGuard = ArcMutexGuard<RawMutex, ()>;
type ReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

pub struct ScenarioLockManager {
    global: Arc<RwLock<()>>,
    named: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for ScenarioLockManager {
    fn default() -> Self {
        Self {
            global: Arc::new(RwLock::new(())),
            named: Mutex::new(HashMap::new()),
        }
    }
}

/// Guards held for one scenario. Dropping releases named locks in reverse
/// acquisition order, then the global lock last.
pub struct LockHandle {
    named_guards: Vec<NamedGuard>,
    read_guard: Option<ReadGuard>,
    write_guard: Option<WriteGuard>,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        while let Some(guard) = self.named_guards.pop() {
            drop(guard);
        }
        self.read_guard.take();
        self.write_guard.take();
    }
}

impl ScenarioLockManager {
    /// Acquires the locks a scenario's tags require. Fast path: no lock tag,
    /// no lock code at all.
    pub fn acquire(&self, spec: Option<&LockSpec>) -> Option<LockHandle> {
        let spec = spec?;
        match spec {
            LockSpec::Exclusive => {
                let write_guard = self.global.write_arc();
                Some(LockHandle {
                    named_guards: Vec::new(),
                    read_guard: None,
                    write_guard: Some(write_guard),
                })
            }
            LockSpec::Named(names) => {
                let read_guard = self.global.read_arc();
                // names arrive pre-sorted; acquisition order is what prevents
                // cyclic waits
                let mut named_guards = Vec::with_capacity(names.len());
                for name in names {
                    let mutex = {
                        let mut map = self.named.lock();
                        map.entry(name.clone())
                            .or_insert_with(|| Arc::new(Mutex::new(())))
                            .clone()
                    };
                    named_guards.push(mutex.lock_arc());
                }
                Some(LockHandle {
                    named_guards,
                    read_guard: Some(read_guard),
                    write_guard: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn named(names: &[&str]) -> LockSpec {
        LockSpec::Named(names.iter().map(|n| n.to_string()).collect())
    }

    #[test]
    fn no_spec_returns_none() {
        let manager = ScenarioLockManager::default();
        assert!(manager.acquire(None).is_none());
    }

    #[test]
    fn same_name_is_mutually_exclusive() {
        let manager = Arc::new(ScenarioLockManager::default());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let concurrent = concurrent.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    let guard = manager.acquire(Some(&named(&["a"])));
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_names_run_concurrently() {
        let manager = Arc::new(ScenarioLockManager::default());
        let peak = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = ["a", "b"]
            .iter()
            .map(|name| {
                let manager = manager.clone();
                let peak = peak.clone();
                let concurrent = concurrent.clone();
                let name = name.to_string();
                thread::spawn(move || {
                    let guard = manager.acquire(Some(&named(&[&name])));
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exclusive_blocks_named_holders() {
        let manager = Arc::new(ScenarioLockManager::default());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for spec in [LockSpec::Exclusive, named(&["x"]), LockSpec::Exclusive] {
            let manager = manager.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(thread::spawn(move || {
                let guard = manager.acquire(Some(&spec));
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                concurrent.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlapping_name_sets_terminate() {
        // both threads want {a, b}; ordered acquisition prevents deadlock
        let manager = Arc::new(ScenarioLockManager::default());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        let guard = manager.acquire(Some(&named(&["a", "b"])));
                        drop(guard);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
