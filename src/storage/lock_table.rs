//! Per-process registry of session write locks.
//!
//! Every session id maps to exactly one [`SessionLock`] for the lifetime of
//! the table. Appends, active checks and deletes for a session serialize on
//! that lock; different sessions never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Result, StorageError};

#[derive(Debug)]
pub struct SessionLock {
    session_id: String,
    held: Mutex<bool>,
    released: Condvar,
}

/// Releases the owning [`SessionLock`] when dropped, including during unwinding.
#[derive(Debug)]
pub struct SessionLockGuard<'a> {
    lock: &'a SessionLock,
}

impl SessionLock {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Blocks until the lock is free or `timeout` elapses.
    pub fn acquire(&self, timeout: Duration) -> Result<SessionLockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::LockTimeout {
                    resource: format!("session {}", self.session_id),
                    waited: timeout,
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }
        *held = true;
        Ok(SessionLockGuard { lock: self })
    }

    pub fn try_acquire(&self) -> Option<SessionLockGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if *held {
            return None;
        }
        *held = true;
        Some(SessionLockGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .lock
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *held = false;
        self.lock.released.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct SessionLockTable {
    handles: Mutex<HashMap<String, Arc<SessionLock>>>,
}

impl SessionLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `session_id`, creating it on first use.
    pub fn lock_for(&self, session_id: &str) -> Arc<SessionLock> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = handles
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionLock::new(session_id)));
        Arc::clone(handle)
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn same_id_yields_identical_handle() {
        let table = SessionLockTable::new();
        let first = table.lock_for("session1");
        let second = table.lock_for("session1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_ids_yield_distinct_handles() {
        let table = SessionLockTable::new();
        let first = table.lock_for("session1");
        let second = table.lock_for("session2");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.session_id(), "session2");
    }

    #[test]
    fn concurrent_lookups_agree_on_one_handle() {
        let table = Arc::new(SessionLockTable::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    table.lock_for("shared")
                })
            })
            .collect();

        let locks: Vec<Arc<SessionLock>> = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect();
        assert!(locks.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn same_session_holders_never_interleave() {
        let table = Arc::new(SessionLockTable::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let workers: Vec<_> = (0..3)
            .map(|event_id| {
                let table = Arc::clone(&table);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    let lock = table.lock_for("session1");
                    let _guard = lock.acquire(WAIT).expect("acquire");
                    order.lock().expect("order").push(("start", event_id));
                    thread::sleep(Duration::from_millis(20));
                    order.lock().expect("order").push(("end", event_id));
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("join");
        }

        let order = order.lock().expect("order");
        assert_eq!(order.len(), 6);
        for pair in order.chunks(2) {
            assert_eq!(pair[0].0, "start");
            assert_eq!(pair[1].0, "end");
            assert_eq!(pair[0].1, pair[1].1);
        }
    }

    #[test]
    fn different_sessions_do_not_block_each_other() {
        let table = Arc::new(SessionLockTable::new());
        let held = Arc::new(Barrier::new(2));
        let done = Arc::new(Barrier::new(2));

        let writer = {
            let table = Arc::clone(&table);
            let held = Arc::clone(&held);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let lock = table.lock_for("session-a");
                let _guard = lock.acquire(WAIT).expect("acquire a");
                held.wait();
                done.wait();
            })
        };

        held.wait();
        let other = table.lock_for("session-b");
        assert!(other.try_acquire().is_some());
        assert!(table.lock_for("session-a").try_acquire().is_none());
        done.wait();
        writer.join().expect("join");
    }

    #[test]
    fn acquire_times_out_while_held() {
        let table = SessionLockTable::new();
        let lock = table.lock_for("session1");
        let _guard = lock.acquire(WAIT).expect("acquire");

        let contender = table.lock_for("session1");
        let err = contender
            .acquire(Duration::from_millis(30))
            .expect_err("should time out");
        assert!(matches!(err, StorageError::LockTimeout { .. }));
    }

    #[test]
    fn guard_releases_when_holder_panics() {
        let table = Arc::new(SessionLockTable::new());
        let panicking = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let lock = table.lock_for("session1");
                let _guard = lock.acquire(WAIT).expect("acquire");
                panic!("writer failed mid-append");
            })
        };
        assert!(panicking.join().is_err());

        let lock = table.lock_for("session1");
        assert!(!lock.is_held());
        assert!(lock.acquire(Duration::ZERO).is_ok());
    }
}
