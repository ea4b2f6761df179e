// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable; the map lock is never held across await points.
#![allow(clippy::missing_panics_doc)]

//! Per-name advisory locks.
//!
//! A process-local map of binary semaphores, one per name, populated on
//! first use and never removed. Over the process lifetime the set of names
//! is effectively the set of known repositories, plus the token names the
//! garbage collector holds while it runs. Holding a named lock is
//! orthogonal to holding a lease.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

/// A thread-safe map of named locks, used for locking repositories during
/// critical operations (commits, garbage collection).
///
/// Handles are cheap to clone and share the underlying map.
#[derive(Debug, Clone, Default)]
pub struct NamedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl NamedLocks {
    /// Creates an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` while holding the lock for `name`.
    ///
    /// Acquisition is cancelled by dropping the returned future; once the
    /// task body runs, the lock is released on every exit path.
    pub async fn with_lock<T, F>(&self, name: &str, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let semaphore = self.semaphore(name);
        let _permit = semaphore
            .acquire_owned()
            .await
            .expect("named-lock semaphores are never closed");

        task.await
    }

    /// Non-blocking probe: reports whether `name` is currently locked.
    ///
    /// The probe is advisory: a concurrent acquirer can take the lock
    /// right after the probe returns `false`. A name that has never been
    /// locked reports `false` without populating the map.
    #[must_use]
    pub fn is_locked(&self, name: &str) -> bool {
        let semaphore = {
            let map = self.locks.lock().unwrap();
            map.get(name).cloned()
        };

        let Some(semaphore) = semaphore else {
            return false;
        };

        let locked = match semaphore.try_acquire() {
            Ok(permit) => {
                drop(permit);
                false
            },
            Err(_) => true,
        };
        locked
    }

    /// Load-or-store of the semaphore for `name`.
    fn semaphore(&self, name: &str) -> Arc<Semaphore> {
        let mut map = self.locks.lock().unwrap();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_lock_released_after_task() {
        let locks = NamedLocks::new();

        let value = locks.with_lock("repo", async { 42 }).await;
        assert_eq!(value, 42);
        assert!(!locks.is_locked("repo"));
    }

    #[tokio::test]
    async fn test_is_locked_while_task_runs() {
        let locks = NamedLocks::new();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();

        let task_locks = locks.clone();
        let holder = tokio::spawn(async move {
            task_locks
                .with_lock("repo", async {
                    entered_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                })
                .await;
        });

        entered_rx.await.unwrap();
        assert!(locks.is_locked("repo"));
        assert!(!locks.is_locked("other"));

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        assert!(!locks.is_locked("repo"));
    }

    #[tokio::test]
    async fn test_probe_does_not_hold_the_lock() {
        let locks = NamedLocks::new();

        assert!(!locks.is_locked("repo"));
        // A probe must not leave the lock held; acquisition still succeeds.
        let value = tokio::time::timeout(
            Duration::from_secs(1),
            locks.with_lock("repo", async { "ran" }),
        )
        .await
        .unwrap();
        assert_eq!(value, "ran");
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locks = NamedLocks::new();
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("repo", async {
                        let value = {
                            let guard = counter.lock().unwrap();
                            *guard
                        };
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        *counter.lock().unwrap() = value + 1;
                    })
                    .await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        // Without mutual exclusion the read-sleep-write pattern loses
        // updates.
        assert_eq!(*counter.lock().unwrap(), 8);
    }

    #[tokio::test]
    async fn test_independent_names_do_not_contend() {
        let locks = NamedLocks::new();

        let a = locks.clone();
        let joined = tokio::time::timeout(Duration::from_secs(1), async move {
            a.with_lock("a", async {
                locks.with_lock("b", async { "nested" }).await
            })
            .await
        })
        .await
        .unwrap();

        assert_eq!(joined, "nested");
    }
}
