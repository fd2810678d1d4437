//! Per-key coalescing of in-flight operations.
//!
//! The first caller for a key spawns the operation on its own task and
//! publishes a shared handle to it; later callers for the same key await that
//! handle instead of starting a second operation.  The entry is removed when
//! the operation settles, whatever the outcome, and the operation keeps
//! running even if every caller goes away.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};

/// Handle to an in-flight operation; clone it to wait on the same result.
pub type Pending<T> = Shared<BoxFuture<'static, T>>;

/// Whether a caller started the operation or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

pub struct InFlight<K, T: Clone> {
    ops: Arc<Mutex<HashMap<K, Pending<T>>>>,
}

impl<K, T: Clone> Clone for InFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            ops: Arc::clone(&self.ops),
        }
    }
}

impl<K, T> Default for InFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> InFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the operation in flight for `key`, or start `start()` if there is
    /// none.  `start` is only called by the leader.
    ///
    /// `on_abort` converts a panicked task into a result value so that
    /// followers still observe an outcome.
    pub fn join_or_start<F, Fut>(
        &self,
        key: K,
        start: F,
        on_abort: fn(String) -> T,
    ) -> (Role, Pending<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut ops = lock(&self.ops);
        if let Some(op) = ops.get(&key) {
            return (Role::Follower, op.clone());
        }

        let fut = start();
        // The map lock is held until the shared handle is inserted, so the
        // task's removal can never run before the insertion.
        let settle = Settle {
            ops: Arc::clone(&self.ops),
            key: Some(key.clone()),
        };
        let handle = tokio::spawn(async move {
            let _settle = settle;
            fut.await
        });

        let shared = async move {
            match handle.await {
                Ok(out) => out,
                Err(e) => on_abort(e.to_string()),
            }
        }
        .boxed()
        .shared();

        ops.insert(key, shared.clone());
        (Role::Leader, shared)
    }

    /// Number of operations currently in flight.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock(&self.ops).len()
    }

    /// Whether an operation for `key` is currently running.
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.ops).contains_key(key)
    }
}

/// Removes the map entry when the operation's task finishes, including by
/// panicking.
struct Settle<K: Eq + Hash, T: Clone> {
    ops: Arc<Mutex<HashMap<K, Pending<T>>>>,
    key: Option<K>,
}

impl<K: Eq + Hash, T: Clone> Drop for Settle<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(&self.ops).remove(&key);
        }
    }
}

fn lock<K, T: Clone>(
    ops: &Mutex<HashMap<K, Pending<T>>>,
) -> std::sync::MutexGuard<'_, HashMap<K, Pending<T>>> {
    // A poisoned map only means a panic happened while it was locked; the
    // map itself is always left consistent.
    ops.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    fn aborted(msg: String) -> Result<u32, String> {
        Err(msg)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_operation() {
        let inflight: InFlight<&'static str, Result<u32, String>> = InFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let runs = Arc::clone(&runs);
            let gate = Arc::clone(&gate);
            let (_, fut) = inflight.join_or_start(
                "k",
                move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(7)
                },
                aborted,
            );
            waiters.push(tokio::spawn(fut));
        }

        assert!(inflight.contains(&"k"));
        tokio::task::yield_now().await;
        gate.notify_one();

        for w in waiters {
            assert_eq!(w.await.unwrap(), Ok(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(inflight.len(), 0);
    }

    #[tokio::test]
    async fn first_caller_leads_and_later_callers_follow() {
        let inflight: InFlight<u8, Result<u32, String>> = InFlight::new();
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);

        let (first, lead) = inflight.join_or_start(
            1,
            move || async move {
                g.notified().await;
                Ok(1)
            },
            aborted,
        );
        let (second, follow) = inflight.join_or_start(1, || async { Ok(2) }, aborted);
        assert_eq!(first, Role::Leader);
        assert_eq!(second, Role::Follower);

        gate.notify_one();
        assert_eq!(lead.await, Ok(1));
        assert_eq!(follow.await, Ok(1));
    }

    #[tokio::test]
    async fn entry_is_removed_after_failure_and_key_can_restart() {
        let inflight: InFlight<u8, Result<u32, String>> = InFlight::new();

        let (_, fut) = inflight.join_or_start(1, || async { Err("boom".to_string()) }, aborted);
        assert_eq!(fut.await, Err("boom".to_string()));
        assert!(!inflight.contains(&1));

        let (role, fut) = inflight.join_or_start(1, || async { Ok(3) }, aborted);
        assert_eq!(role, Role::Leader);
        assert_eq!(fut.await, Ok(3));
    }

    #[tokio::test]
    async fn operation_completes_when_every_caller_is_dropped() {
        let inflight: InFlight<u8, Result<u32, String>> = InFlight::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);

        let (_, fut) = inflight.join_or_start(
            1,
            move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                d.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            },
            aborted,
        );
        drop(fut);

        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!inflight.contains(&1));
    }

    #[tokio::test]
    async fn panicking_operation_is_reported_to_waiters() {
        let inflight: InFlight<u8, Result<u32, String>> = InFlight::new();
        let (_, fut) = inflight.join_or_start(
            1,
            || async {
                if true {
                    panic!("operation exploded");
                }
                Ok(0)
            },
            aborted,
        );
        assert!(fut.await.is_err());
        assert!(!inflight.contains(&1));
    }
}
