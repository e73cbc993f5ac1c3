//! Keyed single-flight creation.
//!
//! A slot holds either a live value or a shared handle to its in-flight
//! creation. Concurrent callers for one key attach to the same handle, so the
//! creation runs at most once. The creation task swaps its placeholder for the
//! live value (or removes it, on failure) when it resolves.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{DbmuxError, DbmuxResult};

type SharedCreation<T> = Shared<BoxFuture<'static, DbmuxResult<T>>>;

/// Teardown for a value whose slot was abandoned while it was being created.
pub type DiscardFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

enum Slot<T> {
    Ready(T),
    Pending { id: u64, creation: SharedCreation<T> },
}

/// State of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Creation in flight
    Pending,
    /// Live value present
    Ready,
}

struct Inner<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    next_id: AtomicU64,
    discard: DiscardFn<T>,
}

/// Map from key to a live value or its single in-flight creation.
pub struct SingleFlight<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty map. `discard` tears down values whose slot was
    /// abandoned by [`drain`](Self::drain) before their creation finished.
    pub fn new(discard: DiscardFn<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                discard,
            }),
        }
    }

    /// The live value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<T> {
        match self.inner.slots.lock().get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// State of `key`, if it has a slot.
    pub fn state(&self, key: &str) -> Option<SlotState> {
        self.inner.slots.lock().get(key).map(|slot| match slot {
            Slot::Ready(_) => SlotState::Ready,
            Slot::Pending { .. } => SlotState::Pending,
        })
    }

    /// Return the live value, join the in-flight creation, or start one.
    ///
    /// `create` is only called when the key has no slot. The creation runs on
    /// its own task, so it completes and registers even if every caller stops
    /// waiting.
    pub async fn get_or_create<F, Fut>(&self, key: &str, create: F) -> DbmuxResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbmuxResult<T>> + Send + 'static,
    {
        let creation = {
            let mut slots = self.inner.slots.lock();
            match slots.get(key) {
                Some(Slot::Ready(value)) => return Ok(value.clone()),
                Some(Slot::Pending { creation, .. }) => creation.clone(),
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let creation = self.spawn_creation(key.to_string(), id, create());
                    slots.insert(key.to_string(), Slot::Pending { id, creation: creation.clone() });
                    creation
                }
            }
        };
        creation.await
    }

    fn spawn_creation<Fut>(&self, key: String, id: u64, fut: Fut) -> SharedCreation<T>
    where
        Fut: Future<Output = DbmuxResult<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = fut.await;

            let owned = {
                let mut slots = inner.slots.lock();
                let owned = matches!(
                    slots.get(&key),
                    Some(Slot::Pending { id: current, .. }) if *current == id
                );
                if owned {
                    match &result {
                        Ok(value) => {
                            slots.insert(key.clone(), Slot::Ready(value.clone()));
                        }
                        Err(_) => {
                            slots.remove(&key);
                        }
                    }
                }
                owned
            };

            match result {
                Ok(value) if !owned => {
                    tracing::debug!(key = %key, "Discarding value created for an abandoned slot");
                    (inner.discard)(value).await;
                    Err(DbmuxError::connection(format!("'{key}' was closed while connecting")))
                }
                other => other,
            }
        });

        async move {
            task.await
                .map_err(|e| DbmuxError::internal_with_source("Creation task failed", e))?
        }
        .boxed()
        .shared()
    }

    /// Remove and return the live value for `key`. In-flight creations are
    /// left alone.
    pub fn remove(&self, key: &str) -> Option<T> {
        let mut slots = self.inner.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready(_)) => match slots.remove(key) {
                Some(Slot::Ready(value)) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    /// Remove the live value for `key` only if `matches` accepts it.
    pub fn remove_if(&self, key: &str, matches: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut slots = self.inner.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready(value)) if matches(value) => match slots.remove(key) {
                Some(Slot::Ready(value)) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    /// Empty the map, returning live values. In-flight creations are
    /// abandoned; their values are discarded when they finish.
    pub fn drain(&self) -> Vec<(String, T)> {
        let mut slots = self.inner.slots.lock();
        slots
            .drain()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(value) => Some((key, value)),
                Slot::Pending { .. } => None,
            })
            .collect()
    }

    /// All live values.
    pub fn ready(&self) -> Vec<(String, T)> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(value) => Some((key.clone(), value.clone())),
                Slot::Pending { .. } => None,
            })
            .collect()
    }

    /// Number of live values.
    pub fn ready_count(&self) -> usize {
        self.inner.slots.lock().values().filter(|s| matches!(s, Slot::Ready(_))).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_discard(counter: Arc<AtomicUsize>) -> DiscardFn<u32> {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        })
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_creation() {
        let flights = SingleFlight::new(counting_discard(Arc::new(AtomicUsize::new(0))));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .get_or_create("db1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42u32)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.state("db1"), Some(SlotState::Ready));
    }

    #[tokio::test]
    async fn test_failure_clears_slot_and_reaches_all_waiters() {
        let flights: SingleFlight<u32> =
            SingleFlight::new(counting_discard(Arc::new(AtomicUsize::new(0))));

        let first = flights.get_or_create("db1", || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(DbmuxError::connection("refused"))
        });
        let second = flights.get_or_create("db1", || async { Ok(7) });
        let (a, b) = tokio::join!(first, second);

        assert!(a.is_err());
        assert_eq!(b.unwrap_err().to_string(), a.unwrap_err().to_string());
        assert_eq!(flights.state("db1"), None);

        assert_eq!(flights.get_or_create("db1", || async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_drain_abandons_pending_creation() {
        let discarded = Arc::new(AtomicUsize::new(0));
        let flights = SingleFlight::new(counting_discard(discarded.clone()));

        let pending = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .get_or_create("slow", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(1u32)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flights.state("slow"), Some(SlotState::Pending));

        assert!(flights.drain().is_empty());
        assert!(pending.await.unwrap().is_err());
        assert_eq!(discarded.load(Ordering::SeqCst), 1);
        assert_eq!(flights.state("slow"), None);
    }

    #[tokio::test]
    async fn test_remove_only_touches_ready_values() {
        let flights = SingleFlight::new(counting_discard(Arc::new(AtomicUsize::new(0))));
        flights.get_or_create("a", || async { Ok(1u32) }).await.unwrap();

        assert_eq!(flights.remove_if("a", |v| *v == 2), None);
        assert_eq!(flights.remove("a"), Some(1));
        assert_eq!(flights.remove("a"), None);
        assert_eq!(flights.ready_count(), 0);
    }
}
