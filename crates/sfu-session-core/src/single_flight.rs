use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Result of a [`SingleFlight::run`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Flight<T> {
    /// This caller ran the operation.
    Led(T),
    /// An identical operation was in flight; this is its result.
    Shared(T),
    /// An identical operation was in flight and this call was a no-op.
    Dropped,
}

impl<T> Flight<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Flight::Led(v) | Flight::Shared(v) => Some(v),
            Flight::Dropped => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Share,
    Drop,
}

struct Slot<K, T> {
    key: K,
    id: u64,
    done: watch::Receiver<Option<T>>,
}

type SlotCell<K, T> = Arc<Mutex<Option<Slot<K, T>>>>;

/// Collapses concurrent calls carrying the same key into one operation.
///
/// Only the most recent key is tracked. A call with a different key
/// replaces the bookkeeping without cancelling the earlier operation; the
/// earlier one can then no longer clear the slot it lost.
pub struct SingleFlight<K, T> {
    mode: Mode,
    slot: SlotCell<K, T>,
    next_id: AtomicU64,
}

enum Decision<T> {
    Lead(u64, watch::Sender<Option<T>>),
    Wait(watch::Receiver<Option<T>>),
    Skip,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Identical concurrent callers await and share the leader's result.
    pub fn sharing() -> Self {
        Self::with_mode(Mode::Share)
    }

    /// Identical concurrent callers return [`Flight::Dropped`] at once.
    pub fn dropping() -> Self {
        Self::with_mode(Mode::Drop)
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn in_flight(&self) -> Option<K> {
        lock(&self.slot).as_ref().map(|s| s.key.clone())
    }

    pub async fn run<F, Fut>(&self, key: K, f: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let decision = {
            let mut slot = lock(&self.slot);
            match slot.as_ref() {
                Some(current) if current.key == key => match self.mode {
                    Mode::Drop => Decision::Skip,
                    Mode::Share => Decision::Wait(current.done.clone()),
                },
                _ => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(Slot { key, id, done: rx });
                    Decision::Lead(id, tx)
                }
            }
        };

        match decision {
            Decision::Skip => Flight::Dropped,
            Decision::Wait(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(value) => {
                    let shared: Option<T> = (*value).clone();
                    shared.map_or(Flight::Dropped, Flight::Shared)
                }
                // Leader was cancelled before finishing.
                Err(_) => Flight::Dropped,
            },
            Decision::Lead(id, tx) => {
                let release = SlotRelease { slot: self.slot.clone(), id };
                let value = f().await;
                drop(release);
                let _ = tx.send(Some(value.clone()));
                Flight::Led(value)
            }
        }
    }
}

fn lock<K, T>(slot: &SlotCell<K, T>) -> std::sync::MutexGuard<'_, Option<Slot<K, T>>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the slot on every exit path, but only while this flight still
/// owns it.
struct SlotRelease<K, T> {
    slot: SlotCell<K, T>,
    id: u64,
}

impl<K, T> Drop for SlotRelease<K, T> {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(|s| s.id == self.id) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn dropping_mode_runs_identical_calls_once() {
        let flights: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::dropping());
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |flights: Arc<SingleFlight<&'static str, u32>>, calls: Arc<AtomicUsize>| async move {
            flights
                .run("room-a", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    7
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(flights.clone(), calls.clone()),
            run(flights.clone(), calls.clone())
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!((a, b), (Flight::Led(7), Flight::Dropped) | (Flight::Dropped, Flight::Led(7))));
        assert!(flights.in_flight().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sharing_mode_hands_result_to_waiters() {
        let flights: Arc<SingleFlight<u8, String>> = Arc::new(SingleFlight::sharing());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run(1, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        "ok".to_string()
                    })
                    .await
            }));
        }

        let mut led = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Flight::Led(v) => {
                    led += 1;
                    assert_eq!(v, "ok");
                }
                Flight::Shared(v) => assert_eq!(v, "ok"),
                Flight::Dropped => panic!("sharing mode never drops a live flight"),
            }
        }
        assert_eq!(led, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn different_key_supersedes_without_losing_slot() {
        let flights: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::dropping());

        let slow = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("old", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let newer = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("new", || async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        2
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flights.in_flight(), Some("new"));

        // The old flight finishing must not clear the newer bookkeeping.
        assert_eq!(slow.await.unwrap(), Flight::Led(1));
        assert_eq!(flights.in_flight(), Some("new"));

        assert_eq!(newer.await.unwrap(), Flight::Led(2));
        assert!(flights.in_flight().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_releases_slot() {
        let flights: Arc<SingleFlight<u8, u8>> = Arc::new(SingleFlight::dropping());
        let handle = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(1, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        0
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(flights.in_flight(), Some(1));

        handle.abort();
        let _ = handle.await;
        assert!(flights.in_flight().is_none());
    }
}
