use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// `HH:MM:SS`; hours keep counting past 99.
pub fn format_hms(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// A single tracked periodic job.
///
/// Starting a new loop aborts the previous one; every iteration checks a
/// generation counter so a loop that outlives its handle stops by itself.
#[derive(Default)]
pub struct TickTask {
    handle: Mutex<Option<JoinHandle<()>>>,
    generation: Arc<AtomicU64>,
}

impl TickTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` until it returns false or the task is
    /// replaced or cancelled.
    pub fn replace<F, Fut>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.generation.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if live.load(Ordering::SeqCst) != generation {
                    break;
                }
                if !tick().await {
                    break;
                }
            }
        });
        if let Some(old) = self.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.lock().take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TickTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicI64;

    use super::Clock;

    /// Clock moved by hand.
    #[derive(Default)]
    pub struct ManualClock {
        now_ms: AtomicI64,
    }

    impl ManualClock {
        pub fn at(ms: i64) -> Self {
            Self { now_ms: AtomicI64::new(ms) }
        }

        pub fn set_secs(&self, secs: i64) {
            self.now_ms.store(secs * 1000, std::sync::atomic::Ordering::SeqCst);
        }

        pub fn advance_ms(&self, ms: i64) {
            self.now_ms.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.now_ms.load(std::sync::atomic::Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn formats_hours_minutes_seconds() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(59), "00:00:59");
        assert_eq!(format_hms(3_661), "01:01:01");
        assert_eq!(format_hms(360_000), "100:00:00");
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_stops_the_old_loop() {
        let task = TickTask::new();
        let old_ticks = Arc::new(AtomicUsize::new(0));
        let new_ticks = Arc::new(AtomicUsize::new(0));

        let counter = old_ticks.clone();
        task.replace(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(old_ticks.load(Ordering::SeqCst), 2);

        let counter = new_ticks.clone();
        task.replace(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(old_ticks.load(Ordering::SeqCst), 2);
        assert_eq!(new_ticks.load(Ordering::SeqCst), 3);

        task.cancel();
        assert!(!task.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ends_when_tick_returns_false() {
        let task = TickTask::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        task.replace(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) < 1 }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(!task.is_active());
    }
}
