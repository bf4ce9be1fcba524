use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;

use crate::events::{EventEmitter, SessionEvent};
use crate::state::SessionState;
use crate::timer::{format_hms, Clock, TickTask};

/// Meeting duration shown while in a room.
///
/// Runs while the session is validated and has a room name.
pub struct MeetingTimer {
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
    session: Arc<RwLock<SessionState>>,
    started_at_ms: Arc<Mutex<Option<i64>>>,
    ticks: TickTask,
}

impl MeetingTimer {
    pub fn new(
        clock: Arc<dyn Clock>,
        emitter: EventEmitter,
        session: Arc<RwLock<SessionState>>,
    ) -> Self {
        Self {
            clock,
            emitter,
            session,
            started_at_ms: Arc::new(Mutex::new(None)),
            ticks: TickTask::new(),
        }
    }

    pub fn start(&self) {
        let now = self.clock.now_ms();
        *self.lock() = Some(now);
        tracing::debug!("meeting timer started");

        let clock = self.clock.clone();
        let emitter = self.emitter.clone();
        let session = self.session.clone();
        let started = self.started_at_ms.clone();
        self.ticks.replace(Duration::from_secs(1), move || {
            let clock = clock.clone();
            let emitter = emitter.clone();
            let session = session.clone();
            let started = started.clone();
            async move {
                let Some(start) = *started.lock().unwrap_or_else(|e| e.into_inner()) else {
                    return false;
                };
                let elapsed = ((clock.now_ms() - start).max(0) / 1000) as u64;
                emitter.emit(SessionEvent::MeetingTick(format_hms(elapsed)));

                let session = session.read().await;
                session.validated && !session.room_name.is_empty()
            }
        });
    }

    /// Stop and zero the displayed time.
    pub fn stop(&self) {
        self.ticks.cancel();
        let was_running = self.lock().take().is_some();
        if was_running {
            self.emitter.emit(SessionEvent::MeetingTick(format_hms(0)));
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticks.is_active()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<i64>> {
        self.started_at_ms.lock().unwrap_or_else(|e| e.into_inner())
    }
}
