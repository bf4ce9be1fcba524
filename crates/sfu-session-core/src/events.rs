use std::sync::Arc;

use tokio::sync::broadcast;

/// Events emitted by the core to native UI listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// One notification per handled server event or command, listing every
    /// slice the transition touched.
    StateChanged(Vec<StateSlice>),
    ValidatedChanged(bool),
    LoadingChanged(bool),
    Alert(Alert),
    RecordingTick(String), // HH:MM:SS
    MeetingTick(String),   // HH:MM:SS
    Disconnected,
    Redirect(String),
    /// Teardown asks the UI to dismiss every open modal.
    CloseModals,
}

/// Sub-state touched by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateSlice {
    Session,
    Room,
    Roster,
    Waiting,
    Requests,
    Media,
    Recording,
    Meeting,
    Messages,
    Polls,
    Breakout,
    Whiteboard,
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Info,
    Success,
    Danger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub message: String,
    pub kind: AlertKind,
}

impl Alert {
    pub fn info(message: impl Into<String>) -> Self {
        Self { message: message.into(), kind: AlertKind::Info }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self { message: message.into(), kind: AlertKind::Success }
    }

    pub fn danger(message: impl Into<String>) -> Self {
        Self { message: message.into(), kind: AlertKind::Danger }
    }
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait SessionEventListener: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

const CHANNEL_CAPACITY: usize = 256;

/// Dispatches events to registered listeners and to channel subscribers.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn SessionEventListener>>>>,
    channel: broadcast::Sender<SessionEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            listeners: Arc::new(std::sync::RwLock::new(Vec::new())),
            channel,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Typed event stream for an aggregator/UI layer.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.channel.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            for listener in listeners.iter() {
                listener.on_event(event.clone());
            }
        }
        // No subscribers is fine.
        let _ = self.channel.send(event);
    }

    pub fn alert(&self, alert: Alert) {
        self.emit(SessionEvent::Alert(alert));
    }

    pub fn state_changed(&self, slices: Vec<StateSlice>) {
        if !slices.is_empty() {
            self.emit(SessionEvent::StateChanged(slices));
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl SessionEventListener for CountingListener {
        fn on_event(&self, _event: SessionEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener { count: count1.clone() }));
        emitter.add_listener(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(SessionEvent::ValidatedChanged(true));

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_typed_events() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();

        emitter.state_changed(vec![StateSlice::Roster, StateSlice::Requests]);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            SessionEvent::StateChanged(vec![StateSlice::Roster, StateSlice::Requests])
        );
    }

    #[test]
    fn empty_state_change_is_not_emitted() {
        let emitter = EventEmitter::new();
        let capture = testing::EventCapture::attach(&emitter);
        emitter.state_changed(Vec::new());
        assert!(capture.events().is_empty());
    }

    #[test]
    fn alert_helpers_set_kind() {
        let emitter = EventEmitter::new();
        let capture = testing::EventCapture::attach(&emitter);
        emitter.alert(Alert::danger("nope"));

        match &capture.events()[0] {
            SessionEvent::Alert(a) => {
                assert_eq!(a.message, "nope");
                assert_eq!(a.kind, AlertKind::Danger);
            }
            other => panic!("expected Alert, got {other:?}"),
        }
    }
}
