use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::breakout::BreakoutState;
use crate::events::{EventEmitter, SessionEvent, StateSlice};
use crate::media::MediaState;
use crate::messages::MessageLog;
use crate::participants::Roster;
use crate::polls::PollState;
use crate::room::RoomData;
use crate::whiteboard::WhiteboardState;

/// Identity of the joined (or joining) room.
///
/// `validated` is the sole gate for auto-join, event subscription and the
/// pre-join to in-meeting transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub validated: bool,
    pub room_name: String,
    pub member: String,
    pub islevel: String,
    pub api_user_name: String,
    pub api_token: String,
    pub link: String,
    pub admin_passcode: String,
}

impl SessionState {
    pub fn is_host(&self) -> bool {
        self.islevel == "2"
    }
}

/// Meeting-wide flags not owned by a more specific slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeetingState {
    pub confirm_here_visible: bool,
    pub timer_visible: bool,
    pub unread_messages: bool,
    pub display_type: String,
    pub prev_display_type: String,
}

/// Shared session slices.
///
/// Each component is handed the clones of the slices it reads or writes.
#[derive(Clone)]
pub struct SessionContext {
    pub session: Arc<RwLock<SessionState>>,
    pub room: Arc<Mutex<RoomData>>,
    pub roster: Arc<Mutex<Roster>>,
    pub media: Arc<Mutex<MediaState>>,
    pub meeting: Arc<Mutex<MeetingState>>,
    pub messages: Arc<Mutex<MessageLog>>,
    pub polls: Arc<Mutex<PollState>>,
    pub breakout: Arc<Mutex<BreakoutState>>,
    pub whiteboard: Arc<Mutex<WhiteboardState>>,
    pub emitter: EventEmitter,
    /// Set while a teardown is running; late `disconnect` and
    /// `meetingEnded` pushes are ignored meanwhile.
    closing: Arc<AtomicBool>,
}

impl SessionContext {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            session: Arc::new(RwLock::new(SessionState::default())),
            room: Arc::new(Mutex::new(RoomData::default())),
            roster: Arc::new(Mutex::new(Roster::new())),
            media: Arc::new(Mutex::new(MediaState::default())),
            meeting: Arc::new(Mutex::new(MeetingState::default())),
            messages: Arc::new(Mutex::new(MessageLog::default())),
            polls: Arc::new(Mutex::new(PollState::default())),
            breakout: Arc::new(Mutex::new(BreakoutState::default())),
            whiteboard: Arc::new(Mutex::new(WhiteboardState::default())),
            emitter,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn session(&self) -> SessionState {
        self.session.read().await.clone()
    }

    pub async fn is_validated(&self) -> bool {
        self.session.read().await.validated
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Mark a teardown as started. Returns false if one is already running.
    pub fn begin_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn end_closing(&self) {
        self.closing.store(false, Ordering::SeqCst);
    }

    /// Validated and not being torn down.
    pub async fn is_live(&self) -> bool {
        !self.is_closing() && self.is_validated().await
    }

    /// Flip `validated`, emitting only on change.
    pub async fn set_validated(&self, validated: bool) {
        let changed = {
            let mut session = self.session.write().await;
            let changed = session.validated != validated;
            session.validated = validated;
            changed
        };
        if changed {
            tracing::info!("session validated={validated}");
            self.emitter.emit(SessionEvent::ValidatedChanged(validated));
        }
    }

    /// Reset every slice except the `validated` flag.
    ///
    /// Returns true when anything changed, so a repeated reset stays silent.
    pub async fn reset_slices(&self) -> bool {
        let mut changed = false;
        {
            let mut session = self.session.write().await;
            let reset = SessionState {
                validated: session.validated,
                ..SessionState::default()
            };
            changed |= *session != reset;
            *session = reset;
        }
        changed |= reset_slot(&self.room).await;
        changed |= reset_slot(&self.media).await;
        changed |= reset_slot(&self.meeting).await;
        changed |= reset_slot(&self.messages).await;
        changed |= reset_slot(&self.polls).await;
        changed |= reset_slot(&self.breakout).await;
        changed |= reset_slot(&self.whiteboard).await;
        {
            let mut roster = self.roster.lock().await;
            let had_state = !roster.participants_all().is_empty()
                || !roster.participants().is_empty()
                || roster.pending_count() > 0
                || !roster.co_host().is_empty();
            roster.clear();
            changed |= had_state;
        }
        changed
    }
}

async fn reset_slot<T: Default + PartialEq>(slot: &Mutex<T>) -> bool {
    let mut value = slot.lock().await;
    let fresh = T::default();
    let changed = *value != fresh;
    *value = fresh;
    changed
}

/// Every slice, for notifications after a full reset.
pub fn all_slices() -> Vec<StateSlice> {
    vec![
        StateSlice::Session,
        StateSlice::Room,
        StateSlice::Roster,
        StateSlice::Waiting,
        StateSlice::Requests,
        StateSlice::Media,
        StateSlice::Recording,
        StateSlice::Meeting,
        StateSlice::Messages,
        StateSlice::Polls,
        StateSlice::Breakout,
        StateSlice::Whiteboard,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::EventCapture;

    #[tokio::test]
    async fn set_validated_emits_only_on_change() {
        let ctx = SessionContext::new(EventEmitter::new());
        let capture = EventCapture::attach(&ctx.emitter);

        ctx.set_validated(true).await;
        ctx.set_validated(true).await;
        ctx.set_validated(false).await;

        assert_eq!(
            capture.events(),
            vec![
                SessionEvent::ValidatedChanged(true),
                SessionEvent::ValidatedChanged(false)
            ]
        );
    }

    #[tokio::test]
    async fn reset_slices_keeps_validated_and_is_idempotent() {
        let ctx = SessionContext::new(EventEmitter::new());
        {
            let mut s = ctx.session.write().await;
            s.validated = true;
            s.room_name = "s1234567".into();
            s.member = "alice".into();
        }
        ctx.media.lock().await.screen_id = "scr".into();

        assert!(ctx.reset_slices().await);
        let s = ctx.session().await;
        assert!(s.validated);
        assert!(s.room_name.is_empty());
        assert!(ctx.media.lock().await.screen_id.is_empty());

        assert!(!ctx.reset_slices().await);
    }
}
