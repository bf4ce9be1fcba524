//! UniFFI bindings for sfu-session-core.
//!
//! Provides a SessionClient object that wraps the session orchestrator and
//! its configuration store into a single FFI-safe interface.

use std::sync::Arc;

use sfu_session_core::{
    self,
    events::{
        Alert as CoreAlert, AlertKind as CoreAlertKind, SessionEvent as CoreSessionEvent,
        StateSlice as CoreStateSlice,
    },
    join::{JoinOutcome as CoreJoinOutcome, JoinRequest},
    media::MediaKind as CoreMediaKind,
    recording::{RecordingPhase as CoreRecordingPhase, RecordingTimerState},
    whiteboard::{Point, Shape, ShapeKind},
    ApiAuth, Collaborators, ConfigStore, CreateRoomPayload, EventEmitter, JoinRoomPayload,
    NewPoll, SessionOrchestrator,
};

uniffi::setup_scaffolding!();

// ── Namespace functions ──────────────────────────────────────────────

/// Initialize tracing/logging. Call once from the host before using SessionClient.
#[uniffi::export]
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sfu_session_core=debug,sfu_session_ffi=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .init();
    });
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
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

impl From<CoreStateSlice> for StateSlice {
    fn from(s: CoreStateSlice) -> Self {
        match s {
            CoreStateSlice::Session => Self::Session,
            CoreStateSlice::Room => Self::Room,
            CoreStateSlice::Roster => Self::Roster,
            CoreStateSlice::Waiting => Self::Waiting,
            CoreStateSlice::Requests => Self::Requests,
            CoreStateSlice::Media => Self::Media,
            CoreStateSlice::Recording => Self::Recording,
            CoreStateSlice::Meeting => Self::Meeting,
            CoreStateSlice::Messages => Self::Messages,
            CoreStateSlice::Polls => Self::Polls,
            CoreStateSlice::Breakout => Self::Breakout,
            CoreStateSlice::Whiteboard => Self::Whiteboard,
            CoreStateSlice::Connection => Self::Connection,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum AlertKind {
    Info,
    Success,
    Danger,
}

impl From<CoreAlertKind> for AlertKind {
    fn from(k: CoreAlertKind) -> Self {
        match k {
            CoreAlertKind::Info => Self::Info,
            CoreAlertKind::Success => Self::Success,
            CoreAlertKind::Danger => Self::Danger,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MediaKind {
    Audio,
    Video,
    Screenshare,
    Chat,
}

impl From<MediaKind> for CoreMediaKind {
    fn from(k: MediaKind) -> Self {
        match k {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video => Self::Video,
            MediaKind::Screenshare => Self::Screenshare,
            MediaKind::Chat => Self::Chat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum RecordingPhase {
    Stopped,
    Running,
    Paused,
}

impl From<CoreRecordingPhase> for RecordingPhase {
    fn from(p: CoreRecordingPhase) -> Self {
        match p {
            CoreRecordingPhase::Stopped => Self::Stopped,
            CoreRecordingPhase::Running => Self::Running,
            CoreRecordingPhase::Paused => Self::Paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, uniffi::Enum)]
pub enum SessionEvent {
    StateChanged { slices: Vec<StateSlice> },
    ValidatedChanged { validated: bool },
    LoadingChanged { visible: bool },
    Alert { message: String, kind: AlertKind },
    RecordingTick { elapsed: String },
    MeetingTick { elapsed: String },
    Disconnected,
    Redirect { url: String },
    CloseModals,
}

impl From<CoreSessionEvent> for SessionEvent {
    fn from(e: CoreSessionEvent) -> Self {
        match e {
            CoreSessionEvent::StateChanged(slices) => Self::StateChanged {
                slices: slices.into_iter().map(Into::into).collect(),
            },
            CoreSessionEvent::ValidatedChanged(validated) => Self::ValidatedChanged { validated },
            CoreSessionEvent::LoadingChanged(visible) => Self::LoadingChanged { visible },
            CoreSessionEvent::Alert(CoreAlert { message, kind }) => {
                Self::Alert { message, kind: kind.into() }
            }
            CoreSessionEvent::RecordingTick(elapsed) => Self::RecordingTick { elapsed },
            CoreSessionEvent::MeetingTick(elapsed) => Self::MeetingTick { elapsed },
            CoreSessionEvent::Disconnected => Self::Disconnected,
            CoreSessionEvent::Redirect(url) => Self::Redirect { url },
            CoreSessionEvent::CloseModals => Self::CloseModals,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum JoinOutcome {
    Joined,
    Deduplicated,
    Failed { reason: String },
}

impl From<CoreJoinOutcome> for JoinOutcome {
    fn from(o: CoreJoinOutcome) -> Self {
        match o {
            CoreJoinOutcome::Joined => Self::Joined,
            CoreJoinOutcome::Deduplicated => Self::Deduplicated,
            CoreJoinOutcome::Failed(reason) => Self::Failed { reason },
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct JoinParams {
    pub room_name: String,
    pub member: String,
    pub islevel: String,
    pub admin_passcode: Option<String>,
    pub api_user_name: Option<String>,
    pub api_token: Option<String>,
    pub link: Option<String>,
    pub show_loading_modal: bool,
}

impl From<JoinParams> for JoinRequest {
    fn from(p: JoinParams) -> Self {
        Self {
            room_name: p.room_name,
            member: p.member,
            admin_passcode: p.admin_passcode.unwrap_or_default(),
            islevel: p.islevel,
            api_user_name: p.api_user_name.unwrap_or_default(),
            api_token: p.api_token.unwrap_or_default(),
            link: p.link.unwrap_or_default(),
            show_loading_modal: p.show_loading_modal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct SessionInfo {
    pub validated: bool,
    pub room_name: String,
    pub member: String,
    pub islevel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct ParticipantInfo {
    pub id: Option<String>,
    pub name: String,
    pub is_host: bool,
    pub muted: bool,
    pub audio_on: bool,
    pub video_on: bool,
}

impl From<&sfu_session_core::Participant> for ParticipantInfo {
    fn from(p: &sfu_session_core::Participant) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            is_host: p.is_host(),
            muted: p.muted,
            audio_on: p.audio_on,
            video_on: p.video_on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct RequestInfo {
    pub id: String,
    pub icon: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct WaitingInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct ChatMessage {
    pub sender: String,
    pub receivers: Vec<String>,
    pub message: String,
    pub timestamp: String,
    pub group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct PollInfo {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
    pub votes: Vec<i64>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct RecordingInfo {
    pub phase: RecordingPhase,
    pub elapsed_seconds: u64,
    pub pause_count: u32,
    pub can_pause_resume: bool,
}

impl From<RecordingTimerState> for RecordingInfo {
    fn from(s: RecordingTimerState) -> Self {
        Self {
            phase: s.phase.into(),
            elapsed_seconds: s.elapsed_seconds,
            pause_count: s.pause_count,
            can_pause_resume: s.can_pause_resume,
        }
    }
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct BoardPoint {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct BoardShape {
    /// `freehand`, `line`, `rectangle`, `circle`, `text`, ...
    pub kind: String,
    pub points: Vec<BoardPoint>,
    pub color: String,
    pub thickness: f32,
    pub text: Option<String>,
}

impl From<BoardShape> for Shape {
    fn from(s: BoardShape) -> Self {
        let kind = ShapeKind::parse(&s.kind);
        let mut points: Vec<Point> = s.points.into_iter().map(|p| Point::new(p.x, p.y)).collect();
        // Only freehand strokes keep the full path.
        let (start, end) = if kind == ShapeKind::Freehand {
            (None, None)
        } else {
            let ends = (points.first().copied(), points.last().copied().filter(|_| points.len() > 1));
            points.clear();
            ends
        };
        Self {
            kind,
            start,
            end,
            points,
            color: s.color,
            thickness: s.thickness,
            text: s.text,
            ..Shape::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct Settings {
    pub local_link: Option<String>,
    pub api_user_name: String,
    pub has_api_key: bool,
    pub connect_media_sfu: bool,
    pub use_local_ui_mode: bool,
}

impl From<sfu_session_core::SessionConfig> for Settings {
    fn from(c: sfu_session_core::SessionConfig) -> Self {
        Self {
            local_link: c.local_link,
            api_user_name: c.api_user_name,
            has_api_key: !c.api_key.is_empty(),
            connect_media_sfu: c.connect_media_sfu,
            use_local_ui_mode: c.use_local_ui_mode,
        }
    }
}

// ── Error conversion ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum SessionError {
    #[error("Connection error: {msg}")]
    Connection { msg: String },
    #[error("Not connected")]
    NotConnected,
    #[error("Rejected: {msg}")]
    Rejected { msg: String },
    #[error("Configuration error: {msg}")]
    Config { msg: String },
    #[error("HTTP error: {msg}")]
    Http { msg: String },
    #[error("Invalid URL: {msg}")]
    InvalidUrl { msg: String },
}

impl From<sfu_session_core::SessionError> for SessionError {
    fn from(e: sfu_session_core::SessionError) -> Self {
        use sfu_session_core::SessionError as Core;
        tracing::error!("SessionError: {e}");
        let msg = e.user_message();
        match e {
            Core::Connection(_) | Core::Timeout(_) | Core::Emit(_) | Core::AckTimeout(_) => {
                Self::Connection { msg }
            }
            Core::NotConnected => Self::NotConnected,
            Core::JoinRejected(_) | Core::Recording(_) | Core::Breakout(_) => Self::Rejected { msg },
            Core::Config(_) | Core::Serialization(_) => Self::Config { msg },
            Core::Http(_) => Self::Http { msg },
            Core::InvalidUrl(_) => Self::InvalidUrl { msg },
        }
    }
}

// ── Callback interface ────────────────────────────────────────────────

#[uniffi::export(callback_interface)]
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

// ── Bridge listener: FFI callback → core listener ─────────────────────

struct BridgeListener {
    ffi_listener: Box<dyn SessionListener>,
}

impl sfu_session_core::SessionEventListener for BridgeListener {
    fn on_event(&self, event: CoreSessionEvent) {
        self.ffi_listener.on_event(event.into());
    }
}

// ── SessionClient: main FFI object ────────────────────────────────────

#[derive(uniffi::Object)]
pub struct SessionClient {
    orchestrator: Arc<SessionOrchestrator>,
    config: Arc<ConfigStore>,
    emitter: EventEmitter,
    rt: tokio::runtime::Runtime,
}

#[uniffi::export]
impl SessionClient {
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Result<Arc<Self>, SessionError> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| SessionError::Config { msg: format!("failed to create tokio runtime: {e}") })?;
        let config = Arc::new(ConfigStore::new(&data_dir));
        let emitter = EventEmitter::new();
        let collaborators = Collaborators::live(config.get().local_link);
        let orchestrator = {
            let _guard = rt.enter();
            SessionOrchestrator::new(config.clone(), emitter.clone(), collaborators)
        };
        tracing::info!("session client created in {data_dir}");
        Ok(Arc::new(Self { orchestrator, config, emitter, rt }))
    }

    pub fn add_listener(&self, listener: Box<dyn SessionListener>) {
        self.emitter
            .add_listener(Arc::new(BridgeListener { ffi_listener: listener }));
    }

    // -- session --

    pub fn connect(&self, params: JoinParams) -> JoinOutcome {
        self.rt
            .block_on(self.orchestrator.connect_and_validate(params.into()))
            .into()
    }

    pub fn join_room_via_api(
        &self,
        meeting_id: String,
        user_name: String,
        islevel: String,
        admin_passcode: Option<String>,
    ) -> JoinOutcome {
        let mut payload = JoinRoomPayload::new(&meeting_id, &user_name);
        payload.islevel = islevel;
        payload.admin_passcode = admin_passcode.filter(|p| !p.is_empty());
        self.rt
            .block_on(self.orchestrator.join_with_provisioning(payload, self.api_auth()))
            .into()
    }

    pub fn create_room_via_api(&self, user_name: String, duration_minutes: u32, capacity: u32) -> JoinOutcome {
        let payload = CreateRoomPayload::new(&user_name, duration_minutes, capacity);
        self.rt
            .block_on(self.orchestrator.create_with_provisioning(payload, self.api_auth()))
            .into()
    }

    pub fn close_and_reset(&self) {
        self.rt.block_on(self.orchestrator.close_and_reset());
    }

    pub fn confirm_exit(&self, ban: bool) {
        self.rt.block_on(self.orchestrator.confirm_exit(ban));
    }

    pub fn start_auto_join(&self) {
        let _guard = self.rt.enter();
        self.orchestrator.start_supervisor();
    }

    pub fn stop_auto_join(&self) {
        self.orchestrator.stop_supervisor();
    }

    pub fn session_info(&self) -> SessionInfo {
        let s = self.rt.block_on(self.orchestrator.context().session());
        SessionInfo {
            validated: s.validated,
            room_name: s.room_name,
            member: s.member,
            islevel: s.islevel,
        }
    }

    // -- roster --

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.rt.block_on(async {
            let roster = self.orchestrator.context().roster.lock().await;
            roster.participants().iter().map(Into::into).collect()
        })
    }

    pub fn requests(&self) -> Vec<RequestInfo> {
        self.rt.block_on(async {
            let roster = self.orchestrator.context().roster.lock().await;
            roster
                .requests()
                .iter()
                .map(|r| RequestInfo {
                    id: r.id.clone(),
                    icon: r.icon.clone(),
                    name: r.name.clone().or_else(|| r.username.clone()).unwrap_or_default(),
                })
                .collect()
        })
    }

    pub fn waiting(&self) -> Vec<WaitingInfo> {
        self.rt.block_on(async {
            let roster = self.orchestrator.context().roster.lock().await;
            roster
                .waiting()
                .iter()
                .map(|w| WaitingInfo { id: w.id.clone(), name: w.name.clone() })
                .collect()
        })
    }

    pub fn respond_to_request(&self, request_id: String, accept: bool) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.respond_to_request(&request_id, accept))
            .map_err(Into::into)
    }

    /// Report that local capture of `kind` started or stopped.
    pub fn set_local_media(&self, kind: MediaKind, on: bool) {
        self.rt.block_on(self.orchestrator.set_local_media(kind.into(), on));
    }

    pub fn control_media(&self, participant_name: String, kind: MediaKind) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.control_media(&participant_name, kind.into()))
            .map_err(Into::into)
    }

    // -- chat --

    pub fn send_message(&self, text: String, receivers: Vec<String>, group: bool) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.send_message(&text, receivers, group))
            .map_err(Into::into)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.rt.block_on(async {
            let log = self.orchestrator.context().messages.lock().await;
            log.messages
                .iter()
                .map(|m| ChatMessage {
                    sender: m.sender.clone(),
                    receivers: m.receivers.clone(),
                    message: m.message.clone(),
                    timestamp: m.timestamp.clone(),
                    group: m.group,
                })
                .collect()
        })
    }

    pub fn mark_messages_read(&self) {
        self.rt.block_on(self.orchestrator.mark_messages_read());
    }

    // -- polls --

    pub fn polls(&self) -> Vec<PollInfo> {
        self.rt.block_on(async {
            let polls = self.orchestrator.context().polls.lock().await;
            polls
                .polls
                .iter()
                .map(|p| PollInfo {
                    id: p.id.clone().unwrap_or_default(),
                    question: p.question.clone(),
                    options: p.options.clone(),
                    votes: p.votes.clone(),
                    status: p.status.clone().unwrap_or_default(),
                })
                .collect()
        })
    }

    pub fn create_poll(&self, question: String, poll_type: String, options: Vec<String>) -> Result<(), SessionError> {
        let poll = NewPoll { question, poll_type, options };
        self.rt
            .block_on(self.orchestrator.create_poll(&poll))
            .map_err(Into::into)
    }

    pub fn vote_poll(&self, poll_id: String, choice: u32) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.vote_poll(&poll_id, choice as usize))
            .map_err(Into::into)
    }

    pub fn end_poll(&self, poll_id: String) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.end_poll(&poll_id))
            .map_err(Into::into)
    }

    // -- breakout --

    pub fn start_random_breakout(&self, rooms: u32, new_participant_action: String) -> Result<(), SessionError> {
        self.rt.block_on(async {
            let assignment = self.orchestrator.plan_random_breakout(rooms as usize).await?;
            self.orchestrator
                .start_breakout(assignment, &new_participant_action)
                .await
        })
        .map_err(Into::into)
    }

    pub fn stop_breakout(&self) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.stop_breakout())
            .map_err(Into::into)
    }

    // -- whiteboard --

    pub fn draw_shape(&self, shape: BoardShape) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.draw_shape(shape.into()))
            .map_err(Into::into)
    }

    pub fn undo_board(&self) -> Result<(), SessionError> {
        self.rt.block_on(self.orchestrator.undo_board()).map_err(Into::into)
    }

    pub fn redo_board(&self) -> Result<(), SessionError> {
        self.rt.block_on(self.orchestrator.redo_board()).map_err(Into::into)
    }

    pub fn clear_board(&self) -> Result<(), SessionError> {
        self.rt.block_on(self.orchestrator.clear_board()).map_err(Into::into)
    }

    // -- recording --

    pub fn start_recording(&self) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.start_recording())
            .map_err(Into::into)
    }

    pub fn pause_recording(&self) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.pause_recording())
            .map_err(Into::into)
    }

    pub fn resume_recording(&self) -> Result<(), SessionError> {
        self.rt
            .block_on(self.orchestrator.resume_recording())
            .map_err(Into::into)
    }

    /// Returns the recorded seconds.
    pub fn stop_recording(&self) -> Result<u64, SessionError> {
        self.rt
            .block_on(self.orchestrator.stop_recording())
            .map_err(Into::into)
    }

    pub fn recording_info(&self) -> RecordingInfo {
        self.orchestrator.recording().state().into()
    }

    // -- settings --

    pub fn get_settings(&self) -> Settings {
        self.config.get().into()
    }

    /// Takes effect for REST provisioning on the next client.
    pub fn set_local_link(&self, link: Option<String>) {
        self.config.set_local_link(link.filter(|l| !l.trim().is_empty()));
    }

    pub fn set_credentials(&self, api_user_name: String, api_key: String) {
        self.config.set_credentials(api_user_name, api_key);
    }

    pub fn set_connect_media_sfu(&self, enabled: bool) {
        self.config.set_connect_media_sfu(enabled);
    }

    pub fn set_use_local_ui_mode(&self, enabled: bool) {
        self.config.set_use_local_ui_mode(enabled);
    }
}

impl SessionClient {
    fn api_auth(&self) -> ApiAuth {
        let config = self.config.get();
        ApiAuth {
            api_user_name: config.api_user_name,
            api_key: config.api_key,
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.orchestrator.stop_supervisor();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder(Arc<Mutex<Vec<SessionEvent>>>);

    impl SessionListener for Recorder {
        fn on_event(&self, event: SessionEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn client(name: &str) -> Arc<SessionClient> {
        let dir = std::env::temp_dir().join(format!("sfu-session-ffi-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        SessionClient::new(dir.to_str().unwrap().to_string()).unwrap()
    }

    #[test]
    fn core_events_map_to_ffi_events() {
        let event: SessionEvent =
            CoreSessionEvent::StateChanged(vec![CoreStateSlice::Roster, CoreStateSlice::Media]).into();
        assert_eq!(
            event,
            SessionEvent::StateChanged { slices: vec![StateSlice::Roster, StateSlice::Media] }
        );

        let alert: SessionEvent = CoreSessionEvent::Alert(CoreAlert::danger("nope")).into();
        assert_eq!(alert, SessionEvent::Alert { message: "nope".into(), kind: AlertKind::Danger });
    }

    #[test]
    fn errors_keep_user_message() {
        let err: SessionError =
            sfu_session_core::SessionError::JoinRejected("User is banned.".into()).into();
        assert!(matches!(err, SessionError::Rejected { ref msg } if msg == "User is banned."));
        let err: SessionError = sfu_session_core::SessionError::NotConnected.into();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[test]
    fn join_params_fill_blank_optionals() {
        let request: JoinRequest = JoinParams {
            room_name: "s1234567".into(),
            member: "alice".into(),
            islevel: "1".into(),
            admin_passcode: None,
            api_user_name: Some("acme01".into()),
            api_token: None,
            link: None,
            show_loading_modal: true,
        }
        .into();
        assert_eq!(request.api_user_name, "acme01");
        assert!(request.api_token.is_empty());
        assert!(request.link.is_empty());
    }

    #[test]
    fn board_shape_uses_endpoints_for_lines() {
        let shape: Shape = BoardShape {
            kind: "line".into(),
            points: vec![BoardPoint { x: 1.0, y: 2.0 }, BoardPoint { x: 3.0, y: 4.0 }],
            color: "#ff0000".into(),
            thickness: 2.0,
            text: None,
        }
        .into();
        assert_eq!(shape.start, Some(Point::new(1.0, 2.0)));
        assert_eq!(shape.end, Some(Point::new(3.0, 4.0)));
        assert!(shape.points.is_empty());
    }

    #[test]
    fn settings_round_trip_through_client() {
        let client = client("settings");
        client.set_local_link(Some("http://10.0.0.5:3000".into()));
        client.set_credentials("acme01".into(), "k".repeat(64));

        let settings = client.get_settings();
        assert_eq!(settings.local_link.as_deref(), Some("http://10.0.0.5:3000"));
        assert_eq!(settings.api_user_name, "acme01");
        assert!(settings.has_api_key);

        client.set_local_link(Some("  ".into()));
        assert_eq!(client.get_settings().local_link, None);
    }

    #[test]
    fn connect_without_credentials_fails_and_alerts() {
        let client = client("connect");
        let events = Arc::new(Mutex::new(Vec::new()));
        client.add_listener(Box::new(Recorder(events.clone())));

        let outcome = client.connect(JoinParams {
            room_name: "s1234567".into(),
            member: "alice".into(),
            islevel: "1".into(),
            admin_passcode: None,
            api_user_name: None,
            api_token: None,
            link: None,
            show_loading_modal: true,
        });
        assert_eq!(outcome, JoinOutcome::Failed { reason: "Missing API credentials.".into() });
        assert!(!client.session_info().validated);
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            SessionEvent::Alert { kind: AlertKind::Danger, .. }
        )));
    }

    #[test]
    fn commands_need_a_connection() {
        let client = client("commands");
        assert!(matches!(client.end_poll("p1".into()), Err(SessionError::NotConnected)));
        assert!(matches!(client.stop_recording(), Err(SessionError::NotConnected)));
        assert_eq!(client.recording_info().phase, RecordingPhase::Stopped);
    }
}
