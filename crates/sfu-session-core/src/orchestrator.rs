use std::collections::HashSet;
use std::sync::{Arc, Weak};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::breakout::{BreakoutAssignment, BreakoutCommands};
use crate::config::{ConfigStore, Timings};
use crate::credentials::ResolvedCredentials;
use crate::errors::SessionError;
use crate::events::{Alert, EventEmitter, SessionEvent, StateSlice};
use crate::join::{JoinOutcome, JoinProtocol, JoinRequest};
use crate::media::{MediaKind, MediaTransport, NoopMediaTransport};
use crate::meeting_timer::MeetingTimer;
use crate::messages::{local_timestamp, prepare_message, send_message, OutgoingMessage};
use crate::polls::{NewPoll, PollCommands};
use crate::provisioning::{
    ApiAuth, CreateRoomPayload, HttpProvisioning, JoinRoomPayload, RoomGrant,
    RoomProvisioningService,
};
use crate::recording::{RecordingCommands, RecordingLimits, RecordingPhase, RecordingTimer};
use crate::reducer::{Effect, EventReducer, SUBSCRIBED_EVENTS};
use crate::socket::{LoadingIndicator, SocketAcquisition};
use crate::state::{all_slices, SessionContext};
use crate::timer::{Clock, SystemClock};
use crate::transport::{build_connection_target, SocketConnector, SocketIoConnector, SocketTransport};
use crate::whiteboard::{send_board_action, Shape};

pub const CONTROL_MEDIA_REFUSED: &str =
    "You are not allowed to control media for other participants.";

/// Capabilities the session engine drives but does not own.
pub struct Collaborators {
    pub connector: Arc<dyn SocketConnector>,
    pub media: Arc<dyn MediaTransport>,
    pub provisioning: Arc<dyn RoomProvisioningService>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Socket.IO transport, REST provisioning and the system clock, with no
    /// media layer attached.
    pub fn live(local_link: Option<String>) -> Self {
        Self {
            connector: Arc::new(SocketIoConnector),
            media: Arc::new(NoopMediaTransport),
            provisioning: Arc::new(HttpProvisioning::new(local_link)),
            clock: Arc::new(SystemClock),
        }
    }
}

/// A secondary socket used to consume media from another server.
struct ConsumeSocket {
    ip: String,
    socket: Arc<dyn SocketTransport>,
}

/// Open consume sockets plus the ips still connecting.
///
/// `epoch` moves on every teardown so connects that started before it are
/// discarded when they finish.
#[derive(Default)]
struct ConsumeSockets {
    open: Vec<ConsumeSocket>,
    pending: HashSet<String>,
    epoch: u64,
}

impl ConsumeSockets {
    fn is_known(&self, ip: &str) -> bool {
        self.pending.contains(ip) || self.open.iter().any(|c| c.ip == ip)
    }
}

/// The pump task feeding one socket's events into the reducer.
struct EventBinding {
    socket: Arc<dyn SocketTransport>,
    handle: JoinHandle<()>,
}

/// Top-level session owner: join, event pump, auto-join and teardown.
pub struct SessionOrchestrator {
    ctx: SessionContext,
    config: Arc<ConfigStore>,
    timings: Timings,
    loader: LoadingIndicator,
    sockets: Arc<SocketAcquisition>,
    join: JoinProtocol,
    reducer: EventReducer,
    recording: Arc<RecordingTimer>,
    meeting_timer: Arc<MeetingTimer>,
    connector: Arc<dyn SocketConnector>,
    media: Arc<dyn MediaTransport>,
    provisioning: Arc<dyn RoomProvisioningService>,
    consume_sockets: Mutex<ConsumeSockets>,
    binding: std::sync::Mutex<Option<EventBinding>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    auto_join: std::sync::Mutex<Option<JoinHandle<()>>>,
    last_auto_join: std::sync::Mutex<Option<Instant>>,
    teardown: Mutex<()>,
    weak_self: Weak<Self>,
}

impl SessionOrchestrator {
    pub fn new(
        config: Arc<ConfigStore>,
        emitter: EventEmitter,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let timings = config.get().timings;
        let ctx = SessionContext::new(emitter.clone());
        let loader = LoadingIndicator::new(emitter.clone());
        let sockets = Arc::new(SocketAcquisition::new(
            collaborators.connector.clone(),
            SUBSCRIBED_EVENTS,
            timings.clone(),
            loader.clone(),
        ));
        let recording = Arc::new(RecordingTimer::new(collaborators.clock.clone(), emitter.clone()));
        recording.set_limits(RecordingLimits {
            record_change: timings.record_change(),
            ..RecordingLimits::default()
        });
        let meeting_timer = Arc::new(MeetingTimer::new(
            collaborators.clock.clone(),
            emitter,
            ctx.session.clone(),
        ));
        let join = JoinProtocol::new(
            ctx.clone(),
            config.clone(),
            sockets.clone(),
            loader.clone(),
            recording.clone(),
            meeting_timer.clone(),
            timings.clone(),
        );
        let reducer = EventReducer::new(
            ctx.clone(),
            recording.clone(),
            meeting_timer.clone(),
            collaborators.clock,
        );

        Arc::new_cyclic(|weak_self| Self {
            ctx,
            config,
            timings,
            loader,
            sockets,
            join,
            reducer,
            recording,
            meeting_timer,
            connector: collaborators.connector,
            media: collaborators.media,
            provisioning: collaborators.provisioning,
            consume_sockets: Mutex::new(ConsumeSockets::default()),
            binding: std::sync::Mutex::new(None),
            supervisor: std::sync::Mutex::new(None),
            auto_join: std::sync::Mutex::new(None),
            last_auto_join: std::sync::Mutex::new(None),
            teardown: Mutex::new(()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn recording(&self) -> &RecordingTimer {
        &self.recording
    }

    pub fn loader(&self) -> &LoadingIndicator {
        &self.loader
    }

    // -- join -----------------------------------------------------------

    /// Connect, join and bind the event pump on success.
    pub async fn connect_and_validate(&self, request: JoinRequest) -> JoinOutcome {
        let outcome = self.join.connect_and_validate(request).await;
        if outcome.is_joined() {
            self.bind_events();
        }
        outcome
    }

    /// Ask the REST API for a room seat, then join it over the socket.
    pub async fn join_with_provisioning(
        &self,
        payload: JoinRoomPayload,
        auth: ApiAuth,
    ) -> JoinOutcome {
        let grant = {
            let _loader = self.loader.show();
            self.provisioning.join_room(&payload, &auth).await
        };
        match grant {
            Ok(grant) => {
                let passcode = payload.admin_passcode.clone().unwrap_or_default();
                self.join_granted(grant, &payload.user_name, &payload.islevel, passcode)
                    .await
            }
            Err(e) => self.provisioning_failed(e),
        }
    }

    /// Create a room through the REST API and join it as host.
    pub async fn create_with_provisioning(
        &self,
        payload: CreateRoomPayload,
        auth: ApiAuth,
    ) -> JoinOutcome {
        let grant = {
            let _loader = self.loader.show();
            self.provisioning.create_room(&payload, &auth).await
        };
        match grant {
            Ok(grant) => {
                let passcode = grant.secure_code.clone().unwrap_or_default();
                self.join_granted(grant, &payload.user_name, "2", passcode).await
            }
            Err(e) => self.provisioning_failed(e),
        }
    }

    async fn join_granted(
        &self,
        grant: RoomGrant,
        member: &str,
        islevel: &str,
        admin_passcode: String,
    ) -> JoinOutcome {
        tracing::info!("provisioned room {}", grant.room_name);
        self.connect_and_validate(JoinRequest {
            room_name: grant.room_name.clone(),
            member: member.to_string(),
            admin_passcode,
            islevel: islevel.to_string(),
            api_user_name: grant.room_name,
            api_token: grant.secret,
            link: grant.link,
            show_loading_modal: true,
        })
        .await
    }

    fn provisioning_failed(&self, e: SessionError) -> JoinOutcome {
        let reason = e.user_message();
        tracing::error!("room provisioning failed: {e}");
        self.ctx.emitter.alert(Alert::danger(reason.clone()));
        JoinOutcome::Failed(reason)
    }

    // -- event pump -----------------------------------------------------

    /// Feed the current socket's events into the reducer.
    ///
    /// A binding for the same socket is kept; a binding for another socket
    /// is aborted first.
    fn bind_events(&self) {
        let Some(socket) = self.sockets.current() else {
            return;
        };
        let mut binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = binding.as_ref() {
            if Arc::ptr_eq(&existing.socket, &socket) && !existing.handle.is_finished() {
                return;
            }
        }
        if let Some(old) = binding.take() {
            tracing::debug!("aborting event pump of previous socket");
            old.handle.abort();
        }
        let Some(mut events) = socket.take_events() else {
            tracing::warn!("socket event stream already taken");
            return;
        };

        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                let effects = this.reducer.on_event(&event.name, event.payload).await;
                this.apply_effects(effects).await;
            }
            tracing::debug!("event pump finished");
        });
        *binding = Some(EventBinding { socket, handle });
    }

    async fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ResetSession => {
                    // Marked here so later pushes in the queue see it.
                    self.ctx.begin_closing();
                    self.spawn_detached(|this| async move { this.close_and_reset().await });
                }
                Effect::Emit { event, payload } => {
                    if let Err(e) = self.emit(event, payload).await {
                        tracing::warn!("{event} not sent: {e}");
                    }
                }
                Effect::ConnectDomains(ips) => {
                    self.spawn_detached(|this| async move { this.connect_domains(ips).await });
                }
                Effect::Redirect(url) => self.ctx.emitter.emit(SessionEvent::Redirect(url)),
                Effect::StopLocalMedia(kinds) => {
                    for kind in kinds {
                        self.stop_local(kind);
                    }
                }
            }
        }
    }

    fn spawn_detached<F, Fut>(&self, task: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(this) = weak.upgrade() {
                task(this).await;
            }
        });
    }

    /// Record whether local capture of `kind` is running.
    ///
    /// Reported by the media layer; teardown only stops kinds marked on.
    pub async fn set_local_media(&self, kind: MediaKind, on: bool) {
        let changed = {
            let mut media = self.ctx.media.lock().await;
            let changed = media.is_on(kind) != on;
            media.set_on(kind, on);
            changed
        };
        if changed {
            self.ctx.emitter.state_changed(vec![StateSlice::Media]);
        }
    }

    fn stop_local(&self, kind: MediaKind) {
        let result = match kind {
            MediaKind::Audio => self.media.stop_local_audio(),
            MediaKind::Video => self.media.stop_local_video(),
            MediaKind::Screenshare => self.media.stop_screen_share(),
            MediaKind::Chat => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!("stopping local {} failed: {e}", kind.as_str());
        }
    }

    // -- consume sockets ------------------------------------------------

    /// Open consume sockets to media servers not yet connected.
    pub async fn connect_domains(&self, ips: Vec<String>) {
        let session = self.ctx.session().await;
        let credentials = ResolvedCredentials {
            api_user_name: session.api_user_name.clone(),
            api_token: session.api_token.clone(),
            api_key: self.config.get().api_key,
            link: String::new(),
        };
        if !credentials.is_ready() {
            tracing::warn!("no credentials for consume sockets");
            return;
        }

        let mut recv_ips_changed = false;
        for ip in ips {
            let ip = ip.trim().to_string();
            if ip.is_empty() || ip == "none" {
                continue;
            }
            let epoch = {
                let mut consume = self.consume_sockets.lock().await;
                if consume.is_known(&ip) {
                    continue;
                }
                consume.pending.insert(ip.clone());
                consume.epoch
            };
            let opened = self.open_consume(&ip, &credentials, &session.room_name).await;

            let mut consume = self.consume_sockets.lock().await;
            consume.pending.remove(&ip);
            let socket = match opened {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!("consume socket to {ip} failed: {e}");
                    continue;
                }
            };
            if consume.epoch != epoch || self.ctx.is_closing() {
                drop(consume);
                tracing::debug!("session reset while connecting to {ip}, dropping socket");
                if let Err(e) = socket.disconnect().await {
                    tracing::debug!("late consume socket disconnect failed: {e}");
                }
                continue;
            }
            {
                let mut room = self.ctx.room.lock().await;
                if !room.room_recv_ips.contains(&ip) {
                    room.room_recv_ips.push(ip.clone());
                    recv_ips_changed = true;
                }
            }
            tracing::info!("consuming from {ip}");
            consume.open.push(ConsumeSocket { ip, socket });
        }
        if recv_ips_changed {
            self.ctx.emitter.state_changed(vec![StateSlice::Room]);
        }
    }

    async fn open_consume(
        &self,
        ip: &str,
        credentials: &ResolvedCredentials,
        room_name: &str,
    ) -> Result<Arc<dyn SocketTransport>, SessionError> {
        let target = build_connection_target(&format!("https://{ip}.mediasfu.com"), credentials)?;
        let timeout = self.timings.connect_timeout();
        let socket = tokio::time::timeout(timeout, self.connector.open(&target, &[]))
            .await
            .map_err(|_| SessionError::Timeout(timeout))??;
        if !socket.is_connected() {
            let _ = socket.disconnect().await;
            return Err(SessionError::NotConnected);
        }

        let ack = socket
            .emit_with_ack(
                "joinConsumeRoom",
                json!({
                    "roomName": room_name,
                    "apiToken": credentials.api_token,
                    "apiUserName": credentials.api_user_name,
                }),
                self.timings.ack_timeout(),
            )
            .await;
        match ack {
            Ok(ack) if ack.get("rtpCapabilities").is_some_and(|v| !v.is_null()) => Ok(socket),
            Ok(_) => {
                let _ = socket.disconnect().await;
                Err(SessionError::JoinRejected("consume room refused".to_string()))
            }
            Err(e) => {
                let _ = socket.disconnect().await;
                Err(e)
            }
        }
    }

    // -- teardown -------------------------------------------------------

    /// Reset the session to the pre-join state.
    ///
    /// Every step runs even when an earlier one fails, and `validated`
    /// flips last. Repeating it is silent.
    pub async fn close_and_reset(&self) {
        let _teardown = self.teardown.lock().await;
        self.ctx.begin_closing();

        let consume = {
            let mut consume = self.consume_sockets.lock().await;
            consume.epoch += 1;
            consume.pending.clear();
            std::mem::take(&mut consume.open)
        };
        let active = self.ctx.is_validated().await
            || !consume.is_empty()
            || !self.ctx.session.read().await.room_name.is_empty();
        if active {
            tracing::info!("closing session");
            self.ctx.emitter.emit(SessionEvent::CloseModals);
        }

        let (audio_on, video_on) = {
            let media = self.ctx.media.lock().await;
            (media.is_on(MediaKind::Audio), media.is_on(MediaKind::Video))
        };
        if audio_on {
            if let Err(e) = self.media.stop_local_audio() {
                tracing::warn!("teardown: stopping audio failed: {e}");
            }
        }
        if video_on {
            if let Err(e) = self.media.stop_local_video() {
                tracing::warn!("teardown: stopping video failed: {e}");
            }
        }
        for c in consume {
            if let Err(e) = c.socket.disconnect().await {
                tracing::warn!("teardown: consume socket {} disconnect failed: {e}", c.ip);
            }
        }

        self.sockets.clear_signature();
        if self.ctx.reset_slices().await {
            self.ctx.emitter.state_changed(all_slices());
        }
        self.meeting_timer.stop();
        if self.recording.phase() != RecordingPhase::Stopped
            || self.recording.state().elapsed_seconds > 0
        {
            self.recording.stop(true);
        }

        if active {
            tokio::time::sleep(self.timings.settle_delay()).await;
        }
        self.ctx.set_validated(false).await;
        self.ctx.end_closing();
    }

    /// Leave the room, optionally banning ourselves, then tear down.
    pub async fn confirm_exit(&self, ban: bool) {
        let session = self.ctx.session().await;
        let payload = json!({"member": session.member, "roomName": session.room_name, "ban": ban});
        if let Err(e) = self.emit("disconnectUser", payload).await {
            tracing::warn!("disconnectUser not sent: {e}");
        }
        self.close_and_reset().await;
    }

    // -- auto-join ------------------------------------------------------

    /// Start the reconnect supervisor. Replaces a running one.
    pub fn start_supervisor(&self) {
        let weak = self.weak_self.clone();
        let tick = self.timings.auto_join_tick();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.auto_join_tick().await;
            }
        });
        let previous = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop_supervisor(&self) {
        if let Some(handle) = self.supervisor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        if let Some(handle) = self.auto_join.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Launch a silent rejoin when the validated session lost its socket.
    async fn auto_join_tick(&self) {
        if !self.ctx.is_live().await || self.sockets.is_connected() || self.loader.is_visible() {
            return;
        }
        let mut attempt = self.auto_join.lock().unwrap_or_else(|e| e.into_inner());
        if attempt.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        {
            let mut last = self.last_auto_join.lock().unwrap_or_else(|e| e.into_inner());
            if last.is_some_and(|t| t.elapsed() < self.timings.auto_join_interval()) {
                return;
            }
            *last = Some(Instant::now());
        }

        tracing::info!("socket lost while validated, rejoining");
        let weak = self.weak_self.clone();
        *attempt = Some(tokio::spawn(async move {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let session = this.ctx.session().await;
            let outcome = this
                .connect_and_validate(JoinRequest {
                    room_name: session.room_name,
                    member: session.member,
                    admin_passcode: session.admin_passcode,
                    islevel: session.islevel,
                    api_user_name: session.api_user_name,
                    api_token: session.api_token,
                    link: session.link,
                    show_loading_modal: false,
                })
                .await;
            tracing::debug!("auto-join finished: {outcome:?}");
        }));
    }

    // -- commands -------------------------------------------------------

    fn socket(&self) -> Result<Arc<dyn SocketTransport>, SessionError> {
        self.sockets
            .current()
            .filter(|s| s.is_connected())
            .ok_or(SessionError::NotConnected)
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), SessionError> {
        self.socket()?.emit(event, payload).await
    }

    /// Alert a refusal and hand the error back.
    fn refuse<T>(&self, e: SessionError) -> Result<T, SessionError> {
        self.ctx.emitter.alert(Alert::danger(e.user_message()));
        Err(e)
    }

    pub async fn send_message(
        &self,
        text: &str,
        receivers: Vec<String>,
        group: bool,
    ) -> Result<(), SessionError> {
        let session = self.ctx.session().await;
        let chat_setting = self.ctx.media.lock().await.setting(MediaKind::Chat).to_string();
        let prepared = {
            let roster = self.ctx.roster.lock().await;
            let log = self.ctx.messages.lock().await;
            prepare_message(
                &OutgoingMessage {
                    member: &session.member,
                    islevel: &session.islevel,
                    room_name: &session.room_name,
                    chat_setting: &chat_setting,
                    message: text,
                    receivers,
                    group,
                    sender: "",
                },
                &log,
                &roster,
                local_timestamp(),
            )
        };
        let message = match prepared {
            Ok(message) => message,
            Err(e) => return self.refuse(e),
        };
        let socket = self.socket()?;
        send_message(socket.as_ref(), &session.room_name, &message).await
    }

    pub async fn mark_messages_read(&self) {
        self.ctx.messages.lock().await.mark_read();
        self.ctx.meeting.lock().await.unread_messages = false;
        self.ctx.emitter.state_changed(vec![StateSlice::Messages, StateSlice::Meeting]);
    }

    /// Answer a participant's media or chat request.
    pub async fn respond_to_request(&self, request_id: &str, accept: bool) -> Result<(), SessionError> {
        let room_name = self.ctx.session.read().await.room_name.clone();
        let Some(request) = self.ctx.roster.lock().await.remove_request(request_id) else {
            return Err(SessionError::Config(format!("unknown request {request_id}")));
        };
        self.ctx.emitter.state_changed(vec![StateSlice::Requests]);

        let name = request.name.or(request.username).unwrap_or_default();
        let payload = json!({
            "requestResponse": {
                "id": request.id,
                "name": name,
                "type": request.icon,
                "action": if accept { "accepted" } else { "rejected" },
            },
            "roomName": room_name,
        });
        self.emit("updateUserofRequestStatus", payload).await
    }

    /// Mute or stop a participant's media. Host or media co-host only.
    pub async fn control_media(
        &self,
        participant_name: &str,
        kind: MediaKind,
    ) -> Result<(), SessionError> {
        let session = self.ctx.session().await;
        let participant_id = {
            let roster = self.ctx.roster.lock().await;
            if !session.is_host() && !roster.co_host_can(&session.member, "media") {
                drop(roster);
                return self.refuse(SessionError::Config(CONTROL_MEDIA_REFUSED.to_string()));
            }
            roster
                .participant(participant_name)
                .and_then(|p| p.id.clone())
                .unwrap_or_default()
        };
        self.emit(
            "controlMedia",
            json!({
                "participantId": participant_id,
                "participantName": participant_name,
                "type": kind.as_str(),
                "roomName": session.room_name,
            }),
        )
        .await
    }

    pub async fn create_poll(&self, poll: &NewPoll) -> Result<(), SessionError> {
        let socket = self.socket()?;
        let room_name = self.ctx.session.read().await.room_name.clone();
        self.poll_commands(socket.as_ref(), &room_name).create(poll).await
    }

    pub async fn vote_poll(&self, poll_id: &str, choice: usize) -> Result<(), SessionError> {
        let socket = self.socket()?;
        let session = self.ctx.session().await;
        self.poll_commands(socket.as_ref(), &session.room_name)
            .vote(poll_id, &session.member, choice)
            .await?;
        self.ctx.polls.lock().await.modal_visible = false;
        self.ctx.emitter.state_changed(vec![StateSlice::Polls]);
        Ok(())
    }

    pub async fn end_poll(&self, poll_id: &str) -> Result<(), SessionError> {
        let socket = self.socket()?;
        let room_name = self.ctx.session.read().await.room_name.clone();
        self.poll_commands(socket.as_ref(), &room_name).end(poll_id).await
    }

    fn poll_commands<'a>(&'a self, socket: &'a dyn SocketTransport, room_name: &'a str) -> PollCommands<'a> {
        PollCommands {
            socket,
            emitter: &self.ctx.emitter,
            room_name,
            ack_timeout: self.timings.ack_timeout(),
        }
    }

    /// Shuffle current non-host participants into `rooms` rooms.
    pub async fn plan_random_breakout(&self, rooms: usize) -> Result<BreakoutAssignment, SessionError> {
        let participants = self.ctx.roster.lock().await.participants().to_vec();
        BreakoutAssignment::random(&participants, rooms, &mut rand::thread_rng())
    }

    /// Start breakout rooms, or push a new assignment to running ones.
    pub async fn start_breakout(
        &self,
        assignment: BreakoutAssignment,
        new_participant_action: &str,
    ) -> Result<(), SessionError> {
        let socket = self.socket()?;
        let room_name = self.ctx.session.read().await.room_name.clone();
        let capacity = self.ctx.room.lock().await.item_page_limit();
        let screen_share_active = {
            let media = self.ctx.media.lock().await;
            media.share_screen_started || media.is_on(MediaKind::Screenshare)
        };
        let running = self.ctx.breakout.lock().await.is_running();

        self.breakout_commands(socket.as_ref(), &room_name)
            .start(&assignment, new_participant_action, running, screen_share_active, capacity)
            .await?;

        let mut meeting = self.ctx.meeting.lock().await;
        let mut breakout = self.ctx.breakout.lock().await;
        breakout.rooms = assignment.into_rooms();
        breakout.mark_started(&mut meeting);
        drop((breakout, meeting));
        self.ctx
            .emitter
            .state_changed(vec![StateSlice::Breakout, StateSlice::Meeting]);
        Ok(())
    }

    pub async fn stop_breakout(&self) -> Result<(), SessionError> {
        let socket = self.socket()?;
        let room_name = self.ctx.session.read().await.room_name.clone();
        self.breakout_commands(socket.as_ref(), &room_name).stop().await?;

        let mut meeting = self.ctx.meeting.lock().await;
        self.ctx.breakout.lock().await.mark_stopped(&mut meeting);
        drop(meeting);
        self.ctx
            .emitter
            .state_changed(vec![StateSlice::Breakout, StateSlice::Meeting]);
        Ok(())
    }

    fn breakout_commands<'a>(
        &'a self,
        socket: &'a dyn SocketTransport,
        room_name: &'a str,
    ) -> BreakoutCommands<'a> {
        BreakoutCommands {
            socket,
            emitter: &self.ctx.emitter,
            room_name,
            ack_timeout: self.timings.ack_timeout(),
        }
    }

    /// Draw a shape locally and broadcast it.
    pub async fn draw_shape(&self, shape: Shape) -> Result<(), SessionError> {
        let session = self.ctx.session().await;
        let (action, payload) = {
            let mut board = self.ctx.whiteboard.lock().await;
            if !board.can_draw(&session.member, &session.islevel) {
                drop(board);
                return self.refuse(SessionError::Config(
                    "You are not allowed to draw on the whiteboard".to_string(),
                ));
            }
            board.add_local_shape(shape)
        };
        self.ctx.emitter.state_changed(vec![StateSlice::Whiteboard]);
        let socket = self.socket()?;
        send_board_action(socket.as_ref(), &session.room_name, action, payload).await
    }

    pub async fn undo_board(&self) -> Result<(), SessionError> {
        let changed = self.ctx.whiteboard.lock().await.undo_local();
        self.board_edit(changed, "undo").await
    }

    pub async fn redo_board(&self) -> Result<(), SessionError> {
        let changed = self.ctx.whiteboard.lock().await.redo_local();
        self.board_edit(changed, "redo").await
    }

    pub async fn clear_board(&self) -> Result<(), SessionError> {
        self.ctx.whiteboard.lock().await.clear_local();
        self.board_edit(true, "clear").await
    }

    async fn board_edit(&self, changed: bool, action: &str) -> Result<(), SessionError> {
        if !changed {
            return Ok(());
        }
        self.ctx.emitter.state_changed(vec![StateSlice::Whiteboard]);
        let socket = self.socket()?;
        let room_name = self.ctx.session.read().await.room_name.clone();
        send_board_action(socket.as_ref(), &room_name, action, json!({})).await
    }

    pub async fn start_recording(&self) -> Result<(), SessionError> {
        let (socket, room_name, params) = self.recording_target().await?;
        self.recording_commands(socket.as_ref(), &room_name, params).start().await
    }

    pub async fn pause_recording(&self) -> Result<(), SessionError> {
        let (socket, room_name, params) = self.recording_target().await?;
        self.recording_commands(socket.as_ref(), &room_name, params).pause().await
    }

    pub async fn resume_recording(&self) -> Result<(), SessionError> {
        let (socket, room_name, params) = self.recording_target().await?;
        self.recording_commands(socket.as_ref(), &room_name, params).resume().await
    }

    /// Returns the recorded seconds.
    pub async fn stop_recording(&self) -> Result<u64, SessionError> {
        let (socket, room_name, params) = self.recording_target().await?;
        self.recording_commands(socket.as_ref(), &room_name, params).stop().await
    }

    async fn recording_target(&self) -> Result<(Arc<dyn SocketTransport>, String, Value), SessionError> {
        let socket = self.socket()?;
        let room_name = self.ctx.session.read().await.room_name.clone();
        let params = self
            .ctx
            .room
            .lock()
            .await
            .user_recording_params
            .clone()
            .unwrap_or_else(|| json!({}));
        Ok((socket, room_name, params))
    }

    fn recording_commands<'a>(
        &'a self,
        socket: &'a dyn SocketTransport,
        room_name: &'a str,
        user_recording_params: Value,
    ) -> RecordingCommands<'a> {
        RecordingCommands {
            timer: &self.recording,
            socket,
            emitter: &self.ctx.emitter,
            room_name,
            user_recording_params,
            ack_timeout: self.timings.ack_timeout(),
        }
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        let handles = [
            self.supervisor.get_mut().unwrap_or_else(|e| e.into_inner()).take(),
            self.auto_join.get_mut().unwrap_or_else(|e| e.into_inner()).take(),
            self.binding
                .get_mut()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .map(|b| b.handle),
        ];
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::events::testing::EventCapture;
    use crate::participants::{Participant, Request};
    use crate::timer::testing::ManualClock;
    use crate::transport::fake::{FakeConnector, FakeSocket};

    #[derive(Default)]
    struct CountingMedia {
        audio: AtomicUsize,
        video: AtomicUsize,
        screen: AtomicUsize,
    }

    impl MediaTransport for CountingMedia {
        fn stop_local_audio(&self) -> Result<(), SessionError> {
            self.audio.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::Connection("no microphone".into()))
        }

        fn stop_local_video(&self) -> Result<(), SessionError> {
            self.video.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop_screen_share(&self) -> Result<(), SessionError> {
            self.screen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FixedGrant(RoomGrant);

    #[async_trait]
    impl RoomProvisioningService for FixedGrant {
        async fn create_room(
            &self,
            _payload: &CreateRoomPayload,
            _auth: &ApiAuth,
        ) -> Result<RoomGrant, SessionError> {
            Ok(self.0.clone())
        }

        async fn join_room(
            &self,
            _payload: &JoinRoomPayload,
            _auth: &ApiAuth,
        ) -> Result<RoomGrant, SessionError> {
            Ok(self.0.clone())
        }
    }

    /// Long enough for the pump to drain queued pushes.
    const SETTLE: Duration = Duration::from_millis(50);

    struct Harness {
        orch: Arc<SessionOrchestrator>,
        connector: Arc<FakeConnector>,
        media: Arc<CountingMedia>,
        capture: Arc<EventCapture>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(provisioning: Arc<dyn RoomProvisioningService>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::new(dir.path().to_str().unwrap()));
        config.set_local_link(Some("http://localhost:3000".into()));
        let connector = FakeConnector::new();
        let media = Arc::new(CountingMedia::default());
        let emitter = EventEmitter::new();
        let capture = EventCapture::attach(&emitter);
        let orch = SessionOrchestrator::new(
            config,
            emitter,
            Collaborators {
                connector: connector.clone(),
                media: media.clone(),
                provisioning,
                clock: Arc::new(ManualClock::at(0)),
            },
        );
        Harness { orch, connector, media, capture, _dir: dir }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(HttpProvisioning::new(None)))
    }

    fn request(islevel: &str) -> JoinRequest {
        JoinRequest {
            room_name: "demo".into(),
            member: "alice".into(),
            islevel: islevel.into(),
            show_loading_modal: true,
            ..JoinRequest::default()
        }
    }

    fn joined_socket() -> Arc<FakeSocket> {
        let socket = FakeSocket::new(true);
        socket.push_ack(json!({"rtpCapabilities": {}, "isHost": false}));
        socket
    }

    async fn join(h: &Harness, islevel: &str) -> Arc<FakeSocket> {
        let socket = joined_socket();
        h.connector.push_socket(socket.clone());
        assert!(h.orch.connect_and_validate(request(islevel)).await.is_joined());
        socket
    }

    #[tokio::test(start_paused = true)]
    async fn pump_applies_server_events_after_join() {
        let h = harness();
        let socket = join(&h, "1").await;

        socket.push_event(
            "allMembers",
            json!({"members": [{"id": "p1", "name": "alice"}, {"id": "p2", "name": "bob"}]}),
        );
        tokio::time::sleep(SETTLE).await;
        assert_eq!(h.orch.context().roster.lock().await.participants().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_disconnect_tears_down_once() {
        let h = harness();
        let socket = join(&h, "1").await;
        h.orch.set_local_media(MediaKind::Audio, true).await;
        h.orch.set_local_media(MediaKind::Video, true).await;
        h.capture.clear();

        socket.push_event("disconnect", json!({}));
        socket.push_event("disconnect", json!({}));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!h.orch.context().is_validated().await);
        assert!(!h.orch.context().is_closing());
        let disconnected = h
            .capture
            .alerts()
            .into_iter()
            .filter(|a| a == "You have been disconnected from the session.")
            .count();
        assert_eq!(disconnected, 1);
        assert_eq!(h.media.audio.load(Ordering::SeqCst), 1);
        assert_eq!(h.media.video.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_and_reset_is_idempotent() {
        let h = harness();
        join(&h, "1").await;
        h.orch.context().media.lock().await.screen_id = "scr".into();

        h.orch.close_and_reset().await;
        let ctx = h.orch.context();
        assert!(!ctx.is_validated().await);
        assert!(ctx.session().await.room_name.is_empty());
        assert!(ctx.media.lock().await.screen_id.is_empty());
        assert!(h.capture.events().contains(&SessionEvent::CloseModals));
        assert_eq!(
            h.capture.events().last(),
            Some(&SessionEvent::ValidatedChanged(false))
        );

        h.capture.clear();
        h.orch.close_and_reset().await;
        assert!(h.capture.events().is_empty());
        assert!(!ctx.is_validated().await);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_clears_signature_and_skips_idle_media() {
        let h = harness();
        join(&h, "1").await;
        h.orch.set_local_media(MediaKind::Video, true).await;
        assert!(h.orch.sockets.signature().is_some());

        h.orch.close_and_reset().await;
        assert!(h.orch.sockets.signature().is_none());
        assert!(h.orch.sockets.current().is_some());
        assert_eq!(h.media.audio.load(Ordering::SeqCst), 0);
        assert_eq!(h.media.video.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_survives_failing_consume_socket() {
        let h = harness();
        join(&h, "1").await;
        {
            let mut s = h.orch.context().session.write().await;
            s.api_user_name = "acme01".into();
            s.api_token = "t".repeat(64);
        }
        let edge = FakeSocket::new(true);
        edge.push_ack(json!({"rtpCapabilities": {}}));
        edge.fail_disconnect.store(true, Ordering::SeqCst);
        h.connector.push_socket(edge.clone());

        h.orch.connect_domains(vec!["edge1".into(), "none".into()]).await;
        assert_eq!(
            h.connector.targets.lock().unwrap().last().unwrap().base_url,
            "https://edge1.mediasfu.com"
        );
        assert!(h
            .orch
            .context()
            .room
            .lock()
            .await
            .room_recv_ips
            .contains(&"edge1".to_string()));

        // Already connected: no second open.
        h.orch.connect_domains(vec!["edge1".into()]).await;
        assert_eq!(h.connector.open_count(), 2);

        h.orch.close_and_reset().await;
        assert_eq!(edge.disconnects.load(Ordering::SeqCst), 1);
        assert!(!h.orch.context().is_validated().await);
    }

    async fn with_api_credentials(h: &Harness) {
        let mut s = h.orch.context().session.write().await;
        s.api_user_name = "acme01".into();
        s.api_token = "t".repeat(64);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_triggers_open_one_consume_socket() {
        let h = harness();
        join(&h, "1").await;
        with_api_credentials(&h).await;
        let edge = FakeSocket::new(true);
        edge.push_ack(json!({"rtpCapabilities": {}}));
        h.connector.push_socket(edge.clone());
        *h.connector.open_delay.lock().unwrap() = Duration::from_millis(500);

        let first = tokio::spawn({
            let orch = h.orch.clone();
            async move { orch.connect_domains(vec!["edge1".into()]).await }
        });
        let second = tokio::spawn({
            let orch = h.orch.clone();
            async move { orch.connect_domains(vec!["edge1".into()]).await }
        });
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(h.connector.open_count(), 2);
        assert_eq!(h.orch.consume_sockets.lock().await.open.len(), 1);
        let recv_ips = h.orch.context().room.lock().await.room_recv_ips.clone();
        assert_eq!(recv_ips.iter().filter(|ip| *ip == "edge1").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_during_consume_connect_drops_the_late_socket() {
        let h = harness();
        join(&h, "1").await;
        with_api_credentials(&h).await;
        let edge = FakeSocket::new(true);
        edge.push_ack(json!({"rtpCapabilities": {}}));
        h.connector.push_socket(edge.clone());
        *h.connector.open_delay.lock().unwrap() = Duration::from_secs(3);

        let connecting = tokio::spawn({
            let orch = h.orch.clone();
            async move { orch.connect_domains(vec!["edge1".into()]).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.orch.close_and_reset().await;
        connecting.await.unwrap();

        assert_eq!(edge.disconnects.load(Ordering::SeqCst), 1);
        let consume = h.orch.consume_sockets.lock().await;
        assert!(consume.open.is_empty());
        assert!(consume.pending.is_empty());
        drop(consume);
        assert!(h.orch.context().room.lock().await.room_recv_ips.is_empty());
        assert!(!h.orch.context().is_validated().await);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_rejoins_once_when_socket_drops() {
        let h = harness();
        let first = join(&h, "1").await;
        let second = joined_socket();
        *second.ack_delay.lock().unwrap() = Duration::from_secs(3);
        h.connector.push_socket(second.clone());

        first.set_connected(false);
        h.orch.start_supervisor();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.connector.open_count(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connector.open_count(), 2);
        assert_eq!(second.emitted_names(), vec!["joinRoom".to_string()]);
        assert!(h.orch.context().is_validated().await);
        h.orch.stop_supervisor();
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_ignores_sessions_that_are_not_validated() {
        let h = harness();
        h.orch.start_supervisor();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(h.connector.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_exit_sends_ban_flag() {
        let h = harness();
        let socket = join(&h, "1").await;

        h.orch.confirm_exit(true).await;
        assert_eq!(
            socket.last_emit("disconnectUser"),
            Some(json!({"member": "alice", "roomName": "demo", "ban": true}))
        );
        assert!(!h.orch.context().is_validated().await);
    }

    #[tokio::test(start_paused = true)]
    async fn control_media_requires_host_or_media_co_host() {
        let h = harness();
        let socket = join(&h, "1").await;

        let err = h.orch.control_media("bob", MediaKind::Audio).await.unwrap_err();
        assert_eq!(err.user_message(), CONTROL_MEDIA_REFUSED);
        assert!(h.capture.alerts().contains(&CONTROL_MEDIA_REFUSED.to_string()));
        assert!(socket.last_emit("controlMedia").is_none());

        h.orch.context().session.write().await.islevel = "2".into();
        h.orch.context().roster.lock().await.set_participants(vec![Participant {
            id: Some("p2".into()),
            name: "bob".into(),
            ..Participant::default()
        }]);
        h.orch.control_media("bob", MediaKind::Video).await.unwrap();
        assert_eq!(
            socket.last_emit("controlMedia"),
            Some(json!({"participantId": "p2", "participantName": "bob", "type": "video", "roomName": "demo"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn responding_to_a_request_removes_it() {
        let h = harness();
        let socket = join(&h, "2").await;
        h.orch.context().roster.lock().await.add_request(Request {
            id: "p2".into(),
            icon: "fa-microphone".into(),
            name: Some("bob".into()),
            username: None,
        });

        h.orch.respond_to_request("p2", true).await.unwrap();
        assert!(h.orch.context().roster.lock().await.requests().is_empty());
        assert_eq!(
            socket.last_emit("updateUserofRequestStatus"),
            Some(json!({
                "requestResponse": {"id": "p2", "name": "bob", "type": "fa-microphone", "action": "accepted"},
                "roomName": "demo",
            }))
        );
        assert!(h.orch.respond_to_request("p2", false).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn host_control_effect_stops_local_media() {
        let h = harness();
        let socket = join(&h, "1").await;

        socket.push_event("controlMediaHost", json!({"type": "video"}));
        tokio::time::sleep(SETTLE).await;
        assert_eq!(h.media.video.load(Ordering::SeqCst), 1);
        assert_eq!(h.media.audio.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn provisioned_join_uses_grant_credentials() {
        let grant = RoomGrant {
            room_name: "s1234567".into(),
            secret: "t".repeat(64),
            link: "https://mediasfu.com".into(),
            success: true,
            ..RoomGrant::default()
        };
        let h = harness_with(Arc::new(FixedGrant(grant)));
        let socket = FakeSocket::new(true);
        socket.push_ack(json!({"rtpCapabilities": {}, "roomRecvIPs": ["none"]}));
        h.connector.push_socket(socket.clone());

        let mut payload = JoinRoomPayload::new("s1234567", "alice");
        payload.islevel = "1".into();
        let outcome = h
            .orch
            .join_with_provisioning(payload, ApiAuth { api_user_name: "acme01".into(), api_key: "k".repeat(64) })
            .await;
        assert!(outcome.is_joined());

        let join = socket.last_emit("joinRoom").unwrap();
        assert_eq!(join["apiUserName"], "s1234567");
        assert_eq!(join["sec"], "t".repeat(64));
        assert_eq!(
            h.connector.targets.lock().unwrap()[0].query,
            format!("apiUserName=s1234567&apiToken={}", "t".repeat(64))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_failure_is_alerted() {
        let h = harness();
        let outcome = h
            .orch
            .join_with_provisioning(
                JoinRoomPayload::new("s1234567", "alice"),
                ApiAuth { api_user_name: "acme01".into(), api_key: "short".into() },
            )
            .await;
        assert_eq!(
            outcome,
            JoinOutcome::Failed("API key must be exactly 64 characters".into())
        );
        assert_eq!(h.connector.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn breakout_start_marks_rooms_running() {
        let h = harness();
        let socket = join(&h, "2").await;
        socket.push_ack(json!({"success": true}));
        let assignment = BreakoutAssignment::from_rooms(vec![vec![
            crate::breakout::BreakoutParticipant { name: "bob".into(), break_room: Some(0) },
        ]]);

        h.orch.start_breakout(assignment, "autoAssignNewRoom").await.unwrap();
        assert_eq!(socket.emitted_names().last().unwrap(), "startBreakout");
        assert!(h.orch.context().breakout.lock().await.is_running());
        assert_eq!(h.orch.context().meeting.lock().await.display_type, "all");
    }

    #[tokio::test(start_paused = true)]
    async fn message_refusal_is_alerted() {
        let h = harness();
        let socket = join(&h, "1").await;
        h.orch
            .context()
            .media
            .lock()
            .await
            .set_setting(MediaKind::Chat, "disallow");

        assert!(h.orch.send_message("hi", Vec::new(), true).await.is_err());
        assert!(h
            .capture
            .alerts()
            .contains(&"You are not allowed to send a message in this event room".to_string()));
        assert!(socket.last_emit("sendMessage").is_none());
    }
}
