use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::breakout::BreakoutUpdate;
use crate::events::{Alert, SessionEvent, StateSlice};
use crate::media::MediaKind;
use crate::meeting_timer::MeetingTimer;
use crate::messages::{Message, Reader};
use crate::participants::{
    null_as_default, CoHostResponsibility, Participant, Request, WaitingParticipant,
};
use crate::polls::PollUpdate;
use crate::recording::{RecordingNotice, RecordingTimer};
use crate::room::RecordingParams;
use crate::state::SessionContext;
use crate::timer::Clock;
use crate::whiteboard::{WhiteboardActionEvent, WhiteboardUpdate};

/// Server pushes bound on every media socket.
pub const SUBSCRIBED_EVENTS: &[&str] = &[
    "disconnect",
    "allMembers",
    "allMembersRest",
    "userWaiting",
    "personJoined",
    "allWaitingRoomMembers",
    "participantRequested",
    "meetingEnded",
    "ban",
    "updatedCoHost",
    "screenProducerId",
    "updateMediaSettings",
    "producer-media-paused",
    "producer-media-resumed",
    "producer-media-closed",
    "controlMediaHost",
    "disconnectUserSelf",
    "receiveMessage",
    "meetingTimeRemaining",
    "meetingStillThere",
    "updateConsumingDomains",
    "hostRequestResponse",
    "pollUpdated",
    "breakoutRoomUpdated",
    "roomRecordParams",
    "startRecords",
    "reInitiateRecording",
    "RecordingNotice",
    "timeLeftRecording",
    "stoppedRecording",
    "whiteboardAction",
    "whiteboardUpdated",
];

/// Work a handler needs done outside the state slices.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Run the full teardown.
    ResetSession,
    Emit { event: &'static str, payload: Value },
    /// Open consume sockets to these media servers.
    ConnectDomains(Vec<String>),
    Redirect(String),
    StopLocalMedia(Vec<MediaKind>),
}

/// Result of one handled event.
#[derive(Debug, Default)]
struct Transition {
    slices: Vec<StateSlice>,
    effects: Vec<Effect>,
}

impl Transition {
    fn touch(slices: &[StateSlice]) -> Self {
        Self { slices: slices.to_vec(), effects: Vec::new() }
    }

    fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MembersPayload {
    #[serde(deserialize_with = "null_as_default")]
    members: Vec<Participant>,
    #[serde(deserialize_with = "null_as_default")]
    requests: Vec<Request>,
    #[serde(deserialize_with = "null_as_default")]
    settings: Vec<String>,
    co_host: Option<String>,
    co_host_responsibilities: Option<Vec<CoHostResponsibility>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NamePayload {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaitingPayload {
    #[serde(alias = "waitingParticipantss")]
    waiting_participants: Vec<WaitingParticipant>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RequestedPayload {
    user_request: Request,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MeetingEndedPayload {
    #[serde(rename = "redirectURL")]
    redirect_url: Option<String>,
    #[serde(rename = "onWeb")]
    on_web: bool,
    #[serde(rename = "eventType")]
    event_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CoHostPayload {
    co_host: Option<String>,
    co_host_responsibilities: Option<Vec<CoHostResponsibility>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProducerPayload {
    producer_id: String,
    kind: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsPayload {
    settings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TypePayload {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessagePayload {
    message: Message,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TimeRemainingPayload {
    time_remaining: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DomainsPayload {
    domains: Vec<String>,
    alt_domains: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RequestResponse {
    id: String,
    #[serde(rename = "type")]
    icon: String,
    action: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RequestResponsePayload {
    request_response: RequestResponse,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RecordParamsPayload {
    record_params: Option<RecordingParams>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TimeLeftPayload {
    time_left: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoppedRecordingPayload {
    state: String,
    reason: String,
}

/// Applies server pushes to the session slices.
///
/// One instance per session; events are fed in delivery order by the
/// orchestrator's pump. Each handled event yields at most one
/// `StateChanged` notification.
pub struct EventReducer {
    ctx: SessionContext,
    recording: Arc<RecordingTimer>,
    meeting_timer: Arc<MeetingTimer>,
    clock: Arc<dyn Clock>,
}

impl EventReducer {
    pub fn new(
        ctx: SessionContext,
        recording: Arc<RecordingTimer>,
        meeting_timer: Arc<MeetingTimer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { ctx, recording, meeting_timer, clock }
    }

    /// Handle one server push and return the effects it requests.
    pub async fn on_event(&self, name: &str, payload: Value) -> Vec<Effect> {
        tracing::debug!("server event {name}");
        let transition = match name {
            "disconnect" => self.on_disconnect().await,
            "meetingEnded" => self.on_meeting_ended(payload).await,
            "allMembers" => self.on_all_members(payload, false).await,
            "allMembersRest" => self.on_all_members(payload, true).await,
            "userWaiting" => self.on_user_waiting(payload).await,
            "personJoined" => self.on_person_joined(payload),
            "allWaitingRoomMembers" => self.on_waiting_members(payload).await,
            "participantRequested" => self.on_participant_requested(payload).await,
            "ban" => self.on_ban(payload).await,
            "updatedCoHost" => self.on_updated_co_host(payload).await,
            "screenProducerId" => self.on_screen_producer(payload).await,
            "updateMediaSettings" => self.on_media_settings(payload).await,
            "producer-media-paused" => self.on_producer(name, payload, ProducerChange::Paused).await,
            "producer-media-resumed" => self.on_producer(name, payload, ProducerChange::Resumed).await,
            "producer-media-closed" => self.on_producer(name, payload, ProducerChange::Closed).await,
            "controlMediaHost" => self.on_control_media_host(payload).await,
            "disconnectUserSelf" => self.on_disconnect_user_self().await,
            "receiveMessage" => self.on_receive_message(payload).await,
            "meetingTimeRemaining" => self.on_time_remaining(payload).await,
            "meetingStillThere" => self.on_still_there().await,
            "updateConsumingDomains" => self.on_consuming_domains(payload).await,
            "hostRequestResponse" => self.on_request_response(payload).await,
            "pollUpdated" => self.on_poll_updated(payload).await,
            "breakoutRoomUpdated" => self.on_breakout_updated(payload).await,
            "roomRecordParams" => self.on_record_params(payload).await,
            "startRecords" => self.on_start_records(false).await,
            "reInitiateRecording" => self.on_start_records(true).await,
            "RecordingNotice" => self.on_recording_notice(payload).await,
            "timeLeftRecording" => self.on_time_left(payload),
            "stoppedRecording" => self.on_stopped_recording(payload),
            "whiteboardAction" => self.on_whiteboard_action(payload).await,
            "whiteboardUpdated" => self.on_whiteboard_updated(payload).await,
            other => {
                tracing::debug!("no handler for {other}");
                None
            }
        };

        match transition {
            Some(t) => {
                self.ctx.emitter.state_changed(t.slices);
                t.effects
            }
            None => Vec::new(),
        }
    }

    async fn on_disconnect(&self) -> Option<Transition> {
        if !self.ctx.is_live().await {
            return None;
        }
        tracing::info!("server disconnected the session");
        self.ctx
            .emitter
            .alert(Alert::danger("You have been disconnected from the session."));
        self.ctx.emitter.emit(SessionEvent::Disconnected);
        Some(Transition::touch(&[StateSlice::Connection]).effect(Effect::ResetSession))
    }

    async fn on_meeting_ended(&self, payload: Value) -> Option<Transition> {
        let p: MeetingEndedPayload = decode("meetingEnded", payload)?;
        if !self.ctx.is_live().await {
            return None;
        }
        let event_type = match p.event_type {
            Some(t) if !t.is_empty() => t,
            _ => self.ctx.room.lock().await.event_type().to_string(),
        };
        if event_type != "chat" {
            self.ctx.emitter.alert(Alert::info(
                "The meeting has ended. Redirecting to the home page...",
            ));
        }
        self.meeting_timer.stop();
        self.ctx.meeting.lock().await.timer_visible = false;

        let mut t = Transition::touch(&[StateSlice::Meeting]).effect(Effect::ResetSession);
        if let Some(url) = p.redirect_url.filter(|u| p.on_web && !u.trim().is_empty()) {
            t = t.effect(Effect::Redirect(url));
        }
        Some(t)
    }

    async fn on_all_members(&self, payload: Value, active_only: bool) -> Option<Transition> {
        let p: MembersPayload = decode("allMembers", payload)?;
        let mut t = Transition::touch(&[
            StateSlice::Roster,
            StateSlice::Requests,
            StateSlice::Waiting,
        ]);

        let mut room = self.ctx.room.lock().await;
        let mut roster = self.ctx.roster.lock().await;
        let mut media = self.ctx.media.lock().await;

        roster.apply_members(
            p.members,
            p.requests,
            p.co_host,
            p.co_host_responsibilities,
            active_only,
        );
        if !p.settings.is_empty() {
            media.apply_settings(&p.settings, false);
            t.slices.push(StateSlice::Media);
        }

        if !room.members_received {
            room.members_received = true;
            t.slices.push(StateSlice::Room);
            if !room.is_local_room() && !room.room_recv_ips.is_empty() {
                t = t.effect(Effect::ConnectDomains(room.room_recv_ips.clone()));
            }
        }

        if media.defer_screen_received && roster.host().is_some() {
            media.defer_screen_received = false;
            media.share_screen_started = true;
            if !t.slices.contains(&StateSlice::Media) {
                t.slices.push(StateSlice::Media);
            }
        }
        Some(t)
    }

    async fn on_user_waiting(&self, payload: Value) -> Option<Transition> {
        let p: NamePayload = decode("userWaiting", payload)?;
        self.ctx
            .emitter
            .alert(Alert::success(format!("{} joined the waiting room.", p.name)));
        self.ctx.roster.lock().await.note_waiting();
        Some(Transition::touch(&[StateSlice::Waiting]))
    }

    fn on_person_joined(&self, payload: Value) -> Option<Transition> {
        let p: NamePayload = decode("personJoined", payload)?;
        self.ctx
            .emitter
            .alert(Alert::success(format!("{} has joined the event.", p.name)));
        Some(Transition::default())
    }

    async fn on_waiting_members(&self, payload: Value) -> Option<Transition> {
        let p: WaitingPayload = decode("allWaitingRoomMembers", payload)?;
        self.ctx.roster.lock().await.set_waiting(p.waiting_participants);
        Some(Transition::touch(&[StateSlice::Waiting]))
    }

    async fn on_participant_requested(&self, payload: Value) -> Option<Transition> {
        let p: RequestedPayload = decode("participantRequested", payload)?;
        self.ctx.roster.lock().await.add_request(p.user_request);
        Some(Transition::touch(&[StateSlice::Requests]))
    }

    async fn on_ban(&self, payload: Value) -> Option<Transition> {
        let p: NamePayload = decode("ban", payload)?;
        self.ctx.roster.lock().await.remove_by_name(&p.name);
        Some(Transition::touch(&[StateSlice::Roster]))
    }

    async fn on_updated_co_host(&self, payload: Value) -> Option<Transition> {
        let p: CoHostPayload = decode("updatedCoHost", payload)?;
        let member = self.ctx.session.read().await.member.clone();
        let mut roster = self.ctx.roster.lock().await;
        let changed = roster.update_co_host(p.co_host, p.co_host_responsibilities);
        if changed && !member.is_empty() && roster.co_host() == member {
            self.ctx.emitter.alert(Alert::success("You are now a co-host."));
        }
        Some(Transition::touch(&[StateSlice::Roster]))
    }

    async fn on_screen_producer(&self, payload: Value) -> Option<Transition> {
        #[derive(Default, Deserialize)]
        #[serde(default, rename_all = "camelCase")]
        struct ScreenPayload {
            producer_id: String,
        }
        let p: ScreenPayload = decode("screenProducerId", payload)?;

        let members_received = self.ctx.room.lock().await.members_received;
        let host_present = self.ctx.roster.lock().await.host().is_some();
        let mut media = self.ctx.media.lock().await;
        media.screen_id = p.producer_id;
        if host_present && members_received {
            media.share_screen_started = true;
            media.defer_screen_received = false;
        } else {
            media.defer_screen_received = true;
        }
        Some(Transition::touch(&[StateSlice::Media]))
    }

    async fn on_media_settings(&self, payload: Value) -> Option<Transition> {
        let p: SettingsPayload = decode("updateMediaSettings", payload)?;
        self.ctx.media.lock().await.apply_settings(&p.settings, true);
        Some(Transition::touch(&[StateSlice::Media]))
    }

    async fn on_producer(
        &self,
        event: &str,
        payload: Value,
        change: ProducerChange,
    ) -> Option<Transition> {
        let p: ProducerPayload = decode(event, payload)?;
        match MediaKind::parse(&p.kind) {
            Some(MediaKind::Audio) => {
                let muted = change != ProducerChange::Resumed;
                self.ctx
                    .roster
                    .lock()
                    .await
                    .update_member(&p.name, &p.producer_id, |m| m.muted = muted);
                Some(Transition::touch(&[StateSlice::Roster]))
            }
            Some(MediaKind::Video) => {
                let on = change == ProducerChange::Resumed;
                self.ctx
                    .roster
                    .lock()
                    .await
                    .update_member(&p.name, &p.producer_id, |m| m.video_on = on);
                Some(Transition::touch(&[StateSlice::Roster]))
            }
            Some(MediaKind::Screenshare) if change == ProducerChange::Closed => {
                self.ctx.media.lock().await.stop_screen_share();
                Some(Transition::touch(&[StateSlice::Media]))
            }
            _ => None,
        }
    }

    async fn on_control_media_host(&self, payload: Value) -> Option<Transition> {
        let p: TypePayload = decode("controlMediaHost", payload)?;
        let kinds = match p.kind.as_str() {
            "all" => vec![MediaKind::Audio, MediaKind::Screenshare, MediaKind::Video],
            other => vec![MediaKind::parse(other)?],
        };

        let mut media = self.ctx.media.lock().await;
        media.admin_restrict_setting = true;
        for kind in &kinds {
            media.set_on(*kind, false);
            if *kind == MediaKind::Screenshare {
                media.stop_screen_share();
            }
        }
        let local: Vec<MediaKind> = kinds.into_iter().filter(|k| *k != MediaKind::Chat).collect();

        let mut t = Transition::touch(&[StateSlice::Media]);
        if !local.is_empty() {
            t = t.effect(Effect::StopLocalMedia(local));
        }
        Some(t)
    }

    async fn on_disconnect_user_self(&self) -> Option<Transition> {
        let session = self.ctx.session().await;
        Some(Transition::default().effect(Effect::Emit {
            event: "disconnectUser",
            payload: json!({
                "member": session.member,
                "roomName": session.room_name,
                "ban": true,
            }),
        }))
    }

    async fn on_receive_message(&self, payload: Value) -> Option<Transition> {
        let p: MessagePayload = decode("receiveMessage", payload)?;
        let session = self.ctx.session().await;
        let event_type = self.ctx.room.lock().await.event_type().to_string();
        let roster = self.ctx.roster.lock().await;
        let raised = {
            let reader = Reader {
                member: &session.member,
                islevel: &session.islevel,
                event_type: &event_type,
            };
            self.ctx.messages.lock().await.receive(p.message, &roster, &reader)
        };
        drop(roster);

        let mut t = Transition::touch(&[StateSlice::Messages]);
        if raised {
            self.ctx.meeting.lock().await.unread_messages = true;
            t.slices.push(StateSlice::Meeting);
        }
        Some(t)
    }

    async fn on_time_remaining(&self, payload: Value) -> Option<Transition> {
        let p: TimeRemainingPayload = decode("meetingTimeRemaining", payload)?;
        if self.ctx.room.lock().await.event_type() == "chat" {
            return Some(Transition::default());
        }
        self.ctx.emitter.alert(Alert::success(format!(
            "The event will end in {} minutes.",
            format_minutes(p.time_remaining)
        )));
        Some(Transition::default())
    }

    async fn on_still_there(&self) -> Option<Transition> {
        self.ctx.meeting.lock().await.confirm_here_visible = true;
        Some(Transition::touch(&[StateSlice::Meeting]))
    }

    async fn on_consuming_domains(&self, payload: Value) -> Option<Transition> {
        let p: DomainsPayload = decode("updateConsumingDomains", payload)?;
        if self.ctx.roster.lock().await.participants().is_empty() {
            return Some(Transition::default());
        }
        let room = self.ctx.room.lock().await;
        let mut fresh: Vec<String> = Vec::new();
        for domain in p.domains {
            let target = p.alt_domains.get(&domain).cloned().unwrap_or(domain);
            if !room.room_recv_ips.contains(&target) && !fresh.contains(&target) {
                fresh.push(target);
            }
        }
        if fresh.is_empty() {
            return Some(Transition::default());
        }
        Some(Transition::default().effect(Effect::ConnectDomains(fresh)))
    }

    async fn on_request_response(&self, payload: Value) -> Option<Transition> {
        let p: RequestResponsePayload = decode("hostRequestResponse", payload)?;
        let response = p.request_response;
        self.ctx.roster.lock().await.remove_request(&response.id);

        let mut t = Transition::touch(&[StateSlice::Requests]);
        let kind = MediaKind::from_request_icon(&response.icon).or_else(|| MediaKind::parse(&response.icon));
        if let Some(kind) = kind {
            let accepted = response.action == "accepted";
            self.ctx
                .media
                .lock()
                .await
                .apply_request_response(kind, accepted, self.clock.now_ms());
            let alert = if accepted {
                Alert::success(format!(
                    "{} request was accepted; click the button again to begin.",
                    kind.label()
                ))
            } else {
                Alert::danger(format!("{} request was not accepted", kind.label()))
            };
            self.ctx.emitter.alert(alert);
            t.slices.push(StateSlice::Media);
        }
        Some(t)
    }

    async fn on_poll_updated(&self, payload: Value) -> Option<Transition> {
        let update: PollUpdate = decode("pollUpdated", payload)?;
        let session = self.ctx.session().await;
        let alert = self
            .ctx
            .polls
            .lock()
            .await
            .apply_update(update, &session.member, &session.islevel);
        if let Some(alert) = alert {
            self.ctx.emitter.alert(alert);
        }
        Some(Transition::touch(&[StateSlice::Polls]))
    }

    async fn on_breakout_updated(&self, payload: Value) -> Option<Transition> {
        let update: BreakoutUpdate = decode("breakoutRoomUpdated", payload)?;
        let islevel = self.ctx.session.read().await.islevel.clone();
        let mut roster = self.ctx.roster.lock().await;
        let mut meeting = self.ctx.meeting.lock().await;
        let slices = self
            .ctx
            .breakout
            .lock()
            .await
            .apply_update(update, &islevel, &mut roster, &mut meeting);
        Some(Transition { slices, effects: Vec::new() })
    }

    async fn on_record_params(&self, payload: Value) -> Option<Transition> {
        let p: RecordParamsPayload = decode("roomRecordParams", payload)?;
        let params = p.record_params?;
        self.recording.apply_params(&params);
        self.ctx.room.lock().await.recording_params = params;
        Some(Transition::touch(&[StateSlice::Room, StateSlice::Recording]))
    }

    async fn on_start_records(&self, reinitiate: bool) -> Option<Transition> {
        if reinitiate && self.ctx.media.lock().await.admin_restrict_setting {
            return None;
        }
        let session = self.ctx.session().await;
        Some(Transition::default().effect(Effect::Emit {
            event: "startRecordIng",
            payload: json!({"roomName": session.room_name, "member": session.member}),
        }))
    }

    async fn on_recording_notice(&self, payload: Value) -> Option<Transition> {
        let notice: RecordingNotice = decode("RecordingNotice", payload)?;
        let is_host = self.ctx.session.read().await.is_host();
        self.recording.apply_notice(&notice, is_host);

        let mut t = Transition::touch(&[StateSlice::Recording]);
        if let Some(params) = notice.user_recording_param.filter(|p| !p.is_null()) {
            self.ctx.room.lock().await.user_recording_params = Some(params);
            t.slices.push(StateSlice::Room);
        }
        Some(t)
    }

    fn on_time_left(&self, payload: Value) -> Option<Transition> {
        let p: TimeLeftPayload = decode("timeLeftRecording", payload)?;
        self.ctx.emitter.alert(Alert::danger(format!(
            "The recording will stop in less than {} seconds.",
            p.time_left
        )));
        Some(Transition::default())
    }

    fn on_stopped_recording(&self, payload: Value) -> Option<Transition> {
        let p: StoppedRecordingPayload = decode("stoppedRecording", payload)?;
        if p.state != "stop" {
            return None;
        }
        self.ctx.emitter.alert(Alert::danger(format!(
            "The recording has stopped - {}.",
            p.reason
        )));
        self.recording.stop(false);
        Some(Transition::touch(&[StateSlice::Recording]))
    }

    async fn on_whiteboard_action(&self, payload: Value) -> Option<Transition> {
        let event: WhiteboardActionEvent = decode("whiteboardAction", payload)?;
        let changed = self
            .ctx
            .whiteboard
            .lock()
            .await
            .apply_action(&event.action, &event.payload);
        changed.then(|| Transition::touch(&[StateSlice::Whiteboard]))
    }

    async fn on_whiteboard_updated(&self, payload: Value) -> Option<Transition> {
        let update: WhiteboardUpdate = decode("whiteboardUpdated", payload)?;
        self.ctx.whiteboard.lock().await.apply_update(update);
        Some(Transition::touch(&[StateSlice::Whiteboard]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerChange {
    Paused,
    Resumed,
    Closed,
}

/// Decode a payload; `null` counts as an empty object.
fn decode<T: DeserializeOwned + Default>(event: &str, payload: Value) -> Option<T> {
    if payload.is_null() {
        return Some(T::default());
    }
    match serde_json::from_value(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("dropping malformed {event} payload: {e}");
            None
        }
    }
}

/// Milliseconds as `M:SS`.
fn format_minutes(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}
