use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tokio::time::Instant;

use crate::config::{ConfigStore, Timings};
use crate::credentials::{CredentialResolver, ExplicitCredentials, ResolvedCredentials, SECRET_LENGTH};
use crate::errors::SessionError;
use crate::events::{Alert, StateSlice};
use crate::meeting_timer::MeetingTimer;
use crate::recording::RecordingTimer;
use crate::room::{create_response_join_room, LocalJoinResponse, ResponseJoinRoom};
use crate::signature::{JoinSignature, SocketSignature};
use crate::single_flight::{Flight, SingleFlight};
use crate::socket::{LoadingIndicator, SocketAcquisition, SocketKind, SocketRequest};
use crate::state::SessionContext;
use crate::transport::{normalize_base_url, SocketTransport, CLOUD_BASE_URL};

pub const JOIN_ATTEMPTS_PER_WINDOW: usize = 5;
pub const JOIN_WINDOW: Duration = Duration::from_secs(60);
pub const RATE_LIMIT_MESSAGE: &str = "Too many join attempts. Please wait and try again.";

fn alphanumeric() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("static regex"))
}

/// 32-char admin passcode that identifies a self-hosted room.
fn local_passcode() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9]{32}$").expect("static regex"))
}

/// Inputs of a connect-and-validate call.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub room_name: String,
    pub member: String,
    pub admin_passcode: String,
    pub islevel: String,
    pub api_user_name: String,
    pub api_token: String,
    /// Optional server link override.
    pub link: String,
    /// Interactive join: loader, two connect rounds, surfaced errors.
    pub show_loading_modal: bool,
}

impl JoinRequest {
    fn trimmed(&self) -> Self {
        Self {
            room_name: self.room_name.trim().to_string(),
            member: self.member.trim().to_string(),
            admin_passcode: self.admin_passcode.trim().to_string(),
            islevel: self.islevel.trim().to_string(),
            api_user_name: self.api_user_name.trim().to_string(),
            api_token: self.api_token.trim().to_string(),
            link: self.link.trim().to_string(),
            show_loading_modal: self.show_loading_modal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// An identical join was already in flight; this call did nothing.
    Deduplicated,
    Failed(String),
}

impl JoinOutcome {
    pub fn is_joined(&self) -> bool {
        matches!(self, JoinOutcome::Joined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPath {
    Local,
    Cloud,
}

fn is_cloud_link(link: &str) -> bool {
    link.to_ascii_lowercase().contains("mediasfu.com")
}

/// Pick the join path, in priority order: a non-cloud link, a live local
/// socket, a 32-char alphanumeric passcode, else the cloud.
pub fn choose_path(link: &str, has_live_local: bool, admin_passcode: &str) -> JoinPath {
    if !link.is_empty() && !is_cloud_link(link) {
        JoinPath::Local
    } else if has_live_local || local_passcode().is_match(admin_passcode) {
        JoinPath::Local
    } else {
        JoinPath::Cloud
    }
}

/// Field checks the cloud applies to `joinRoom`.
pub fn validate_cloud_join(
    room_name: &str,
    islevel: &str,
    member: &str,
    sec: &str,
    api_user_name: &str,
) -> Result<(), SessionError> {
    if [sec, room_name, islevel, api_user_name, member].iter().any(|f| f.is_empty()) {
        return Err(SessionError::Config("Missing required parameters".to_string()));
    }
    for (value, field) in [(room_name, "roomName"), (api_user_name, "apiUserName"), (member, "member")] {
        if !alphanumeric().is_match(value) {
            return Err(SessionError::Config(format!(
                "Invalid {field}. It should be alphanumeric (underscore allowed)."
            )));
        }
    }
    if !(room_name.starts_with('s') || room_name.starts_with('p')) {
        return Err(SessionError::Config(
            "Invalid roomName, must start with 's' or 'p'".to_string(),
        ));
    }
    let well_formed = sec.len() == SECRET_LENGTH
        && room_name.len() >= 8
        && matches!(islevel, "0" | "1" | "2")
        && api_user_name.len() >= 6;
    if !well_formed {
        return Err(SessionError::Config(
            "Invalid roomName, islevel, apiUserName, or secret format".to_string(),
        ));
    }
    Ok(())
}

/// Sliding-window limit on join attempts per API user.
#[derive(Default)]
pub struct JoinRateLimiter {
    attempts: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl JoinRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt, refusing it when the window is full.
    pub fn check(&self, api_user_name: &str) -> Result<(), SessionError> {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let window = attempts.entry(api_user_name.to_string()).or_default();
        while window.front().is_some_and(|t| now.duration_since(*t) >= JOIN_WINDOW) {
            window.pop_front();
        }
        if window.len() >= JOIN_ATTEMPTS_PER_WINDOW {
            tracing::warn!("join rate limit hit for {api_user_name}");
            return Err(SessionError::JoinRejected(RATE_LIMIT_MESSAGE.to_string()));
        }
        window.push_back(now);
        Ok(())
    }
}

/// Joins a room over the media socket and flips the session to validated.
pub struct JoinProtocol {
    ctx: SessionContext,
    config: Arc<ConfigStore>,
    sockets: Arc<SocketAcquisition>,
    loader: LoadingIndicator,
    recording: Arc<RecordingTimer>,
    meeting_timer: Arc<MeetingTimer>,
    timings: Timings,
    limiter: JoinRateLimiter,
    flights: SingleFlight<JoinSignature, JoinOutcome>,
}

impl JoinProtocol {
    pub fn new(
        ctx: SessionContext,
        config: Arc<ConfigStore>,
        sockets: Arc<SocketAcquisition>,
        loader: LoadingIndicator,
        recording: Arc<RecordingTimer>,
        meeting_timer: Arc<MeetingTimer>,
        timings: Timings,
    ) -> Self {
        Self {
            ctx,
            config,
            sockets,
            loader,
            recording,
            meeting_timer,
            timings,
            limiter: JoinRateLimiter::new(),
            flights: SingleFlight::dropping(),
        }
    }

    /// Connect (if needed) and join. Never fails: errors are alerted and
    /// reported as [`JoinOutcome::Failed`].
    pub async fn connect_and_validate(&self, request: JoinRequest) -> JoinOutcome {
        let request = request.trimmed();
        let session = self.ctx.session().await;
        let credentials = CredentialResolver::resolve(
            &ExplicitCredentials {
                api_user_name: request.api_user_name.clone(),
                api_token: request.api_token.clone(),
                api_key: String::new(),
                link: request.link.clone(),
            },
            &session,
            &self.config.get(),
        );
        let path = choose_path(&credentials.link, self.sockets.has_live_local(), &request.admin_passcode);
        let link = match path {
            JoinPath::Local => credentials.link.clone(),
            JoinPath::Cloud if is_cloud_link(&credentials.link) => credentials.link.clone(),
            JoinPath::Cloud => CLOUD_BASE_URL.to_string(),
        };

        let socket_signature = normalize_base_url(&link).ok().map(|base| {
            SocketSignature::new(&base, &credentials.api_user_name, credentials.secret().unwrap_or_default())
        });
        let signature = JoinSignature::new(
            &request.room_name,
            &request.member,
            &request.islevel,
            &request.admin_passcode,
            socket_signature,
        );

        let flight = self
            .flights
            .run(signature, || self.join(&request, credentials, link, path))
            .await;
        match flight {
            Flight::Led(outcome) | Flight::Shared(outcome) => outcome,
            Flight::Dropped => {
                tracing::debug!("identical join already in flight for {}", request.room_name);
                JoinOutcome::Deduplicated
            }
        }
    }

    async fn join(
        &self,
        request: &JoinRequest,
        credentials: ResolvedCredentials,
        link: String,
        path: JoinPath,
    ) -> JoinOutcome {
        let _loader = request.show_loading_modal.then(|| self.loader.show());
        match self.try_join(request, credentials, link, path).await {
            Ok(()) => JoinOutcome::Joined,
            Err(e) => {
                let reason = e.user_message();
                tracing::error!("join of {} failed: {e}", request.room_name);
                self.ctx.emitter.alert(Alert::danger(reason.clone()));
                JoinOutcome::Failed(reason)
            }
        }
    }

    async fn try_join(
        &self,
        request: &JoinRequest,
        credentials: ResolvedCredentials,
        link: String,
        path: JoinPath,
    ) -> Result<(), SessionError> {
        if request.room_name.is_empty() {
            return Err(SessionError::Config("Missing required parameters".to_string()));
        }
        if link.is_empty() {
            return Err(SessionError::Config("No server link is configured.".to_string()));
        }
        let cloud_secret = match path {
            JoinPath::Cloud => Some(
                credentials
                    .secret()
                    .map(str::to_string)
                    .ok_or_else(|| SessionError::Config("Missing API credentials.".to_string()))?,
            ),
            JoinPath::Local => None,
        };
        self.limiter.check(&credentials.api_user_name)?;

        self.persist_candidate(request, &credentials, &link).await;

        let socket = self
            .sockets
            .ensure_ready(&SocketRequest {
                link,
                credentials: credentials.clone(),
                member: request.member.clone(),
                kind: match path {
                    JoinPath::Local => SocketKind::Local,
                    JoinPath::Cloud => SocketKind::Cloud,
                },
                silent: !request.show_loading_modal,
            })
            .await?;

        let response = match cloud_secret {
            None => self.join_local(socket.as_ref(), request, &credentials).await?,
            Some(secret) => {
                validate_cloud_join(
                    &request.room_name,
                    &request.islevel,
                    &request.member,
                    &secret,
                    &credentials.api_user_name,
                )?;
                self.join_cloud(socket.as_ref(), request, &credentials, &secret).await?
            }
        };

        if !response.is_success() {
            return Err(SessionError::JoinRejected(response.failure_reason()));
        }
        self.apply_room(&response).await;
        self.ctx.set_validated(true).await;
        self.meeting_timer.start();
        tracing::info!("joined room {}", request.room_name);
        self.ctx
            .emitter
            .alert(Alert::success(format!("You have joined {}.", request.room_name)));
        Ok(())
    }

    /// Store the candidate room identity before the network round trip.
    async fn persist_candidate(
        &self,
        request: &JoinRequest,
        credentials: &ResolvedCredentials,
        link: &str,
    ) {
        {
            let mut session = self.ctx.session.write().await;
            session.room_name = request.room_name.clone();
            session.member = request.member.clone();
            session.islevel = request.islevel.clone();
            session.admin_passcode = request.admin_passcode.clone();
            session.api_user_name = credentials.api_user_name.clone();
            session.api_token = credentials.api_token.clone();
            session.link = link.to_string();
        }
        self.ctx.emitter.state_changed(vec![StateSlice::Session]);
    }

    async fn join_local(
        &self,
        socket: &dyn SocketTransport,
        request: &JoinRequest,
        credentials: &ResolvedCredentials,
    ) -> Result<ResponseJoinRoom, SessionError> {
        let payload = json!({
            "roomName": request.room_name,
            "islevel": request.islevel,
            "member": request.member,
            "sec": request.admin_passcode,
            "apiUserName": credentials.api_user_name,
        });
        let ack = socket
            .emit_with_ack("joinRoom", payload, self.timings.ack_timeout())
            .await?;
        let local: LocalJoinResponse = serde_json::from_value(ack)?;
        Ok(create_response_join_room(local))
    }

    async fn join_cloud(
        &self,
        socket: &dyn SocketTransport,
        request: &JoinRequest,
        credentials: &ResolvedCredentials,
        secret: &str,
    ) -> Result<ResponseJoinRoom, SessionError> {
        let payload = json!({
            "roomName": request.room_name,
            "islevel": request.islevel,
            "member": request.member,
            "sec": secret,
            "apiUserName": credentials.api_user_name,
        });
        let ack = socket
            .emit_with_ack("joinRoom", payload, self.timings.ack_timeout())
            .await?;
        Ok(serde_json::from_value(ack)?)
    }

    /// Copy room parameters into the session slices.
    async fn apply_room(&self, response: &ResponseJoinRoom) {
        let params = {
            let mut room = self.ctx.room.lock().await;
            room.apply_response(response);
            room.meeting_params.clone()
        };
        if let Some(recording) = &response.recording_params {
            self.recording.apply_params(recording);
        }
        if !params.media_type.is_empty() {
            self.recording.set_media_option(&params.media_type);
        }
        {
            let settings: Vec<String> = [
                &params.audio_setting,
                &params.video_setting,
                &params.screenshare_setting,
                &params.chat_setting,
            ]
            .into_iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
            if settings.len() == 4 {
                self.ctx.media.lock().await.apply_settings(&settings, true);
            }
        }
        {
            let mut meeting = self.ctx.meeting.lock().await;
            meeting.timer_visible = true;
        }
        if let Some(code) = response.secure_code.as_deref().filter(|c| !c.is_empty()) {
            if response.is_host {
                self.ctx.session.write().await.admin_passcode = code.to_string();
            }
        }
        self.ctx.emitter.state_changed(vec![
            StateSlice::Room,
            StateSlice::Media,
            StateSlice::Recording,
            StateSlice::Meeting,
        ]);
    }
}
