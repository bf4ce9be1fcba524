use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default participants per breakout room / grid page.
pub const DEFAULT_ITEM_PAGE_LIMIT: usize = 4;

/// Room-level configuration delivered with the join response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeetingRoomParams {
    pub item_page_limit: usize,
    pub media_type: String,
    pub add_co_host: bool,
    pub target_orientation: String,
    pub target_resolution: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub audio_setting: String,
    pub video_setting: String,
    pub screenshare_setting: String,
    pub chat_setting: String,
}

/// Recording limits negotiated for the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecordingParams {
    pub recording_audio_pauses_limit: u32,
    pub recording_audio_pauses_count: u32,
    pub recording_audio_support: bool,
    pub recording_audio_people_limit: u32,
    pub recording_video_pauses_limit: u32,
    pub recording_video_pauses_count: u32,
    pub recording_video_support: bool,
    pub recording_video_people_limit: u32,
    pub recording_preferred_orientation: String,
    pub recording_multi_formats_support: bool,
    pub recording_hls_support: bool,
}

impl Default for RecordingParams {
    fn default() -> Self {
        Self {
            recording_audio_pauses_limit: 0,
            recording_audio_pauses_count: 0,
            recording_audio_support: false,
            recording_audio_people_limit: 0,
            recording_video_pauses_limit: 0,
            recording_video_pauses_count: 0,
            recording_video_support: false,
            recording_video_people_limit: 0,
            recording_preferred_orientation: "landscape".to_string(),
            recording_multi_formats_support: false,
            recording_hls_support: false,
        }
    }
}

/// Unified join acknowledgement for cloud and local rooms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponseJoinRoom {
    pub rtp_capabilities: Option<Value>,
    pub success: Option<bool>,
    #[serde(rename = "roomRecvIPs")]
    pub room_recv_ips: Vec<String>,
    pub meeting_room_params: Option<MeetingRoomParams>,
    pub recording_params: Option<RecordingParams>,
    pub secure_code: Option<String>,
    pub record_only: bool,
    pub is_host: bool,
    pub safe_room: bool,
    pub api_user_name: Option<String>,
    pub api_key: Option<String>,
    pub allow_record: bool,
    pub reason: Option<String>,
    pub banned: bool,
    pub suspended: bool,
    pub no_admin: bool,
}

impl ResponseJoinRoom {
    pub fn is_success(&self) -> bool {
        self.rtp_capabilities.is_some() && self.success != Some(false)
    }

    /// User-facing rejection reason, in priority order: explicit server
    /// reason, banned, suspended, host absent, generic.
    pub fn failure_reason(&self) -> String {
        if let Some(reason) = self.reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            return reason.to_string();
        }
        if self.banned {
            "User is banned.".to_string()
        } else if self.suspended {
            "User is suspended.".to_string()
        } else if self.no_admin {
            "Host has not joined the room yet.".to_string()
        } else {
            "Failed to join room".to_string()
        }
    }
}

/// Acknowledgement of a join against a self-hosted server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalJoinResponse {
    pub rtp_capabilities: Option<Value>,
    pub success: Option<bool>,
    pub reason: Option<String>,
    pub is_host: bool,
    pub is_banned: bool,
    pub host_not_joined: bool,
    pub event_room_params: Option<MeetingRoomParams>,
    pub recording_params: Option<RecordingParams>,
    pub secure_code: Option<String>,
    pub api_user_name: Option<String>,
    pub api_key: Option<String>,
    pub allow_record: bool,
}

/// Map a local join acknowledgement onto the unified response.
///
/// Local rooms have no separate receive servers, so `room_recv_ips` is
/// always `["none"]`.
pub fn create_response_join_room(local: LocalJoinResponse) -> ResponseJoinRoom {
    let explicit = local
        .reason
        .filter(|r| !r.trim().is_empty());
    let reason = explicit.or_else(|| {
        if local.is_banned {
            Some("User is banned from the room.".to_string())
        } else if local.host_not_joined {
            Some("Host has not joined the room yet.".to_string())
        } else {
            None
        }
    });
    let success = local.rtp_capabilities.is_some() && local.success != Some(false);

    ResponseJoinRoom {
        rtp_capabilities: local.rtp_capabilities,
        success: Some(success),
        room_recv_ips: vec!["none".to_string()],
        meeting_room_params: local.event_room_params,
        recording_params: local.recording_params,
        secure_code: local.secure_code,
        record_only: false,
        is_host: local.is_host,
        safe_room: false,
        api_user_name: local.api_user_name,
        api_key: local.api_key,
        allow_record: local.allow_record,
        reason,
        banned: local.is_banned,
        suspended: false,
        no_admin: local.host_not_joined,
    }
}

/// Room data persisted after a successful join.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomData {
    pub response: Option<ResponseJoinRoom>,
    pub room_recv_ips: Vec<String>,
    pub members_received: bool,
    pub meeting_params: MeetingRoomParams,
    pub recording_params: RecordingParams,
    pub is_host: bool,
    pub record_only: bool,
    pub secure_code: String,
    /// Recording layout chosen by the host, echoed back on record commands.
    pub user_recording_params: Option<Value>,
}

impl RoomData {
    pub fn apply_response(&mut self, response: &ResponseJoinRoom) {
        self.room_recv_ips = response.room_recv_ips.clone();
        if let Some(params) = &response.meeting_room_params {
            self.meeting_params = params.clone();
        }
        if let Some(params) = &response.recording_params {
            self.recording_params = params.clone();
        }
        self.is_host = response.is_host;
        self.record_only = response.record_only;
        self.secure_code = response.secure_code.clone().unwrap_or_default();
        self.response = Some(response.clone());
    }

    /// Rooms served by a self-hosted server report `["none"]`.
    pub fn is_local_room(&self) -> bool {
        self.room_recv_ips.len() == 1 && self.room_recv_ips[0] == "none"
    }

    pub fn item_page_limit(&self) -> usize {
        if self.meeting_params.item_page_limit == 0 {
            DEFAULT_ITEM_PAGE_LIMIT
        } else {
            self.meeting_params.item_page_limit
        }
    }

    pub fn event_type(&self) -> &str {
        &self.meeting_params.event_type
    }
}
