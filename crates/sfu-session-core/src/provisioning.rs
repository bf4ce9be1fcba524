use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::SECRET_LENGTH;
use crate::errors::SessionError;
use crate::transport::CLOUD_BASE_URL;

/// `Authorization: Bearer {user}:{key}` credentials for the REST API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiAuth {
    pub api_user_name: String,
    pub api_key: String,
}

impl ApiAuth {
    fn bearer(&self) -> String {
        format!("Bearer {}:{}", self.api_user_name, self.api_key)
    }
}

/// Body of a REST join.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub action: String,
    #[serde(rename = "meetingID")]
    pub meeting_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_passcode: Option<String>,
    pub islevel: String,
}

impl JoinRoomPayload {
    pub fn new(meeting_id: &str, user_name: &str) -> Self {
        Self {
            action: "join".to_string(),
            meeting_id: meeting_id.to_string(),
            user_name: user_name.to_string(),
            admin_passcode: None,
            islevel: "0".to_string(),
        }
    }
}

/// Body of a REST room creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomPayload {
    pub action: String,
    /// Minutes.
    pub duration: u32,
    pub capacity: u32,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure_code: Option<String>,
    pub record_only: bool,
    pub safe_room: bool,
    pub auto_start_safe_room: bool,
    pub safe_room_action: String,
    pub data_buffer: bool,
    pub buffer_type: String,
}

impl CreateRoomPayload {
    pub fn new(user_name: &str, duration: u32, capacity: u32) -> Self {
        Self {
            action: "create".to_string(),
            duration,
            capacity,
            user_name: user_name.to_string(),
            event_type: None,
            scheduled_date: None,
            secure_code: None,
            record_only: false,
            safe_room: false,
            auto_start_safe_room: false,
            safe_room_action: "kick".to_string(),
            data_buffer: false,
            buffer_type: "all".to_string(),
        }
    }
}

/// A room the REST API created or admitted us to.
///
/// `secret` is the socket token and `room_name` doubles as its user name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomGrant {
    pub message: String,
    pub room_name: String,
    pub secure_code: Option<String>,
    #[serde(rename = "publicURL")]
    pub public_url: String,
    pub link: String,
    pub secret: String,
    pub success: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProvisioningError {
    error: String,
}

/// REST control plane that creates and admits rooms.
#[async_trait]
pub trait RoomProvisioningService: Send + Sync {
    async fn create_room(
        &self,
        payload: &CreateRoomPayload,
        auth: &ApiAuth,
    ) -> Result<RoomGrant, SessionError>;

    async fn join_room(
        &self,
        payload: &JoinRoomPayload,
        auth: &ApiAuth,
    ) -> Result<RoomGrant, SessionError>;
}

/// reqwest-backed provisioning against the cloud or a self-hosted server.
pub struct HttpProvisioning {
    client: reqwest::Client,
    local_link: Option<String>,
}

impl HttpProvisioning {
    pub fn new(local_link: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            local_link: local_link.filter(|l| !l.trim().is_empty()),
        }
    }

    fn endpoint(&self, local_path: &str) -> String {
        match &self.local_link {
            Some(link) => format!("{}/{local_path}", link.trim().trim_end_matches('/')),
            None => format!("{CLOUD_BASE_URL}/v1/rooms/"),
        }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        endpoint: &str,
        body: &B,
        auth: &ApiAuth,
    ) -> Result<RoomGrant, SessionError> {
        tracing::info!("provisioning request to {endpoint}");
        let resp = self
            .client
            .post(endpoint)
            .header(reqwest::header::AUTHORIZATION, auth.bearer())
            .json(body)
            .send()
            .await
            .map_err(|e| SessionError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SessionError::Http(e.to_string()))?;
        if !status.is_success() {
            tracing::warn!("provisioning returned status {status}");
            return Err(SessionError::JoinRejected(error_message(&text)));
        }
        parse_grant(&text)
    }
}

#[async_trait]
impl RoomProvisioningService for HttpProvisioning {
    async fn create_room(
        &self,
        payload: &CreateRoomPayload,
        auth: &ApiAuth,
    ) -> Result<RoomGrant, SessionError> {
        validate_auth(auth)?;
        if payload.user_name.trim().is_empty() {
            return Err(SessionError::Config("User name cannot be empty".to_string()));
        }
        if payload.duration == 0 || payload.capacity == 0 {
            return Err(SessionError::Config(
                "Duration and capacity must be positive".to_string(),
            ));
        }
        self.post(&self.endpoint("createRoom"), payload, auth).await
    }

    async fn join_room(
        &self,
        payload: &JoinRoomPayload,
        auth: &ApiAuth,
    ) -> Result<RoomGrant, SessionError> {
        validate_join(payload, auth)?;
        self.post(&self.endpoint("joinRoom"), payload, auth).await
    }
}

fn validate_auth(auth: &ApiAuth) -> Result<(), SessionError> {
    if auth.api_key.len() != SECRET_LENGTH {
        return Err(SessionError::Config(
            "API key must be exactly 64 characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_join(payload: &JoinRoomPayload, auth: &ApiAuth) -> Result<(), SessionError> {
    validate_auth(auth)?;
    if payload.meeting_id.trim().is_empty() {
        return Err(SessionError::Config("Meeting ID cannot be empty".to_string()));
    }
    if payload.user_name.trim().is_empty() {
        return Err(SessionError::Config("User name cannot be empty".to_string()));
    }
    Ok(())
}

/// A 2xx body is either a grant or an `{error}` object.
fn parse_grant(body: &str) -> Result<RoomGrant, SessionError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|_| SessionError::Http("Unable to parse room response".to_string()))?;
    if value.get("roomName").is_none() {
        return Err(SessionError::JoinRejected(error_message(body)));
    }
    let grant: RoomGrant = serde_json::from_value(value)?;
    if grant.secret.is_empty() || grant.link.is_empty() {
        return Err(SessionError::JoinRejected(
            if grant.message.is_empty() { "Room response is incomplete".to_string() } else { grant.message },
        ));
    }
    Ok(grant)
}

fn error_message(body: &str) -> String {
    if body.trim().is_empty() {
        return "Unknown error".to_string();
    }
    match serde_json::from_str::<ProvisioningError>(body) {
        Ok(e) if !e.error.is_empty() => e.error,
        _ => body.to_string(),
    }
}
