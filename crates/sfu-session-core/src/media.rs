use std::collections::HashMap;

use crate::errors::SessionError;

/// Seconds a rejected participant waits before asking again.
pub const REQUEST_INTERVAL_SECONDS: i64 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Screenshare,
    Chat,
}

impl MediaKind {
    /// Parse the `type`/`kind` strings used by the server.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "screenshare" | "screen" => Some(Self::Screenshare),
            "chat" => Some(Self::Chat),
            _ => None,
        }
    }

    /// Map a request icon (`fa-microphone`, ...) to its media kind.
    pub fn from_request_icon(icon: &str) -> Option<Self> {
        match icon {
            "fa-microphone" => Some(Self::Audio),
            "fa-video" => Some(Self::Video),
            "fa-desktop" => Some(Self::Screenshare),
            "fa-comments" => Some(Self::Chat),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Audio => "Audio",
            Self::Video => "Video",
            Self::Screenshare => "Screen share",
            Self::Chat => "Chat",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screenshare => "screenshare",
            Self::Chat => "chat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Accepted,
    Rejected { next_request_at_ms: i64 },
}

/// Per-kind media settings and local capability flags.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaState {
    settings: HashMap<MediaKind, String>,
    /// Local capability flags (mic on, camera on, ...).
    on: HashMap<MediaKind, bool>,
    /// Host granted the kind after a request.
    allowed: HashMap<MediaKind, bool>,
    request_states: HashMap<MediaKind, RequestState>,
    pub admin_restrict_setting: bool,
    pub screen_id: String,
    pub share_screen_started: bool,
    pub defer_screen_received: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            settings: HashMap::new(),
            on: HashMap::new(),
            allowed: HashMap::new(),
            request_states: HashMap::new(),
            admin_restrict_setting: false,
            screen_id: String::new(),
            share_screen_started: false,
            defer_screen_received: false,
        }
    }
}

const KINDS_IN_SETTINGS_ORDER: [MediaKind; 4] = [
    MediaKind::Audio,
    MediaKind::Video,
    MediaKind::Screenshare,
    MediaKind::Chat,
];

impl MediaState {
    /// Room-level permission for the kind; `allow` when never set.
    pub fn setting(&self, kind: MediaKind) -> &str {
        self.settings.get(&kind).map(String::as_str).unwrap_or("allow")
    }

    /// Apply positional `[audio, video, screenshare, chat]` settings.
    ///
    /// With `default_missing`, kinds absent from the list fall back to
    /// `allow`; otherwise they keep their value.
    pub fn apply_settings(&mut self, settings: &[String], default_missing: bool) {
        for (idx, kind) in KINDS_IN_SETTINGS_ORDER.iter().enumerate() {
            match settings.get(idx) {
                Some(value) => {
                    self.settings.insert(*kind, value.clone());
                }
                None if default_missing => {
                    self.settings.insert(*kind, "allow".to_string());
                }
                None => {}
            }
        }
    }

    pub fn set_setting(&mut self, kind: MediaKind, value: &str) {
        self.settings.insert(kind, value.to_string());
    }

    pub fn is_on(&self, kind: MediaKind) -> bool {
        self.on.get(&kind).copied().unwrap_or(false)
    }

    pub fn set_on(&mut self, kind: MediaKind, on: bool) {
        self.on.insert(kind, on);
    }

    pub fn is_allowed(&self, kind: MediaKind) -> bool {
        self.allowed.get(&kind).copied().unwrap_or(false)
    }

    pub fn request_state(&self, kind: MediaKind) -> Option<&RequestState> {
        self.request_states.get(&kind)
    }

    /// Record the host's answer to a pending request.
    pub fn apply_request_response(&mut self, kind: MediaKind, accepted: bool, now_ms: i64) {
        if accepted {
            self.allowed.insert(kind, true);
            self.request_states.insert(kind, RequestState::Accepted);
        } else {
            self.request_states.insert(
                kind,
                RequestState::Rejected {
                    next_request_at_ms: now_ms + REQUEST_INTERVAL_SECONDS * 1000,
                },
            );
        }
    }

    pub fn stop_screen_share(&mut self) {
        self.screen_id.clear();
        self.share_screen_started = false;
        self.defer_screen_received = false;
        self.on.insert(MediaKind::Screenshare, false);
    }
}

/// Local media capture owned by the WebRTC layer.
///
/// Invoked by host media control and by teardown. Implementations must be
/// cheap and must not block.
pub trait MediaTransport: Send + Sync {
    fn stop_local_audio(&self) -> Result<(), SessionError>;
    fn stop_local_video(&self) -> Result<(), SessionError>;
    fn stop_screen_share(&self) -> Result<(), SessionError>;
}

/// Used when no media layer is attached.
pub struct NoopMediaTransport;

impl MediaTransport for NoopMediaTransport {
    fn stop_local_audio(&self) -> Result<(), SessionError> {
        Ok(())
    }

    fn stop_local_video(&self) -> Result<(), SessionError> {
        Ok(())
    }

    fn stop_screen_share(&self) -> Result<(), SessionError> {
        Ok(())
    }
}
