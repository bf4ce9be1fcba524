use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Identifies "the same logical connection target".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketSignature {
    pub base_url: String,
    pub api_user_name: String,
    /// Hash of the secret; the secret itself is never kept here.
    pub credential_fingerprint: String,
}

impl SocketSignature {
    pub fn new(base_url: &str, api_user_name: &str, secret: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_lowercase(),
            api_user_name: api_user_name.trim().to_string(),
            credential_fingerprint: fingerprint(secret.trim()),
        }
    }
}

fn fingerprint(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let mut hasher = DefaultHasher::new();
    secret.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Identifies "the same logical join attempt".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinSignature {
    pub room_name: String,
    pub member: String,
    pub islevel: String,
    pub admin_passcode: String,
    pub socket: Option<SocketSignature>,
}

impl JoinSignature {
    pub fn new(
        room_name: &str,
        member: &str,
        islevel: &str,
        admin_passcode: &str,
        socket: Option<SocketSignature>,
    ) -> Self {
        Self {
            room_name: room_name.trim().to_string(),
            member: member.trim().to_string(),
            islevel: islevel.trim().to_string(),
            admin_passcode: admin_passcode.trim().to_string(),
            socket,
        }
    }
}
