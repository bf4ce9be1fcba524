use crate::config::SessionConfig;
use crate::state::SessionState;

/// Length of a canonical cloud secret (API token or API key).
pub const SECRET_LENGTH: usize = 64;

/// Explicitly supplied values. Blank fields fall through to lower layers.
#[derive(Debug, Clone, Default)]
pub struct ExplicitCredentials {
    pub api_user_name: String,
    pub api_token: String,
    pub api_key: String,
    pub link: String,
}

/// Effective credentials after layering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub api_user_name: String,
    pub api_token: String,
    pub api_key: String,
    pub link: String,
}

impl ResolvedCredentials {
    /// Blank token and key means there is nothing to authenticate with.
    pub fn is_ready(&self) -> bool {
        !self.api_token.trim().is_empty() || !self.api_key.trim().is_empty()
    }

    /// The secret used on the wire: a 64-char token, then a 64-char key,
    /// then whatever non-blank value is present.
    pub fn secret(&self) -> Option<&str> {
        let token = self.api_token.trim();
        let key = self.api_key.trim();
        [token, key]
            .into_iter()
            .find(|s| s.len() == SECRET_LENGTH)
            .or_else(|| [token, key].into_iter().find(|s| !s.is_empty()))
    }

    /// Whether the secret is a full-length token (sent as `apiToken`).
    pub fn secret_is_token(&self) -> bool {
        self.api_token.trim().len() == SECRET_LENGTH
    }
}

/// Layers explicit arguments over stored session state over configuration.
pub struct CredentialResolver;

impl CredentialResolver {
    pub fn resolve(
        explicit: &ExplicitCredentials,
        session: &SessionState,
        config: &SessionConfig,
    ) -> ResolvedCredentials {
        let config_link = config.local_link().unwrap_or_default();
        ResolvedCredentials {
            api_user_name: first_non_blank(&[
                &explicit.api_user_name,
                &session.api_user_name,
                &config.api_user_name,
            ]),
            api_token: first_non_blank(&[&explicit.api_token, &session.api_token]),
            api_key: first_non_blank(&[&explicit.api_key, &config.api_key]),
            link: first_non_blank(&[&explicit.link, &session.link, config_link]),
        }
    }
}

fn first_non_blank(layers: &[&str]) -> String {
    layers
        .iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}
