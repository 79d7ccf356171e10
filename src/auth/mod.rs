//! Authentication module for Microsoft Teams
//!
//! Obtains and renews the bearer tokens the Teams client needs. The primary
//! path is the OAuth2 device code flow against Azure AD, followed by
//! resource-scoped token refreshes. When that path is disabled or fails, an
//! external `teams-token` helper performs an interactive login instead.

pub mod coordinator;
pub mod device_code;
pub mod error;
pub mod fallback;
pub mod resource;
pub mod tokens;

use std::time::Duration;

pub use coordinator::{
    ClientFactory, NeedsAuth, RefreshError, RefreshObserver, RefreshStatus,
    SessionRefreshCoordinator,
};
pub use error::AuthError;
pub use tokens::{TokenInfo, TokenStore};

/// Azure AD authority used when no override is configured.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Public client id of the Teams web client.
pub const TEAMS_CLIENT_ID: &str = "5e3ce6c0-2b1f-4285-8d4b-75ee78787346";

/// Scope requested by the device code flow.
pub const DEVICE_CODE_SCOPE: &str = "openid profile offline_access";

/// Logical name of the primary (identity) token file.
pub const PRIMARY_TOKEN_NAME: &str = "teams";

/// A downstream service that needs its own audience-scoped access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Short logical name, also the token file name
    pub label: String,
    /// Resource URI; the requested scope is `<uri>/.default`
    pub uri: String,
}

impl Resource {
    pub fn new(label: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            uri: uri.into(),
        }
    }

    pub fn scope(&self) -> String {
        format!("{}/.default", self.uri.trim_end_matches('/'))
    }

    /// Real-time messaging (Skype) and chat aggregation services.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("skype", "https://api.spaces.skype.com"),
            Self::new("chatsvcagg", "https://chatsvcagg.teams.microsoft.com"),
        ]
    }
}

/// Fully resolved configuration for a credential refresh.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth2 client ID (public client)
    pub client_id: String,
    /// Identity provider base URL, without tenant
    pub authority: String,
    /// Azure AD tenant (common for multi-tenant)
    pub tenant: String,
    /// Scope requested with the device code
    pub scope: String,
    /// Resources refreshed after the primary exchange
    pub resources: Vec<Resource>,
    /// Skip the device code flow entirely
    pub disable_device_code: bool,
    /// Never wrap the helper in the embedded terminal display
    pub disable_embedded_display: bool,
    /// Run Electron natively on Wayland instead of through Xwayland
    pub native_wayland: bool,
    /// Hard deadline for the whole device code path
    pub device_code_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: TEAMS_CLIENT_ID.to_string(),
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant: "common".to_string(),
            scope: DEVICE_CODE_SCOPE.to_string(),
            resources: Resource::defaults(),
            disable_device_code: false,
            disable_embedded_display: false,
            native_wayland: false,
            device_code_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl AuthConfig {
    /// `{authority}/{tenant}/oauth2/v2.0/{endpoint}`, with the tenant path-escaped.
    pub fn endpoint(&self, tenant: &str, endpoint: &str) -> Result<url::Url, AuthError> {
        let mut url = url::Url::parse(&self.authority)
            .map_err(|e| AuthError::protocol(format!("invalid authority {}: {}", self.authority, e)))?;
        url.path_segments_mut()
            .map_err(|_| AuthError::protocol(format!("authority {} cannot be a base", self.authority)))?
            .pop_if_empty()
            .extend([tenant, "oauth2", "v2.0", endpoint]);
        Ok(url)
    }
}
