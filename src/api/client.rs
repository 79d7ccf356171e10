//! Authenticated HTTP client for Teams APIs
//!
//! Built from the token files written by the auth layer. Errors are typed so
//! the refresh coordinator can tell an expired session from any other failure.

use std::path::PathBuf;

use thiserror::Error;

use crate::auth::{ClientFactory, NeedsAuth, TokenInfo, TokenStore, PRIMARY_TOKEN_NAME};
use crate::models::ConversationResponse;

/// Default base URL for the chat service aggregator.
pub const CSA_BASE: &str = "https://teams.microsoft.com";

const CLIENT_VERSION: &str = "1416/1.0.0.2024050301";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("401 Unauthorized for {url}")]
    Unauthorized { url: String },

    #[error("no {name} token at {}", .path.display())]
    MissingToken { name: String, path: PathBuf },

    #[error("{name} token expired")]
    ExpiredToken { name: String },

    #[error("HTTP {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read token: {0}")]
    Io(#[from] std::io::Error),
}

impl NeedsAuth for ApiError {
    fn needs_auth(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized { .. } | ApiError::MissingToken { .. } | ApiError::ExpiredToken { .. }
        )
    }
}

/// Bearer tokens for the Teams backends.
#[derive(Debug, Clone)]
struct Tokens {
    skype: String,
    chatsvcagg: String,
}

pub struct TeamsClient {
    http: reqwest::Client,
    tokens: Tokens,
    csa_base: String,
}

impl TeamsClient {
    /// Read the persisted tokens. Missing or expired tokens mean a refresh is due.
    pub fn from_store(store: &TokenStore) -> Result<Self, ApiError> {
        let read = |name: &str| -> Result<String, ApiError> {
            let token = store.read(name)?.ok_or_else(|| ApiError::MissingToken {
                name: name.to_string(),
                path: store.path(name),
            })?;
            if TokenInfo::inspect(&token).is_some_and(|info| info.is_expired()) {
                return Err(ApiError::ExpiredToken {
                    name: name.to_string(),
                });
            }
            Ok(token)
        };

        // The identity token is not sent, but a session without it is stale
        read(PRIMARY_TOKEN_NAME)?;

        Ok(Self {
            http: reqwest::Client::new(),
            tokens: Tokens {
                skype: read("skype")?,
                chatsvcagg: read("chatsvcagg")?,
            },
            csa_base: CSA_BASE.to_string(),
        })
    }

    pub fn with_csa_base(mut self, base: impl Into<String>) -> Self {
        self.csa_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// GET using `Authorization: Bearer {chatsvcagg token}` plus the skype token
    /// and client version headers.
    pub async fn csa_get(&self, url: &str) -> Result<reqwest::Response, ApiError> {
        tracing::debug!("CSA GET {}", url);

        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.tokens.chatsvcagg)
            .header("X-SkypeToken", &self.tokens.skype)
            .header("x-ms-client-version", CLIENT_VERSION)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.to_string(),
                source,
            })?;

        check_response(resp, url).await
    }

    /// Teams, channels and chats for the signed-in user.
    pub async fn conversations(&self) -> Result<ConversationResponse, ApiError> {
        let url = format!(
            "{}/api/csa/api/v1/teams/users/me?isPrefetch=false&enableMembershipSummary=true",
            self.csa_base
        );
        let mut conversations: ConversationResponse = self
            .csa_get(&url)
            .await?
            .json()
            .await
            .map_err(|source| ApiError::Decode {
                url: url.clone(),
                source,
            })?;
        conversations.sort_teams();

        tracing::debug!(
            "Loaded {} teams and {} chats",
            conversations.teams.len(),
            conversations.chats.len()
        );
        Ok(conversations)
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized {
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }
    Ok(resp)
}

/// Rebuilds a [`TeamsClient`] from the token store after every refresh.
pub struct TeamsClientFactory {
    store: TokenStore,
    csa_base: String,
}

impl TeamsClientFactory {
    pub fn new(store: TokenStore) -> Self {
        Self {
            store,
            csa_base: CSA_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_csa_base(mut self, base: impl Into<String>) -> Self {
        self.csa_base = base.into();
        self
    }
}

impl ClientFactory for TeamsClientFactory {
    type Client = TeamsClient;
    type Error = ApiError;

    fn build(&self) -> Result<TeamsClient, ApiError> {
        Ok(TeamsClient::from_store(&self.store)?.with_csa_base(self.csa_base.clone()))
    }
}
