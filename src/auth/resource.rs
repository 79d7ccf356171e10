//! Resource-scoped access tokens minted from a refresh token

use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{AuthUrl, ClientId, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl};

use super::{AuthConfig, AuthError, Resource};

/// Access token for a single downstream audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceToken {
    pub label: String,
    pub resource_uri: String,
    pub access_token: String,
    pub expires_in: Option<u64>,
}

/// Exchanges a refresh token for audience-scoped access tokens.
pub struct ResourceTokenRefresher {
    config: AuthConfig,
}

impl ResourceTokenRefresher {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Build the OAuth2 client for a tenant
    fn build_client(&self, tenant: &str) -> Result<BasicClient, AuthError> {
        let auth_url = AuthUrl::from_url(self.config.endpoint(tenant, "authorize")?);
        let token_url = TokenUrl::from_url(self.config.endpoint(tenant, "token")?);

        Ok(BasicClient::new(
            ClientId::new(self.config.client_id.clone()),
            None,
            auth_url,
            Some(token_url),
        ))
    }

    /// Mint an access token for `resource`. Independent of any other resource.
    pub async fn refresh_resource(
        &self,
        tenant: &str,
        refresh_token: &str,
        resource: &Resource,
    ) -> Result<ResourceToken, AuthError> {
        let client = self.build_client(tenant)?;

        tracing::debug!(resource = %resource.label, "Refreshing resource token");

        let token_response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .add_scope(Scope::new(resource.scope()))
            .request_async(async_http_client)
            .await
            .map_err(|e| describe_failure(e, &resource.label))?;

        let access_token = token_response.access_token().secret();
        if access_token.is_empty() {
            return Err(AuthError::protocol(format!(
                "refresh token response missing access_token for {}",
                resource.label
            )));
        }

        Ok(ResourceToken {
            label: resource.label.clone(),
            resource_uri: resource.uri.clone(),
            access_token: access_token.to_string(),
            expires_in: token_response.expires_in().map(|d| d.as_secs()),
        })
    }
}

fn describe_failure(
    err: RequestTokenError<oauth2::reqwest::Error<reqwest::Error>, BasicErrorResponse>,
    label: &str,
) -> AuthError {
    match err {
        RequestTokenError::ServerResponse(resp) => AuthError::protocol(format!(
            "refresh token error for {}: {} ({})",
            label,
            resp.error().as_ref(),
            resp.error_description().map(String::as_str).unwrap_or_default()
        )),
        RequestTokenError::Parse(e, _) => AuthError::protocol(format!(
            "refresh token response parse failed for {}: {}",
            label, e
        )),
        RequestTokenError::Request(oauth2::reqwest::Error::Reqwest(e)) => AuthError::Http(e),
        RequestTokenError::Request(other) => {
            AuthError::protocol(format!("refresh token request for {} failed: {}", label, other))
        }
        RequestTokenError::Other(msg) => {
            AuthError::protocol(format!("refresh token error for {}: {}", label, msg))
        }
    }
}
