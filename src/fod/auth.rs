use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    types::{Credentials, Token},
};

/// Scope requested for every token; grants access to the tenant API.
pub const DEFAULT_SCOPE: &str = "api-tenant";

/// Anything able to mint a fresh access token.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch_token(&self) -> Result<Token>;
}

/// Exchanges connection-string credentials at the `/oauth/token` endpoint.
pub struct FodCredentialSource {
    client: Client,
    token_url: String,
    credentials: Credentials,
    scope: String,
}

impl FodCredentialSource {
    pub fn new(client: Client, token_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            credentials,
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    fn form(&self) -> Vec<(&'static str, String)> {
        match &self.credentials {
            Credentials::ClientCredentials {
                client_id,
                client_secret,
            } => vec![
                ("grant_type", "client_credentials".to_string()),
                ("scope", self.scope.clone()),
                ("client_id", client_id.clone()),
                ("client_secret", client_secret.clone()),
            ],
            Credentials::Password {
                tenant,
                username,
                password,
            } => vec![
                ("grant_type", "password".to_string()),
                ("scope", self.scope.clone()),
                ("username", format!("{tenant}\\{username}")),
                ("password", password.clone()),
            ],
        }
    }
}

#[async_trait]
impl CredentialSource for FodCredentialSource {
    async fn fetch_token(&self) -> Result<Token> {
        let principal = self.credentials.principal();
        let res = self
            .client
            .post(&self.token_url)
            .form(&self.form())
            .send()
            .await
            .map_err(|e| {
                Error::Authentication(format!(
                    "token request for {principal} to {url} failed: {e}",
                    url = self.token_url
                ))
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Authentication(format!(
                "token endpoint {url} rejected {principal} with {status}: {body}",
                url = self.token_url
            )));
        }

        let json: Value = res
            .json()
            .await
            .map_err(|e| Error::Authentication(format!("malformed token response: {e}")))?;

        let access_token = json["access_token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Authentication("token response does not contain an access_token".into())
            })?;

        Ok(Token::new(
            access_token,
            json["expires_in"].as_u64().unwrap_or(3600),
        ))
    }
}

/// Owns the access token of one connection.
///
/// The token slot sits behind an async mutex and refreshes happen while it is
/// held, so any number of concurrent callers hitting an expired token cause a
/// single call to the [`CredentialSource`]; the rest wait and reuse its result.
#[derive(Clone)]
pub struct TokenManager {
    source: Arc<dyn CredentialSource>,
    slot: Arc<Mutex<Option<Token>>>,
}

impl TokenManager {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts from an already known token, refreshing once it expires.
    pub fn with_token(source: Arc<dyn CredentialSource>, token: Token) -> Self {
        Self {
            source,
            slot: Arc::new(Mutex::new(Some(token))),
        }
    }

    /// Returns a valid token, refreshing it first if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] when the refresh fails. The slot is
    /// left empty so the next caller tries again.
    pub async fn get_token(&self) -> Result<Token> {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.clone());
        }

        debug!("access token absent or expired, refreshing");
        let token = match self.source.fetch_token().await {
            Ok(token) => token,
            Err(e) => {
                *slot = None;
                return Err(e);
            }
        };
        info!(expires_in = token.expires_in, "obtained new access token");
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Drops `stale` after the server rejected it.
    ///
    /// Has no effect when another caller already replaced it, so a burst of
    /// 401 responses for the same token still leads to one refresh.
    pub async fn invalidate(&self, stale: &Token) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref() == Some(stale) {
            debug!("invalidating rejected access token");
            *slot = None;
        }
    }

    pub async fn current_token(&self) -> Option<Token> {
        self.slot.lock().await.clone()
    }
}
