//! App access tokens for the Twitch API (client-credentials grant).

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::util::{HttpClient, HttpError};

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const REVOKE_URL: &str = "https://id.twitch.tv/oauth2/revoke";

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("No access token is currently available")]
    Missing,
    #[error("Access token expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("Identity endpoint returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Could not reach identity endpoint")]
    Http(#[from] HttpError),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Http(e.into())
    }
}

impl From<reqwest_middleware::Error> for AuthError {
    fn from(e: reqwest_middleware::Error) -> Self {
        AuthError::Http(e.into())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub access: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh: Option<String>,
    pub scopes: Vec<String>,
}

impl AccessToken {
    fn from_response(res: TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            access: res.access_token,
            issued_at: now,
            expires_at: now + Duration::seconds(res.expires_in),
            refresh: res.refresh_token,
            scopes: res.scope,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

pub struct AuthClient {
    http: HttpClient,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
}

impl AuthClient {
    pub fn new(http: HttpClient, client_id: &str, client_secret: &str) -> Self {
        Self {
            http,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The current bearer credential, if one is held and still valid.
    pub fn access_token(&self) -> Result<String, AuthError> {
        let guard = self.token.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            None => Err(AuthError::Missing),
            Some(token) if token.is_expired() => Err(AuthError::Expired(token.expires_at)),
            Some(token) => Ok(token.access.clone()),
        }
    }

    pub async fn authenticate(&self) -> Result<(), AuthError> {
        info!("Obtaining access token ...");
        let res = self
            .http
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }

        let token = AccessToken::from_response(res.json().await?, Utc::now());
        info!("New access token expires at {}", token.expires_at);
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
        Ok(())
    }

    /// Revokes the held token. Does nothing when no token is held.
    pub async fn revoke(&self) -> Result<(), AuthError> {
        let token = self.token.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(token) = token else {
            return Ok(());
        };

        info!("Revoking current access token ...");
        self.http
            .client
            .post(REVOKE_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("token", token.access.as_str()),
            ])
            .send()
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_token(&self, token: AccessToken) {
        *self.token.lock().unwrap() = Some(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AuthClient {
        AuthClient::new(HttpClient::new().unwrap(), "cid", "secret")
    }

    #[test]
    fn token_from_response() {
        let res: TokenResponse = serde_json::from_str(
            r#"{"access_token":"abc","expires_in":3600,"token_type":"bearer"}"#,
        )
        .unwrap();
        let now = Utc::now();
        let token = AccessToken::from_response(res, now);
        assert_eq!(token.access, "abc");
        assert_eq!(token.expires_at - token.issued_at, Duration::seconds(3600));
        assert!(token.refresh.is_none());
        assert!(!token.is_expired());
    }

    #[test]
    fn missing_and_expired_tokens() {
        let auth = client();
        assert!(matches!(auth.access_token(), Err(AuthError::Missing)));

        let now = Utc::now();
        auth.set_token(AccessToken {
            access: "old".into(),
            issued_at: now - Duration::hours(2),
            expires_at: now - Duration::hours(1),
            refresh: None,
            scopes: vec![],
        });
        assert!(matches!(auth.access_token(), Err(AuthError::Expired(_))));

        auth.set_token(AccessToken {
            access: "fresh".into(),
            issued_at: now,
            expires_at: now + Duration::hours(1),
            refresh: None,
            scopes: vec![],
        });
        assert_eq!(auth.access_token().unwrap(), "fresh");
    }

    #[tokio::test]
    async fn revoke_without_token_is_noop() {
        let auth = client();
        auth.revoke().await.expect("revoke should not fail without a token");
        auth.revoke().await.expect("revoke should be idempotent");
    }
}
