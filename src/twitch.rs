//! Helix REST endpoints and the webhook hub.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    auth::{AuthClient, AuthError},
    subscription::{Hub, HubRequest, SubscriptionError},
    util::{HttpClient, HttpError},
};

pub const HELIX_BASE: &str = "https://api.twitch.tv/helix";
pub const STREAMS_TOPIC: &str = "https://api.twitch.tv/helix/streams";

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("Twitch returned HTTP 401 Unauthorized")]
    Unauthorized,
    #[error("Twitch returned HTTP 429 Too Many Requests")]
    RateLimited,
    #[error("Twitch returned an error: {0}")]
    Platform(String),
    #[error("Request failed")]
    Http(#[from] HttpError),
    #[error("Could not decode response")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    InvalidRequest(&'static str),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Http(e.into())
    }
}

impl From<reqwest_middleware::Error> for ApiError {
    fn from(e: reqwest_middleware::Error) -> Self {
        ApiError::Http(e.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Game {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Vec<T>,
}

fn check_status(status: StatusCode) -> Result<(), ApiError> {
    match status {
        StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited),
        _ => Ok(()),
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, ApiError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    if let Some(err) = value.get("error") {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| format!("{}: {}", err, m))
            .unwrap_or_else(|| err.to_string());
        return Err(ApiError::Platform(message));
    }
    let envelope: Envelope<T> = serde_json::from_value(value)?;
    Ok(envelope.data)
}

pub struct TwitchClient {
    http: HttpClient,
    auth: Arc<AuthClient>,
}

impl TwitchClient {
    pub fn new(http: HttpClient, auth: Arc<AuthClient>) -> Self {
        Self { http, auth }
    }

    pub fn auth(&self) -> &Arc<AuthClient> {
        &self.auth
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, ApiError> {
        debug!("Fetching {} with HTTP {}", endpoint, method);
        let token = self.auth.access_token()?;
        let res = self
            .http
            .client
            .request(method, format!("{}{}", HELIX_BASE, endpoint))
            .query(query)
            .bearer_auth(token)
            .header("Client-Id", self.auth.client_id())
            .send()
            .await?;
        check_status(res.status())?;
        Ok(res)
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ApiError> {
        let body = self.request(Method::GET, endpoint, query).await?.text().await?;
        decode(&body)
    }

    pub async fn get_users(&self, ids: &[u64], logins: &[String]) -> Result<Vec<User>, ApiError> {
        if ids.is_empty() && logins.is_empty() {
            return Err(ApiError::InvalidRequest(
                "Must supply user IDs and/or usernames",
            ));
        }
        let query = ids
            .iter()
            .map(|id| ("id", id.to_string()))
            .chain(logins.iter().map(|login| ("login", login.to_lowercase())))
            .collect::<Vec<_>>();
        self.get_data("/users", &query).await
    }

    pub async fn get_games(&self, ids: &[String]) -> Result<Vec<Game>, ApiError> {
        let query = ids.iter().map(|id| ("id", id.clone())).collect::<Vec<_>>();
        self.get_data("/games", &query).await
    }

    pub async fn list_subscriptions(&self) -> Result<serde_json::Value, ApiError> {
        let body = self
            .request(Method::GET, "/webhooks/subscriptions", &[])
            .await?
            .text()
            .await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Hub for TwitchClient {
    async fn lookup_users(&self, ids: &[u64], logins: &[String]) -> Result<Vec<User>, ApiError> {
        self.get_users(ids, logins).await
    }

    async fn lookup_games(&self, ids: &[String]) -> Result<Vec<Game>, ApiError> {
        self.get_games(ids).await
    }

    async fn post(&self, request: &HubRequest) -> Result<(), SubscriptionError> {
        let token = self.auth.access_token().map_err(ApiError::from)?;
        let res = self
            .http
            .client
            .post(format!("{}/webhooks/hub", HELIX_BASE))
            .bearer_auth(token)
            .header("Client-Id", self.auth.client_id())
            .form(&request.form())
            .send()
            .await
            .map_err(ApiError::from)?;

        let status = res.status();
        if status != StatusCode::ACCEPTED {
            return Err(SubscriptionError::HubRejected {
                status: status.as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
