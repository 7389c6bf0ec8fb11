//! Webhook subscription lifecycle: subscribe, verify, renew.
//!
//! A subscription moves through `Requested -> Accepted` when the hub takes the
//! subscribe request, `Active` once the hub's verification challenge reaches
//! the gateway, and `Renewing` when its renewal job fires at 90% of the lease.
//! The hub verifies the renewal like a fresh subscription, which makes it
//! `Active` again. A renewal that the hub refuses leaves it `Expired`; it is
//! not retried.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use url::Url;

use crate::twitch::{ApiError, Game, User, STREAMS_TOPIC};

#[derive(thiserror::Error, Debug)]
pub enum SubscriptionError {
    #[error("Hub rejected subscription with HTTP {status}: {body}")]
    HubRejected { status: u16, body: String },
    #[error("Platform API error")]
    Api(#[from] ApiError),
    #[error("Could not resolve user {0}")]
    UnknownUser(String),
    #[error("User lookup failed: {0}")]
    LookupFailed(String),
    #[error("No subscription registered for {0}")]
    NotRegistered(String),
}

/// The pub-sub hub the subscriptions are registered with.
#[async_trait]
pub trait Hub: Send + Sync {
    async fn lookup_users(&self, ids: &[u64], logins: &[String]) -> Result<Vec<User>, ApiError>;

    async fn lookup_games(&self, ids: &[String]) -> Result<Vec<Game>, ApiError>;

    /// Posts a hub request. Anything but the hub's "accepted" status is an error.
    async fn post(&self, request: &HubRequest) -> Result<(), SubscriptionError>;
}

/// A channel as named in configuration: by numeric id or by login.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Id(u64),
    Login(String),
}

impl ChannelKey {
    pub fn login(login: &str) -> Self {
        ChannelKey::Login(login.to_lowercase())
    }

    fn matches(&self, user: &User) -> bool {
        match self {
            ChannelKey::Id(id) => user.id == id.to_string(),
            ChannelKey::Login(login) => user.login.eq_ignore_ascii_case(login),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Id(id) => write!(f, "id:{}", id),
            ChannelKey::Login(login) => write!(f, "login:{}", login),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubRequest {
    pub callback: String,
    pub mode: &'static str,
    pub topic: String,
    pub lease_seconds: u64,
    pub secret: String,
}

impl HubRequest {
    pub fn subscribe(callback: &str, topic: &str, lease_seconds: u64, secret: &str) -> Self {
        Self {
            callback: callback.to_string(),
            mode: "subscribe",
            topic: topic.to_string(),
            lease_seconds,
            secret: secret.to_string(),
        }
    }

    pub fn form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("hub.callback", self.callback.clone()),
            ("hub.mode", self.mode.to_string()),
            ("hub.topic", self.topic.clone()),
            ("hub.lease_seconds", self.lease_seconds.to_string()),
            ("hub.secret", self.secret.clone()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Requested,
    Accepted,
    Active,
    Renewing,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub key: String,
    pub request: HubRequest,
    pub state: SubscriptionState,
    pub verified_at: Option<DateTime<Utc>>,
}

/// What the hub told us when it verified a subscription.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub topic: String,
    pub lease_seconds: u64,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub accepted: Vec<String>,
    pub failed: Vec<(String, SubscriptionError)>,
}

/// Renewal fires at 90% of the lease.
pub fn renewal_delay(lease_seconds: u64) -> Duration {
    Duration::from_millis(lease_seconds.saturating_mul(900))
}

pub fn callback_url(origin: &str, channel_id: &str) -> String {
    format!(
        "{}/webhook/stream_changed/{}",
        origin.trim_end_matches('/'),
        channel_id
    )
}

pub fn stream_topic(channel_id: &str) -> String {
    Url::parse_with_params(STREAMS_TOPIC, &[("user_id", channel_id)])
        .map(String::from)
        .unwrap_or_else(|_| format!("{}?user_id={}", STREAMS_TOPIC, channel_id))
}

struct Shared {
    hub: Arc<dyn Hub>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Shared {
    fn set_state(&self, key: &str, state: SubscriptionState) {
        if let Some(sub) = self.lock().get_mut(key) {
            sub.state = state;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks a renewal that was never verified as lapsed.
    fn lapse(&self, key: &str) {
        if let Some(sub) = self.lock().get_mut(key) {
            if sub.state == SubscriptionState::Renewing {
                warn!("Renewal of {} was never verified, lease has lapsed", key);
                sub.state = SubscriptionState::Expired;
            }
        }
    }

    async fn renew(&self, key: &str) -> Result<(), SubscriptionError> {
        let request = self
            .lock()
            .get(key)
            .map(|s| s.request.clone())
            .ok_or_else(|| SubscriptionError::NotRegistered(key.to_string()))?;

        info!("Renewing subscription {}", key);
        self.set_state(key, SubscriptionState::Renewing);
        match self.hub.post(&request).await {
            Ok(()) => {
                info!("Renewal of {} accepted, awaiting verification", key);
                Ok(())
            }
            Err(e) => {
                error!("Renewal of {} failed, lease will lapse: {}", key, e);
                self.set_state(key, SubscriptionState::Expired);
                Err(e)
            }
        }
    }
}

pub struct SubscriptionManager {
    shared: Arc<Shared>,
    origin: String,
    secret: String,
    lease_seconds: u64,
    renewals: Mutex<HashMap<String, JoinHandle<()>>>,
    users: Mutex<HashMap<String, User>>,
    games: Mutex<HashMap<String, String>>,
}

impl SubscriptionManager {
    pub fn new(hub: Arc<dyn Hub>, origin: &str, secret: &str, lease_seconds: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                hub,
                subscriptions: Mutex::new(HashMap::new()),
            }),
            origin: origin.to_string(),
            secret: secret.to_string(),
            lease_seconds,
            renewals: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            games: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscription(&self, key: &str) -> Option<Subscription> {
        self.shared.lock().get(key).cloned()
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn remember_users(&self, users: &[User]) {
        let mut cache = self.users.lock().unwrap_or_else(|e| e.into_inner());
        for user in users {
            cache.insert(user.id.clone(), user.clone());
        }
    }

    /// Looks the user up unless it is already known. Failures are only logged.
    pub async fn ensure_user(&self, id: &str) {
        if self.user(id).is_some() {
            return;
        }
        let Ok(numeric) = id.parse::<u64>() else {
            return;
        };
        match self.shared.hub.lookup_users(&[numeric], &[]).await {
            Ok(users) => self.remember_users(&users),
            Err(e) => warn!("Could not look up user {}: {}", id, e),
        }
    }

    /// Name of the game `id`, looked up once and cached. Failures are only logged.
    pub async fn game_name(&self, id: &str) -> Option<String> {
        let cached = self
            .games
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned();
        if cached.is_some() {
            return cached;
        }
        let games = match self.shared.hub.lookup_games(&[id.to_string()]).await {
            Ok(games) => games,
            Err(e) => {
                warn!("Could not look up game {}: {}", id, e);
                return None;
            }
        };
        let mut cache = self.games.lock().unwrap_or_else(|e| e.into_inner());
        for game in games {
            cache.insert(game.id, game.name);
        }
        cache.get(id).cloned()
    }

    pub async fn subscribe_to_stream(&self, channel_id: &str) -> Result<HubRequest, SubscriptionError> {
        info!("Subscribing to {}", channel_id);
        let request = HubRequest::subscribe(
            &callback_url(&self.origin, channel_id),
            &stream_topic(channel_id),
            self.lease_seconds,
            &self.secret,
        );

        let previous = self.shared.lock().insert(
            channel_id.to_string(),
            Subscription {
                key: channel_id.to_string(),
                request: request.clone(),
                state: SubscriptionState::Requested,
                verified_at: None,
            },
        );

        match self.shared.hub.post(&request).await {
            Ok(()) => {
                self.shared
                    .set_state(channel_id, SubscriptionState::Accepted);
                Ok(request)
            }
            Err(e) => {
                let mut subs = self.shared.lock();
                match previous {
                    Some(prev) => subs.insert(channel_id.to_string(), prev),
                    None => subs.remove(channel_id),
                };
                Err(e)
            }
        }
    }

    /// Resolves every identifier with a single lookup and subscribes to all of
    /// them concurrently. Individual failures are collected, never raised.
    pub async fn subscribe_all(&self, channels: &[ChannelKey]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if channels.is_empty() {
            return outcome;
        }

        let (mut ids, mut logins) = (Vec::new(), Vec::new());
        for key in channels {
            match key {
                ChannelKey::Id(id) => ids.push(*id),
                ChannelKey::Login(login) => logins.push(login.clone()),
            }
        }

        let users = match self.shared.hub.lookup_users(&ids, &logins).await {
            Ok(users) => users,
            Err(e) => {
                error!("Could not resolve subscriptions: {}", e);
                let message = e.to_string();
                outcome.failed = channels
                    .iter()
                    .map(|k| (k.to_string(), SubscriptionError::LookupFailed(message.clone())))
                    .collect();
                return outcome;
            }
        };
        self.remember_users(&users);

        let mut resolved = Vec::new();
        for key in channels {
            match users.iter().find(|u| key.matches(u)) {
                Some(user) if !resolved.iter().any(|u: &&User| u.id == user.id) => {
                    resolved.push(user)
                }
                Some(_) => (),
                None => {
                    error!("Could not resolve {}", key);
                    outcome
                        .failed
                        .push((key.to_string(), SubscriptionError::UnknownUser(key.to_string())));
                }
            }
        }

        let results = join_all(resolved.iter().map(|u| self.subscribe_to_stream(&u.id))).await;
        for (user, result) in resolved.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    info!("Subscription to {} ({}) accepted.", user.login, user.id);
                    outcome.accepted.push(user.id.clone());
                }
                Err(e) => {
                    error!("Subscription to {} ({}) failed: {}", user.login, user.id, e);
                    outcome.failed.push((user.id.clone(), e));
                }
            }
        }

        outcome
    }

    /// Records a subscription the hub has verified and schedules its renewal.
    pub fn register_verified(&self, key: &str, callback: &str, lease: LeaseInfo) {
        info!(
            "Added subscription {} (topic {}, lease {}s)",
            key, lease.topic, lease.lease_seconds
        );

        {
            let mut subs = self.shared.lock();
            let request = subs
                .get(key)
                .map(|s| s.request.clone())
                .unwrap_or_else(|| {
                    HubRequest::subscribe(callback, &lease.topic, self.lease_seconds, &self.secret)
                });
            subs.insert(
                key.to_string(),
                Subscription {
                    key: key.to_string(),
                    request,
                    state: SubscriptionState::Active,
                    verified_at: Some(Utc::now()),
                },
            );
        }

        let delay = renewal_delay(lease.lease_seconds);
        info!("Subscription {} scheduled to renew in {}s", key, delay.as_secs());

        let shared = self.shared.clone();
        let job_key = key.to_string();
        let remaining = Duration::from_secs(lease.lease_seconds).saturating_sub(delay);
        let job = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.renew(&job_key).await.is_ok() {
                // Re-verification replaces this job before it gets here
                tokio::time::sleep(remaining).await;
                shared.lapse(&job_key);
            }
        });

        let previous = self
            .renewals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), job);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Re-issues the original subscribe payload for `key` right away.
    pub async fn renew(&self, key: &str) -> Result<(), SubscriptionError> {
        self.shared.renew(key).await
    }

    /// Cancels every pending renewal job. Safe to call repeatedly.
    pub fn close(&self) {
        let jobs = std::mem::take(&mut *self.renewals.lock().unwrap_or_else(|e| e.into_inner()));
        if !jobs.is_empty() {
            debug!("Cancelling {} renewal job(s)", jobs.len());
        }
        for (_, job) in jobs {
            job.abort();
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close();
    }
}
