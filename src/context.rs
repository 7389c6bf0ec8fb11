//! Everything a running instance shares, built once from the config.

use std::sync::Arc;

use crate::{
    auth::AuthClient,
    config::{Config, SubscriptionEntry},
    error::Error,
    ffmpeg::Ffmpeg,
    gateway::Gateway,
    handlers::{CaptureHandler, HandlerKind, HandlerRegistry, LogHandler, NotificationHandler},
    source,
    stitch::{AudioOffsetFinder, LiveHead, PlaylistHead, Stitcher},
    subscription::{BatchOutcome, ChannelKey, SubscriptionManager},
    twitch::TwitchClient,
    util::{HttpClient, HttpError},
    worker::CaptureSupervisor,
};

pub struct AppContext {
    pub config: Config,
    pub http: HttpClient,
    pub auth: Arc<AuthClient>,
    pub twitch: Arc<TwitchClient>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub supervisor: Arc<CaptureSupervisor>,
    pub ffmpeg: Ffmpeg,
}

/// The numeric id wins when an entry names both.
fn channel_key(entry: &SubscriptionEntry) -> Option<ChannelKey> {
    match (entry.id, &entry.login) {
        (Some(id), _) => Some(ChannelKey::Id(id)),
        (None, Some(login)) => Some(ChannelKey::login(login)),
        (None, None) => None,
    }
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self, Error> {
        let http = HttpClient::new().map_err(HttpError::from)?;
        let auth = Arc::new(AuthClient::new(
            http.clone(),
            &config.client_id,
            &config.client_secret,
        ));
        let twitch = Arc::new(TwitchClient::new(http.clone(), auth.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new(
            twitch.clone(),
            &config.server_origin,
            &config.secret_key,
            config.lease_seconds,
        ));
        let supervisor = Arc::new(CaptureSupervisor::from_config(&config.capture));
        let ffmpeg = Ffmpeg::new(&config.capture.ffmpeg, &config.capture.ffprobe)
            .with_probe_timeout(config.stitch.probe_timeout());

        Ok(Self {
            config,
            http,
            auth,
            twitch,
            subscriptions,
            supervisor,
            ffmpeg,
        })
    }

    pub fn channels(&self) -> Vec<ChannelKey> {
        self.config.subscriptions.iter().filter_map(channel_key).collect()
    }

    pub fn handlers(&self) -> HandlerRegistry {
        let capture: Arc<dyn NotificationHandler> = Arc::new(CaptureHandler::new(
            self.supervisor.clone(),
            self.config.output_dir.clone(),
            self.config.capture.clone(),
        ));
        let log: Arc<dyn NotificationHandler> = Arc::new(LogHandler);

        let mut registry = HandlerRegistry::new();
        for entry in &self.config.subscriptions {
            let Some(key) = channel_key(entry) else {
                continue;
            };
            let handler = match entry.handler {
                HandlerKind::Capture => capture.clone(),
                HandlerKind::Log => log.clone(),
            };
            registry.register(key, handler);
        }
        registry
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        Arc::new(
            Gateway::new(
                &self.config.secret_key,
                &self.config.server_origin,
                self.config.lease_seconds,
                self.subscriptions.clone(),
                self.handlers(),
            )
            .with_dump_dir(self.config.output_dir.clone()),
        )
    }

    pub fn stitcher(&self) -> Stitcher {
        let stitch = &self.config.stitch;
        Stitcher::new(
            Arc::new(self.ffmpeg.clone()),
            Arc::new(AudioOffsetFinder::new(
                &stitch.offset_finder,
                stitch.offset_timeout(),
            )),
            stitch.overlap_secs,
            &stitch.suffix,
        )
    }

    pub fn live_head(&self, channel: &str) -> LiveHead {
        LiveHead {
            source: self.supervisor.source(),
            ffmpeg: self.ffmpeg.clone(),
            channel_url: source::channel_url(channel),
            qualities: self.config.capture.qualities.clone(),
        }
    }

    pub fn playlist_head(&self, playlist_url: &str, extended: bool) -> PlaylistHead {
        PlaylistHead {
            http: self.http.clone(),
            ffmpeg: self.ffmpeg.clone(),
            playlist_url: playlist_url.to_string(),
            extended,
        }
    }

    /// Fetches an app token and subscribes to every configured channel.
    pub async fn start(&self) -> Result<BatchOutcome, Error> {
        self.auth.authenticate().await?;
        let channels = self.channels();
        info!("Subscribing to {} channel(s)", channels.len());
        let outcome = self.subscriptions.subscribe_all(&channels).await;
        for (key, e) in &outcome.failed {
            error!("Could not subscribe to {}: {}", key, e);
        }
        info!(
            "{} subscription(s) accepted, {} failed",
            outcome.accepted.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    /// Cancels renewals, stops running captures and waits for them to
    /// finalize their output, then revokes the token.
    pub async fn shutdown(&self) {
        self.subscriptions.close();
        self.supervisor.shutdown();
        self.supervisor.stopped().await;
        if let Err(e) = self.auth.revoke().await {
            warn!("Could not revoke access token: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
client_id = "cid"
client_secret = "csecret"
secret_key = "hunter2"
server_origin = "https://example.net"
output_dir = "/rec"

[[subscriptions]]
login = "SomeChannel"

[[subscriptions]]
id = 12826
login = "ignored"
handler = "log"

[stitch]
offset_timeout_secs = 10
"#;

    fn context() -> AppContext {
        AppContext::new(Config::from_toml(CONFIG).unwrap()).unwrap()
    }

    #[test]
    fn channels_prefer_ids() {
        assert_eq!(
            context().channels(),
            vec![ChannelKey::login("somechannel"), ChannelKey::Id(12826)]
        );
    }

    #[test]
    fn handlers_follow_subscription_entries() {
        let registry = context().handlers();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("12826", "whoever").unwrap().name(), "log");
        assert_eq!(registry.resolve("1", "SomeChannel").unwrap().name(), "capture");
        assert!(registry.resolve("1", "ignored").is_none());
    }

    #[test]
    fn ffmpeg_uses_probe_timeout() {
        let ctx = context();
        assert_eq!(ctx.ffmpeg.probe_timeout, Some(ctx.config.stitch.probe_timeout()));
        assert_eq!(ctx.live_head("SomeChannel").channel_url, "https://twitch.tv/somechannel");
    }

    #[tokio::test]
    async fn shutdown_without_token_is_quiet() {
        let ctx = context();
        ctx.shutdown().await;
        assert!(ctx.auth.access_token().is_err());
    }
}
