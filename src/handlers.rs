//! What happens when a subscribed channel goes live.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    config::CaptureConfig,
    gateway::StreamEvent,
    source,
    subscription::ChannelKey,
    util,
    worker::{CaptureSession, CaptureSupervisor},
};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    #[default]
    Capture,
    Log,
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &StreamEvent) -> Result<(), HandlerError>;
}

/// Only records that the channel went live.
pub struct LogHandler;

#[async_trait]
impl NotificationHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &StreamEvent) -> Result<(), HandlerError> {
        info!(
            "{} is live: {}",
            event.user_name,
            event.title.as_deref().unwrap_or("(untitled)")
        );
        Ok(())
    }
}

/// Starts a capture worker for the channel and returns once it is running.
pub struct CaptureHandler {
    supervisor: Arc<CaptureSupervisor>,
    output_dir: PathBuf,
    config: CaptureConfig,
}

impl CaptureHandler {
    pub fn new(supervisor: Arc<CaptureSupervisor>, output_dir: PathBuf, config: CaptureConfig) -> Self {
        Self {
            supervisor,
            output_dir,
            config,
        }
    }

    pub fn session(&self, event: &StreamEvent) -> CaptureSession {
        let login = event.login();
        let name = format!(
            "{}.{}",
            util::timestamped_name(&login),
            self.config.container.extension()
        );
        CaptureSession {
            url: source::channel_url(&login),
            channel: login,
            output: self.output_dir.join(name),
            qualities: self.config.qualities.clone(),
            mode: self.config.mode,
            container: self.config.container,
        }
    }
}

#[async_trait]
impl NotificationHandler for CaptureHandler {
    fn name(&self) -> &str {
        "capture"
    }

    async fn handle(&self, event: &StreamEvent) -> Result<(), HandlerError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let session = self.session(event);
        info!("Recording {} to {}", session.channel, session.output.display());

        let handle = self.supervisor.start(session);
        self.supervisor.detach(handle);
        Ok(())
    }
}

/// Maps channels to the handler invoked when they go live.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ChannelKey, Arc<dyn NotificationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: ChannelKey, handler: Arc<dyn NotificationHandler>) {
        debug!("Registered {} handler for {}", handler.name(), key);
        self.handlers.insert(key, handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Looks the channel up by numeric id first, then by login.
    pub fn resolve(&self, user_id: &str, login: &str) -> Option<Arc<dyn NotificationHandler>> {
        user_id
            .parse()
            .ok()
            .and_then(|id| self.handlers.get(&ChannelKey::Id(id)))
            .or_else(|| self.handlers.get(&ChannelKey::login(login)))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ffmpeg::{Container, Ffmpeg},
        worker::{tests::FakeSource, CaptureMode, RetryPolicy},
    };

    fn event(user_id: &str, user_name: &str) -> StreamEvent {
        serde_json::from_value(serde_json::json!({
            "id": "1001",
            "user_id": user_id,
            "user_name": user_name,
            "title": "hello",
        }))
        .unwrap()
    }

    #[test]
    fn handler_kinds_deserialize() {
        #[derive(Deserialize)]
        struct Entry {
            handler: HandlerKind,
        }
        let entry: Entry = toml::from_str("handler = \"log\"").unwrap();
        assert_eq!(entry.handler, HandlerKind::Log);
        assert_eq!(HandlerKind::default(), HandlerKind::Capture);
    }

    #[test]
    fn resolves_by_id_then_login() {
        let mut registry = HandlerRegistry::new();
        registry.register(ChannelKey::Id(42), Arc::new(LogHandler));
        registry.register(ChannelKey::login("SomeChannel"), Arc::new(LogHandler));

        assert!(registry.resolve("42", "whoever").is_some());
        assert!(registry.resolve("7", "somechannel").is_some());
        assert!(registry.resolve("7", "SOMECHANNEL").is_some());
        assert!(registry.resolve("not-a-number", "somechannel").is_some());
        assert!(registry.resolve("7", "other").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn capture_sessions_follow_config() {
        let supervisor = Arc::new(CaptureSupervisor::new(
            Arc::new(FakeSource::offering(&[])),
            Ffmpeg::default(),
            RetryPolicy::default(),
            1,
        ));
        let config = CaptureConfig {
            mode: CaptureMode::Pipe,
            container: Container::Mp4,
            ..Default::default()
        };
        let handler = CaptureHandler::new(supervisor, PathBuf::from("/rec"), config);

        let session = handler.session(&event("42", "SomeChannel"));
        assert_eq!(session.channel, "somechannel");
        assert_eq!(session.url, "https://twitch.tv/somechannel");
        assert_eq!(session.mode, CaptureMode::Pipe);
        let name = session.output.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("somechannel-"), "{}", name);
        assert!(name.ends_with(".mp4"), "{}", name);
        assert!(session.output.starts_with("/rec"));
    }
}
