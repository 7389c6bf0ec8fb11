//! The webhook endpoint the hub calls back into.
//!
//! `GET /webhook/stream_changed/{channel_id}` answers subscription
//! verification challenges. `POST` on the same path receives stream change
//! notifications, which go through these checks in order:
//!
//! 1. both the signature and notification id headers must be present (400)
//! 2. the body must not exceed [`MAX_BODY`] (413)
//! 3. an already seen notification id is acknowledged and ignored (204)
//! 4. the HMAC-SHA256 signature must match (403)
//! 5. an empty `data` array means the stream went offline (204)
//! 6. the channel must have a registered handler (204)
//! 7. a stream already being handled is not handled twice (204)
//! 8. the handler runs, and whatever it does the hub gets a 204

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_aux::field_attributes::deserialize_option_number_from_string;
use sha2::Sha256;

use crate::{
    handlers::HandlerRegistry,
    subscription::{callback_url, LeaseInfo, SubscriptionManager},
    util,
};

type HmacSha256 = Hmac<Sha256>;

pub const MAX_BODY: usize = 1024 * 1024;
pub const SIGNATURE_HEADER: &str = "x-hub-signature";
pub const NOTIFICATION_ID_HEADER: &str = "twitch-notification-id";
pub const CALLBACK_ROUTE: &str = "/webhook/stream_changed/{channel_id}";

#[derive(thiserror::Error, Debug)]
pub enum NotificationError {
    #[error("Missing signature or notification id header")]
    MissingHeaders,
    #[error("Notification body exceeds {MAX_BODY} bytes")]
    PayloadTooLarge,
    #[error("Signature does not match the body")]
    SignatureMismatch,
    #[error("Malformed notification body")]
    MalformedBody(#[from] serde_json::Error),
}

impl NotificationError {
    pub fn status(&self) -> StatusCode {
        match self {
            NotificationError::MissingHeaders => StatusCode::BAD_REQUEST,
            NotificationError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            NotificationError::SignatureMismatch => StatusCode::FORBIDDEN,
            NotificationError::MalformedBody(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Hex-encoded HMAC-SHA256 of `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

/// Checks a `sha256=<hex>` signature header against `body` in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let digest = header.split_once('=').map(|(_, d)| d).unwrap_or(header);
    let Ok(expected) = hex::decode(digest.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// One entry of a stream change notification's `data` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub user_login: Option<String>,
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub viewer_count: Option<u64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub raw: serde_json::Value,
}

impl StreamEvent {
    pub fn from_value(raw: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut event: StreamEvent = serde_json::from_value(raw.clone())?;
        event.raw = raw;
        Ok(event)
    }

    pub fn login(&self) -> String {
        self.user_login
            .clone()
            .unwrap_or_else(|| self.user_name.clone())
            .to_lowercase()
    }
}

#[derive(Debug, Deserialize)]
struct NotificationBody {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HubQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.topic")]
    pub topic: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
    #[serde(rename = "hub.lease_seconds")]
    pub lease_seconds: Option<String>,
    #[serde(rename = "hub.reason")]
    pub reason: Option<String>,
}

/// What became of an accepted notification. All of these answer 204.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Duplicate,
    Offline,
    NoHandler,
    AlreadyHandling,
    Dispatched,
    HandlerFailed,
}

fn ago(started_at: DateTime<Utc>) -> String {
    let elapsed = Utc::now() - started_at;
    let minutes = elapsed.num_minutes();
    if minutes < 1 {
        format!("{}s ago", elapsed.num_seconds().max(0))
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else {
        format!("{}h{:02}m ago", minutes / 60, minutes % 60)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Gateway {
    secret: String,
    origin: String,
    lease_seconds: u64,
    subscriptions: Arc<SubscriptionManager>,
    handlers: HandlerRegistry,
    dump_dir: Option<PathBuf>,
    seen: Mutex<HashSet<String>>,
    in_progress: Mutex<HashSet<String>>,
}

impl Gateway {
    pub fn new(
        secret: &str,
        origin: &str,
        lease_seconds: u64,
        subscriptions: Arc<SubscriptionManager>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            secret: secret.to_string(),
            origin: origin.to_string(),
            lease_seconds,
            subscriptions,
            handlers,
            dump_dir: None,
            seen: Mutex::new(HashSet::new()),
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Write every live notification as JSON into `dir`.
    pub fn with_dump_dir(mut self, dir: PathBuf) -> Self {
        self.dump_dir = Some(dir);
        self
    }

    pub fn is_seen(&self, notification_id: &str) -> bool {
        lock(&self.seen).contains(notification_id)
    }

    pub fn is_in_progress(&self, stream_id: &str) -> bool {
        lock(&self.in_progress).contains(stream_id)
    }

    /// Runs a notification whose headers are already known through the
    /// remaining checks and dispatches it.
    pub async fn process(
        &self,
        channel_id: &str,
        signature: &str,
        notification_id: &str,
        body: &[u8],
    ) -> Result<Outcome, NotificationError> {
        if body.len() > MAX_BODY {
            return Err(NotificationError::PayloadTooLarge);
        }
        if self.is_seen(notification_id) {
            debug!("Ignoring repeated notification {}", notification_id);
            return Ok(Outcome::Duplicate);
        }
        if !verify_signature(self.secret.as_bytes(), body, signature) {
            warn!("Signature mismatch on notification {} for {}", notification_id, channel_id);
            return Err(NotificationError::SignatureMismatch);
        }
        lock(&self.seen).insert(notification_id.to_string());

        let notification: NotificationBody = serde_json::from_slice(body)?;
        let Some(raw) = notification.data.into_iter().next() else {
            info!("Channel {} went offline", channel_id);
            return Ok(Outcome::Offline);
        };
        let event = StreamEvent::from_value(raw)?;
        self.report(&event).await;

        let Some(handler) = self.handlers.resolve(&event.user_id, &event.login()) else {
            warn!("No handler registered for {} ({})", event.user_name, event.user_id);
            return Ok(Outcome::NoHandler);
        };

        if !lock(&self.in_progress).insert(event.id.clone()) {
            info!("Stream {} of {} is already being handled", event.id, event.user_name);
            return Ok(Outcome::AlreadyHandling);
        }

        let name = handler.name().to_string();
        let task_event = event.clone();
        let result = tokio::spawn(async move { handler.handle(&task_event).await }).await;
        match result {
            Ok(Ok(())) => Ok(Outcome::Dispatched),
            Ok(Err(e)) => {
                error!("Handler {} failed for {}: {}", name, event.raw, e);
                Ok(Outcome::HandlerFailed)
            }
            Err(e) => {
                error!("Handler {} panicked for {}: {}", name, event.raw, e);
                Ok(Outcome::HandlerFailed)
            }
        }
    }

    async fn report(&self, event: &StreamEvent) {
        info!(
            "{} is live: {}",
            event.user_name,
            event.title.as_deref().unwrap_or("(untitled)")
        );
        if let (Some(viewers), Some(started_at)) = (event.viewer_count, event.started_at) {
            info!("{} viewers, started {}", viewers, ago(started_at));
        }
        if let Some(game_id) = event.game_id.as_deref().filter(|id| !id.is_empty()) {
            if let Some(game) = self.subscriptions.game_name(game_id).await {
                info!("{} is playing {}", event.user_name, game);
            }
        }

        let Some(dir) = &self.dump_dir else {
            return;
        };
        let path = dir.join(format!("{}.json", util::timestamped_name(&event.login())));
        let written = match serde_json::to_vec_pretty(&event.raw) {
            Ok(json) => tokio::fs::write(&path, json).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            warn!("Could not write {}: {}", path.display(), e);
        }
    }

    /// Answers a verification request from the hub.
    pub async fn verify(self: &Arc<Self>, channel_id: &str, query: HubQuery) -> Response {
        let Some(topic) = query.topic else {
            warn!("Verification request for {} without hub.topic", channel_id);
            return (StatusCode::BAD_REQUEST, "missing hub.topic").into_response();
        };

        let Some(challenge) = query.challenge else {
            error!(
                "Subscription to {} was not verified: {}",
                topic,
                query.reason.as_deref().unwrap_or("no reason given")
            );
            return StatusCode::NO_CONTENT.into_response();
        };

        if query.mode.as_deref() != Some("subscribe") {
            info!(
                "Hub confirmed {} for {}",
                query.mode.as_deref().unwrap_or("an unnamed request"),
                topic
            );
            return (StatusCode::OK, challenge).into_response();
        }

        debug!("Hub subscribe verification for {}", topic);
        let lease_seconds = query
            .lease_seconds
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.lease_seconds);
        self.subscriptions.register_verified(
            channel_id,
            &callback_url(&self.origin, channel_id),
            LeaseInfo {
                topic,
                lease_seconds,
            },
        );

        let gateway = self.clone();
        let id = channel_id.to_string();
        tokio::spawn(async move { gateway.subscriptions.ensure_user(&id).await });

        (StatusCode::OK, challenge).into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn verify_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(channel_id): Path<String>,
    Query(query): Query<HubQuery>,
) -> Response {
    gateway.verify(&channel_id, query).await
}

async fn notify_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let (Some(signature), Some(notification_id)) = (
        header(&headers, SIGNATURE_HEADER),
        header(&headers, NOTIFICATION_ID_HEADER),
    ) else {
        return NotificationError::MissingHeaders.into_response();
    };

    let declared = header(&headers, "content-length").and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > MAX_BODY) {
        return NotificationError::PayloadTooLarge.into_response();
    }
    if gateway.is_seen(notification_id) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let Ok(body) = axum::body::to_bytes(body, MAX_BODY).await else {
        return NotificationError::PayloadTooLarge.into_response();
    };

    match gateway
        .process(&channel_id, signature, notification_id, &body)
        .await
    {
        Ok(outcome) => {
            debug!("Notification {} for {}: {:?}", notification_id, channel_id, outcome);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route(CALLBACK_ROUTE, get(verify_handler).post(notify_handler))
        .with_state(gateway)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        handlers::{HandlerError, NotificationHandler},
        subscription::{tests::FakeHub, ChannelKey, SubscriptionState},
    };

    const SECRET: &str = "s3cret";

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl NotificationHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, _event: &StreamEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("handler blew up");
            }
            if self.fail {
                return Err("capture could not start".into());
            }
            Ok(())
        }
    }

    fn gateway(handler: Arc<Counting>) -> Arc<Gateway> {
        let hub = Arc::new(FakeHub::with_users(&[("42", "somechannel")]));
        let subscriptions = Arc::new(SubscriptionManager::new(
            hub,
            "https://example.net",
            SECRET,
            86400,
        ));
        let mut handlers = HandlerRegistry::new();
        handlers.register(ChannelKey::Id(42), handler);
        Arc::new(Gateway::new(
            SECRET,
            "https://example.net",
            86400,
            subscriptions,
            handlers,
        ))
    }

    fn live_body(stream_id: &str, user_id: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "data": [{
                "id": stream_id,
                "user_id": user_id,
                "user_name": "SomeChannel",
                "game_id": "509658",
                "type": "live",
                "title": "testing",
                "viewer_count": 17,
                "started_at": "2021-03-01T20:15:00Z",
            }]
        }))
        .unwrap()
    }

    fn signed(body: &[u8]) -> String {
        format!("sha256={}", sign(SECRET.as_bytes(), body))
    }

    fn post(id: Option<&str>, signature: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/webhook/stream_changed/42");
        if let Some(id) = id {
            req = req.header(NOTIFICATION_ID_HEADER, id);
        }
        if let Some(signature) = signature {
            req = req.header(SIGNATURE_HEADER, signature);
        }
        req.body(Body::from(body)).unwrap()
    }

    #[test]
    fn signature_detects_single_bit_changes() {
        let secret = SECRET.as_bytes();
        let live = live_body("1", "42");
        for body in [&b"{}"[..], &b"hello world"[..], &live[..]] {
            let header = signed(body);
            assert!(verify_signature(secret, body, &header));
            assert!(verify_signature(secret, body, &sign(secret, body)));

            for bit in 0..(body.len() * 8).min(256) {
                let mut tampered = body.to_vec();
                tampered[bit / 8] ^= 1 << (bit % 8);
                assert!(!verify_signature(secret, &tampered, &header));
            }

            let digest = hex::decode(sign(secret, body)).unwrap();
            for bit in 0..digest.len() * 8 {
                let mut tampered = digest.clone();
                tampered[bit / 8] ^= 1 << (bit % 8);
                let header = format!("sha256={}", hex::encode(tampered));
                assert!(!verify_signature(secret, body, &header));
            }
        }
    }

    #[test]
    fn garbage_signatures_are_rejected() {
        assert!(!verify_signature(b"k", b"body", "sha256=zz"));
        assert!(!verify_signature(b"k", b"body", ""));
        assert!(!verify_signature(b"k", b"body", "sha256="));
    }

    #[test]
    fn events_accept_string_counts() {
        let event = StreamEvent::from_value(serde_json::json!({
            "id": "1",
            "user_id": "42",
            "user_name": "SomeChannel",
            "viewer_count": "1234",
        }))
        .unwrap();
        assert_eq!(event.viewer_count, Some(1234));
        assert_eq!(event.login(), "somechannel");
        assert_eq!(event.raw["user_name"], "SomeChannel");
    }

    #[tokio::test]
    async fn replayed_notification_runs_handler_once() {
        let handler = Arc::new(Counting::default());
        let gateway = gateway(handler.clone());
        let body = live_body("1001", "42");

        let first = gateway.process("42", &signed(&body), "n-1", &body).await.unwrap();
        let second = gateway.process("42", &signed(&body), "n-1", &body).await.unwrap();

        assert_eq!(first, Outcome::Dispatched);
        assert_eq!(second, Outcome::Duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_stream_is_handled_once() {
        let handler = Arc::new(Counting::default());
        let gateway = gateway(handler.clone());
        let body = live_body("1001", "42");

        gateway.process("42", &signed(&body), "n-1", &body).await.unwrap();
        let again = gateway.process("42", &signed(&body), "n-2", &body).await.unwrap();

        assert_eq!(again, Outcome::AlreadyHandling);
        assert!(gateway.is_in_progress("1001"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_signature_is_forbidden_and_not_remembered() {
        let handler = Arc::new(Counting::default());
        let gateway = gateway(handler.clone());
        let body = live_body("1001", "42");

        let res = router(gateway.clone())
            .oneshot(post(Some("n-1"), Some("sha256=00ff"), body.clone()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert!(!gateway.is_seen("n-1"));

        let res = router(gateway)
            .oneshot(post(Some("n-1"), Some(&signed(&body)), body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_headers_are_rejected() {
        let gateway = gateway(Arc::new(Counting::default()));
        let body = live_body("1001", "42");

        let res = router(gateway.clone())
            .oneshot(post(None, Some(&signed(&body)), body.clone()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = router(gateway)
            .oneshot(post(Some("n-1"), None, body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_signature_check() {
        let handler = Arc::new(Counting::default());
        let gateway = gateway(handler.clone());
        let body = vec![b' '; MAX_BODY + 1];

        // a wrong signature would be 403, so 413 proves the size check came first
        let res = router(gateway.clone())
            .oneshot(post(Some("n-1"), Some("sha256=00"), body.clone()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let mut req = post(Some("n-2"), Some("sha256=00"), Vec::new());
        req.headers_mut()
            .insert("content-length", (MAX_BODY + 1).to_string().parse().unwrap());
        let res = router(gateway.clone()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

        assert!(matches!(
            gateway.process("42", "sha256=00", "n-3", &body).await,
            Err(NotificationError::PayloadTooLarge)
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn offline_and_unknown_channels_are_acknowledged() {
        let handler = Arc::new(Counting::default());
        let gateway = gateway(handler.clone());

        let offline = br#"{"data":[]}"#.to_vec();
        let outcome = gateway
            .process("42", &signed(&offline), "n-1", &offline)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Offline);

        let unknown = live_body("2002", "77");
        let outcome = gateway
            .process("77", &signed(&unknown), "n-2", &unknown)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoHandler);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_handlers_still_get_204() {
        for handler in [
            Counting {
                fail: true,
                ..Default::default()
            },
            Counting {
                panic: true,
                ..Default::default()
            },
        ] {
            let handler = Arc::new(handler);
            let gateway = gateway(handler.clone());
            let body = live_body("1001", "42");

            let res = router(gateway)
                .oneshot(post(Some("n-1"), Some(&signed(&body)), body))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::NO_CONTENT);
            assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn live_events_are_dumped_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::new(FakeHub::default()),
            "https://example.net",
            SECRET,
            86400,
        ));
        let gateway = Gateway::new(
            SECRET,
            "https://example.net",
            86400,
            subscriptions,
            HandlerRegistry::new(),
        )
        .with_dump_dir(dir.path().to_path_buf());
        let body = live_body("1001", "42");

        let outcome = gateway.process("42", &signed(&body), "n-1", &body).await.unwrap();
        assert_eq!(outcome, Outcome::NoHandler);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().into_owned();
        let pattern = regex::Regex::new(r"^somechannel-\d{6}\.\d{6}\.json$").unwrap();
        assert!(pattern.is_match(&name), "{}", name);

        let dumped: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&entries[0]).unwrap()).unwrap();
        assert_eq!(dumped["id"], "1001");
        assert_eq!(dumped["type"], "live");
        assert_eq!(dumped["viewer_count"], 17);
    }

    #[tokio::test]
    async fn verification_echoes_challenge_and_activates() {
        let gateway = gateway(Arc::new(Counting::default()));
        let uri = "/webhook/stream_changed/42?hub.mode=subscribe\
                   &hub.topic=https%3A%2F%2Fapi.twitch.tv%2Fhelix%2Fstreams%3Fuser_id%3D42\
                   &hub.lease_seconds=864000&hub.challenge=pa55word";

        let res = router(gateway.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"pa55word");

        let sub = gateway.subscriptions.subscription("42").expect("subscription recorded");
        assert_eq!(sub.state, SubscriptionState::Active);
        assert_eq!(sub.request.topic, "https://api.twitch.tv/helix/streams?user_id=42");
        gateway.subscriptions.close();
    }

    #[tokio::test]
    async fn unsubscribe_confirmation_is_not_registered() {
        let gateway = gateway(Arc::new(Counting::default()));
        let uri = "/webhook/stream_changed/42?hub.mode=unsubscribe\
                   &hub.topic=https%3A%2F%2Fapi.twitch.tv%2Fhelix%2Fstreams%3Fuser_id%3D42\
                   &hub.challenge=bye";

        let res = router(gateway.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"bye");
        assert!(gateway.subscriptions.subscription("42").is_none());
    }

    #[tokio::test]
    async fn verification_without_topic_or_challenge() {
        let gateway = gateway(Arc::new(Counting::default()));

        let res = router(gateway.clone())
            .oneshot(
                Request::get("/webhook/stream_changed/42?hub.challenge=x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = router(gateway.clone())
            .oneshot(
                Request::get("/webhook/stream_changed/42?hub.mode=denied&hub.topic=t&hub.reason=unauthorized")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(gateway.subscriptions.subscription("42").is_none());
    }
}
