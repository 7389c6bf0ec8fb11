//! Live capture workers.
//!
//! Every capture runs as its own tokio task owning the ffmpeg child. The
//! parent talks to it through two cancellation tokens (`shutdown` flows down,
//! `closing` flows up once the worker is finished) and receives log records
//! and the final result over a bounded channel.

use std::{path::PathBuf, process::ExitStatus, sync::Arc, time::Duration};

use futures::StreamExt;
use log::Level;
use serde::Deserialize;
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::ChildStderr,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::{
    codec::{AnyDelimiterCodec, FramedRead},
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{
    config::CaptureConfig,
    ffmpeg::{Container, Ffmpeg, FfmpegError, Progress},
    source::{StreamSource, Streamlink},
    stats::CaptureStats,
};

pub const CHUNK_SIZE: usize = 65536;
const EVENT_BUFFER: usize = 256;
const STDERR_TAIL: usize = 40;
const STOP_GRACE: Duration = Duration::from_secs(15);

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("No stream available for {channel} (tried {qualities:?})")]
    NoStreamAvailable {
        channel: String,
        qualities: Vec<String>,
    },
    #[error("Stream source failed: {0}")]
    Source(String),
    #[error("Gave up after {attempts} consecutive read failures: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },
    #[error("Capture was cancelled before it started")]
    Cancelled,
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("Remux failed")]
    Subprocess(#[from] FfmpegError),
    #[error("Capture worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Read the stream ourselves and pipe it through ffmpeg.
    Pipe,
    /// Hand ffmpeg the resolved URL and let it segment by wall clock.
    #[default]
    Direct,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_ms: u64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_ms: 500,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `base`, `2 * base`, `4 * base`, ... capped at `max_delay`.
    pub fn delays(&self) -> std::iter::Take<ExponentialBackoff> {
        ExponentialBackoff::from_millis(2)
            .factor(self.base_ms.div_ceil(2).max(1))
            .max_delay(self.max_delay)
            .take(self.max_retries)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub channel: String,
    pub url: String,
    pub output: PathBuf,
    pub qualities: Vec<String>,
    pub mode: CaptureMode,
    pub container: Container,
}

#[derive(Debug)]
pub enum CaptureEvent {
    Log {
        level: Level,
        target: &'static str,
        message: String,
    },
    Done(CaptureStats),
    Error(String),
}

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<CaptureEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<CaptureEvent>) -> Self {
        Self { tx }
    }

    pub async fn log(&self, level: Level, target: &'static str, message: impl Into<String>) {
        self.send(CaptureEvent::Log {
            level,
            target,
            message: message.into(),
        })
        .await
    }

    async fn send(&self, event: CaptureEvent) {
        // The parent may have stopped listening; the worker carries on regardless
        let _ = self.tx.send(event).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStream {
    pub quality: String,
    pub url: String,
}

/// Tries each quality in order and returns the first one the source offers.
pub async fn open_stream(
    source: &dyn StreamSource,
    channel_url: &str,
    qualities: &[String],
) -> Result<ResolvedStream, CaptureError> {
    for quality in qualities {
        match source.resolve(channel_url, quality).await? {
            Some(url) => {
                return Ok(ResolvedStream {
                    quality: quality.clone(),
                    url,
                })
            }
            None => debug!("{} is not offering {}", channel_url, quality),
        }
    }
    Err(CaptureError::NoStreamAvailable {
        channel: channel_url.to_string(),
        qualities: qualities.to_vec(),
    })
}

/// Copies the live stream into `sink` in [`CHUNK_SIZE`] reads until it ends
/// or `shutdown` fires.
///
/// A failed read reopens the stream after a backoff delay. The retry budget
/// is consecutive: every successful read restores it.
pub async fn pump<W>(
    source: &dyn StreamSource,
    stream: &ResolvedStream,
    channel_url: &str,
    sink: &mut W,
    retry: &RetryPolicy,
    shutdown: &CancellationToken,
    events: &EventSink,
) -> Result<CaptureStats, CaptureError>
where
    W: AsyncWrite + Unpin,
{
    let mut stats = CaptureStats::new();
    let mut reader = source.open(channel_url, &stream.quality).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut delays = retry.delays();

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => {
                events.log(Level::Info, "capture", "Shutdown requested, finalizing").await;
                break;
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                events.log(Level::Info, "capture", "Stream ended").await;
                break;
            }
            Ok(n) => {
                sink.write_all(&buf[..n]).await?;
                stats.record(n);
                delays = retry.delays();
            }
            Err(e) => {
                let mut last_error = e.to_string();
                reader = loop {
                    let Some(delay) = delays.next() else {
                        return Err(CaptureError::RetriesExhausted {
                            attempts: retry.max_retries,
                            last_error,
                        });
                    };
                    stats.reconnects += 1;
                    events
                        .log(
                            Level::Warn,
                            "capture",
                            format!("Read failed ({}), reopening in {:?}", last_error, delay),
                        )
                        .await;
                    tokio::time::sleep(delay).await;

                    match source.open(channel_url, &stream.quality).await {
                        Ok(reader) => break reader,
                        Err(e) => last_error = e.to_string(),
                    }
                };
            }
        }
    }

    sink.flush().await?;
    Ok(stats)
}

/// Forwards ffmpeg's stderr as events, split on both `\r` and `\n` so
/// progress updates arrive one at a time. Returns the last diagnostic lines
/// and the most recent progress report.
async fn relay_stderr(stderr: ChildStderr, events: EventSink) -> (Vec<String>, Option<Progress>) {
    let mut lines = FramedRead::new(stderr, AnyDelimiterCodec::new(b"\r\n".to_vec(), b"\n".to_vec()));
    let mut tail = Vec::new();
    let mut progress = None;

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => String::from_utf8_lossy(&line).trim().to_string(),
            Err(e) => {
                events.log(Level::Debug, "ffmpeg", format!("stderr closed: {}", e)).await;
                break;
            }
        };
        if line.is_empty() {
            continue;
        }

        if let Some(p) = Progress::parse(&line) {
            events.log(Level::Debug, "ffmpeg", p.to_string()).await;
            progress = Some(p);
        } else {
            events.log(Level::Info, "ffmpeg", line.as_str()).await;
            if tail.len() == STDERR_TAIL {
                tail.remove(0);
            }
            tail.push(line);
        }
    }

    (tail, progress)
}

fn check_exit(program: &str, status: ExitStatus, tail: &[String]) -> Result<(), FfmpegError> {
    if status.success() {
        return Ok(());
    }
    Err(FfmpegError::Exit {
        program: program.to_string(),
        code: status.code(),
        stderr: tail.join("\n"),
    })
}

struct Worker {
    source: Arc<dyn StreamSource>,
    ffmpeg: Ffmpeg,
    retry: RetryPolicy,
    resolve_attempts: usize,
    session: CaptureSession,
    events: EventSink,
    shutdown: CancellationToken,
    closing: CancellationToken,
}

impl Worker {
    async fn run(self) -> Result<CaptureStats, CaptureError> {
        // Set on every exit path, including a panic
        let _closing = self.closing.clone().drop_guard();

        self.events
            .log(
                Level::Info,
                "capture",
                format!("Capturing {} to {}", self.session.url, self.session.output.display()),
            )
            .await;

        let result = match self.session.mode {
            CaptureMode::Pipe => self.run_pipe().await,
            CaptureMode::Direct => self.run_direct().await,
        };

        match &result {
            Ok(stats) => self.events.send(CaptureEvent::Done(stats.clone())).await,
            Err(e) => self.events.send(CaptureEvent::Error(e.to_string())).await,
        }
        result
    }

    async fn resolve(&self) -> Result<ResolvedStream, CaptureError> {
        let mut delays = self.retry.delays();
        let mut attempt = 1;
        loop {
            match open_stream(&*self.source, &self.session.url, &self.session.qualities).await {
                Err(CaptureError::NoStreamAvailable { .. }) if attempt < self.resolve_attempts => {
                    let delay = delays.next().unwrap_or(self.retry.max_delay);
                    self.events
                        .log(
                            Level::Warn,
                            "capture",
                            format!(
                                "No stream yet (attempt {}/{}), retrying in {:?}",
                                attempt, self.resolve_attempts, delay
                            ),
                        )
                        .await;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(CaptureError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Ok(stream) => {
                    self.events
                        .log(
                            Level::Info,
                            "capture",
                            format!("Selected {} stream", stream.quality),
                        )
                        .await;
                    return Ok(stream);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_ffmpeg(&self, args: &[String]) -> Result<tokio::process::Child, FfmpegError> {
        self.ffmpeg
            .capture_command(args)
            .spawn()
            .map_err(|source| FfmpegError::Spawn {
                program: self.ffmpeg.ffmpeg.clone(),
                source,
            })
    }

    fn spawn_relay(
        &self,
        stderr: Option<ChildStderr>,
    ) -> JoinHandle<(Vec<String>, Option<Progress>)> {
        let events = self.events.clone();
        tokio::spawn(async move {
            match stderr {
                Some(stderr) => relay_stderr(stderr, events).await,
                None => (Vec::new(), None),
            }
        })
    }

    async fn run_pipe(&self) -> Result<CaptureStats, CaptureError> {
        let stream = self.resolve().await?;
        let args = Ffmpeg::pipe_args(&self.session.output, self.session.container);
        let mut child = self.spawn_ffmpeg(&args)?;
        let relay = self.spawn_relay(child.stderr.take());

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Source("ffmpeg stdin was not captured".into()))?;
        let pumped = pump(
            &*self.source,
            &stream,
            &self.session.url,
            &mut stdin,
            &self.retry,
            &self.shutdown,
            &self.events,
        )
        .await;
        // EOF lets ffmpeg write the trailer
        drop(stdin);

        let status = child.wait().await?;
        let (tail, _) = relay.await.unwrap_or_default();
        check_exit(&self.ffmpeg.ffmpeg, status, &tail)?;

        let stats = pumped?;
        self.events.log(Level::Info, "capture", stats.summary()).await;
        Ok(stats)
    }

    async fn run_direct(&self) -> Result<CaptureStats, CaptureError> {
        let stream = self.resolve().await?;
        let args = Ffmpeg::segment_args(&stream.url, &self.session.output, self.session.container);
        let mut child = self.spawn_ffmpeg(&args)?;
        let relay = self.spawn_relay(child.stderr.take());
        let mut stdin = child.stdin.take();

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = self.shutdown.cancelled() => {
                self.events.log(Level::Info, "capture", "Shutdown requested, stopping ffmpeg").await;
                if let Some(stdin) = stdin.as_mut() {
                    let _ = stdin.write_all(b"q").await;
                }
                match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        child.kill().await?;
                        child.wait().await?
                    }
                }
            }
        };

        let (tail, progress) = relay.await.unwrap_or_default();
        check_exit(&self.ffmpeg.ffmpeg, status, &tail)?;

        let mut stats = CaptureStats::new();
        if let Some(size) = progress.and_then(|p| p.size_bytes) {
            stats.bytes_written = size;
        }
        self.events.log(Level::Info, "capture", stats.summary()).await;
        Ok(stats)
    }
}

/// The parent's side of a running capture.
pub struct CaptureHandle {
    pub channel: String,
    shutdown: CancellationToken,
    closing: CancellationToken,
    events: mpsc::Receiver<CaptureEvent>,
    task: JoinHandle<Result<CaptureStats, CaptureError>>,
}

impl CaptureHandle {
    /// Asks the worker to finalize its output and exit.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub async fn next_event(&mut self) -> Option<CaptureEvent> {
        self.events.recv().await
    }

    /// Logs every event the worker sends, then returns its result.
    pub async fn wait(mut self) -> Result<CaptureStats, CaptureError> {
        while let Some(event) = self.events.recv().await {
            match event {
                CaptureEvent::Log {
                    level,
                    target,
                    message,
                } => log!(target: target, level, "[{}] {}", self.channel, message),
                CaptureEvent::Done(stats) => {
                    info!("[{}] Capture finished: {}", self.channel, stats.summary())
                }
                CaptureEvent::Error(e) => error!("[{}] Capture failed: {}", self.channel, e),
            }
        }

        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(CaptureError::Panicked(e.to_string())),
        }
    }
}

pub struct CaptureSupervisor {
    source: Arc<dyn StreamSource>,
    ffmpeg: Ffmpeg,
    retry: RetryPolicy,
    resolve_attempts: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl CaptureSupervisor {
    pub fn new(
        source: Arc<dyn StreamSource>,
        ffmpeg: Ffmpeg,
        retry: RetryPolicy,
        resolve_attempts: usize,
    ) -> Self {
        Self {
            source,
            ffmpeg,
            retry,
            resolve_attempts: resolve_attempts.max(1),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            base_ms: config.retry_base_ms,
            ..Default::default()
        };
        Self::new(
            Arc::new(Streamlink::new(&config.streamlink)),
            Ffmpeg::new(&config.ffmpeg, &config.ffprobe),
            retry,
            config.resolve_attempts,
        )
    }

    pub fn source(&self) -> Arc<dyn StreamSource> {
        self.source.clone()
    }

    pub fn start(&self, session: CaptureSession) -> CaptureHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let shutdown = self.shutdown.child_token();
        let closing = CancellationToken::new();
        let channel = session.channel.clone();

        let worker = Worker {
            source: self.source.clone(),
            ffmpeg: self.ffmpeg.clone(),
            retry: self.retry.clone(),
            resolve_attempts: self.resolve_attempts,
            session,
            events: EventSink::new(tx),
            shutdown: shutdown.clone(),
            closing: closing.clone(),
        };

        CaptureHandle {
            channel,
            shutdown,
            closing,
            events: rx,
            task: self.tasks.spawn(worker.run()),
        }
    }

    /// Logs the capture's events in the background until it finishes.
    pub fn detach(&self, handle: CaptureHandle) {
        self.tasks.spawn(async move {
            let channel = handle.channel.clone();
            if let Err(e) = handle.wait().await {
                error!("Capture of {} ended with an error: {}", channel, e);
            }
        });
    }

    /// Stops every capture started by this supervisor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits until every capture and detached handle has finished.
    pub async fn stopped(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!("Waiting for {} capture task(s) to finish", self.tasks.len());
        }
        self.tasks.wait().await;
    }
}
