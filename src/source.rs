//! Where live bytes come from.

use std::{
    future::Future,
    io,
    pin::Pin,
    process::{ExitStatus, Stdio},
    task::{ready, Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, ReadBuf},
    process::{ChildStdout, Command},
};

use crate::{
    ffmpeg::{run_tool, FfmpegError},
    worker::CaptureError,
};

pub type LiveReader = Box<dyn AsyncRead + Send + Unpin>;

pub fn channel_url(login: &str) -> String {
    format!("https://twitch.tv/{}", login.to_lowercase())
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Direct media URL for `quality`, or `None` when that quality isn't offered.
    async fn resolve(&self, channel_url: &str, quality: &str) -> Result<Option<String>, CaptureError>;

    /// A byte stream of the live broadcast in `quality`.
    async fn open(&self, channel_url: &str, quality: &str) -> Result<LiveReader, CaptureError>;
}

/// Resolves and reads streams through the `streamlink` command.
pub struct Streamlink {
    program: String,
    resolve_timeout: Duration,
}

impl Streamlink {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            resolve_timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl StreamSource for Streamlink {
    async fn resolve(&self, channel_url: &str, quality: &str) -> Result<Option<String>, CaptureError> {
        let args = [
            "--stream-url".to_string(),
            channel_url.to_string(),
            quality.to_string(),
        ];
        match run_tool(&self.program, &args, None, Some(self.resolve_timeout)).await {
            Ok(stdout) => {
                let url = String::from_utf8_lossy(&stdout).trim().to_string();
                Ok(url.starts_with("http").then_some(url))
            }
            Err(FfmpegError::Exit { stderr, .. }) => {
                debug!("No {} stream for {}: {}", quality, channel_url, stderr.trim());
                Ok(None)
            }
            Err(FfmpegError::Timeout { after, .. }) => {
                warn!("Resolving {} timed out after {:?}", channel_url, after);
                Ok(None)
            }
            Err(e) => Err(CaptureError::Source(e.to_string())),
        }
    }

    async fn open(&self, channel_url: &str, quality: &str) -> Result<LiveReader, CaptureError> {
        let mut child = Command::new(&self.program)
            .args(["--stdout", channel_url, quality])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Source(format!("Could not start {}: {}", self.program, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Source("stdout was not captured".into()))?;
        Ok(Box::new(ChildReader {
            program: self.program.clone(),
            stdout,
            exit: Some(Box::pin(async move { child.wait().await })),
        }))
    }
}

type ExitFuture = Pin<Box<dyn Future<Output = io::Result<ExitStatus>> + Send>>;

/// Reads the child's stdout. Once the pipe closes the child is reaped, and a
/// failed exit surfaces as a read error instead of a clean end of stream.
struct ChildReader {
    program: String,
    stdout: ChildStdout,
    exit: Option<ExitFuture>,
}

impl AsyncRead for ChildReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let filled = buf.filled().len();
        ready!(Pin::new(&mut self.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > filled || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let Some(exit) = self.exit.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let status = ready!(exit.as_mut().poll(cx));
        self.exit = None;
        match status? {
            status if status.success() => Poll::Ready(Ok(())),
            status => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} exited with {}", self.program, status),
            ))),
        }
    }
}
