use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command};

/// Lets ffmpeg read segment URIs out of a playlist fed through stdin.
const PROTOCOL_WHITELIST: &str = "file,http,https,tcp,tls,pipe";

#[derive(thiserror::Error, Debug)]
pub enum FfmpegError {
    #[error("Could not start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("{program} returned a non-zero exit code ({code:?})")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("Could not parse {program} output: {output:?}")]
    Parse { program: String, output: String },
}

impl FfmpegError {
    /// The diagnostic output of a failed run, if there is one.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            FfmpegError::Exit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    MpegTs,
    Mp4,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::MpegTs => "mts",
            Container::Mp4 => "mp4",
        }
    }

    fn args(&self) -> &'static [&'static str] {
        match self {
            Container::MpegTs => &["-f", "mpegts"],
            Container::Mp4 => &["-bsf:a", "aac_adtstoasc", "-f", "mp4"],
        }
    }

    fn segment_args(&self) -> &'static [&'static str] {
        match self {
            Container::MpegTs => &["-segment_format", "mpegts"],
            Container::Mp4 => &["-bsf:a", "aac_adtstoasc", "-segment_format", "mp4"],
        }
    }
}

/// Runs `program` to completion and returns its stdout.
///
/// A non-zero exit becomes [`FfmpegError::Exit`] carrying stderr verbatim.
/// When `timeout` elapses the child is killed.
pub async fn run_tool(
    program: &str,
    args: &[String],
    input: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, FfmpegError> {
    debug!("Running {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| FfmpegError::Spawn {
            program: program.to_string(),
            source,
        })?;

    // Feed stdin while stdout and stderr are drained
    let writer = match (input, child.stdin.take()) {
        (Some(input), Some(mut stdin)) => {
            let input = input.to_vec();
            Some(tokio::spawn(async move {
                stdin.write_all(&input).await?;
                stdin.shutdown().await
            }))
        }
        _ => None,
    };

    let output = match timeout {
        Some(after) => tokio::time::timeout(after, child.wait_with_output())
            .await
            .map_err(|_| FfmpegError::Timeout {
                program: program.to_string(),
                after,
            })??,
        None => child.wait_with_output().await?,
    };

    if let Some(writer) = writer {
        if let Ok(Err(e)) = writer.await {
            debug!("{} closed stdin early: {}", program, e);
        }
    }

    if !output.status.success() {
        return Err(FfmpegError::Exit {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(output.stdout)
}

/// Contents of an ffmpeg concat-demuxer list file.
pub fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

/// The media operations segment stitching needs.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Start timestamp embedded in the container, in seconds.
    async fn start_time(&self, file: &Path) -> Result<f64, FfmpegError>;

    /// Stream-copies `input` up to `to` seconds into `output`.
    async fn trim(&self, input: &Path, to: f64, output: &Path) -> Result<(), FfmpegError>;

    /// Losslessly concatenates `inputs` in order into `output`.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError>;
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub probe_timeout: Option<Duration>,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Ffmpeg {
    pub fn new(ffmpeg: &str, ffprobe: &str) -> Self {
        Self {
            ffmpeg: ffmpeg.to_string(),
            ffprobe: ffprobe.to_string(),
            probe_timeout: None,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Remux whatever arrives on stdin into `output`.
    pub fn pipe_args(output: &Path, container: Container) -> Vec<String> {
        let mut args = strings(&["-y", "-hide_banner", "-i", "pipe:0", "-c", "copy"]);
        args.extend(strings(container.args()));
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Read `url` directly and cut it into wall-clock named segments next to
    /// `output`, e.g. `name.20210301.201500.mts`.
    pub fn segment_args(url: &str, output: &Path, container: Container) -> Vec<String> {
        let mut args = strings(&["-y", "-hide_banner", "-protocol_whitelist", PROTOCOL_WHITELIST]);
        args.extend(["-i".to_string(), url.to_string()]);
        args.extend(strings(&["-strftime", "1", "-f", "ssegment", "-c", "copy", "-copyts"]));
        args.extend(strings(container.segment_args()));
        args.push(segment_pattern(output, container));
        args
    }

    /// A long-running capture child: stdin and stderr piped, killed with its handle.
    pub fn capture_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Stream-copies `url` into `output`, stopping at `to` seconds.
    pub async fn record_until(&self, url: &str, to: f64, output: &Path) -> Result<(), FfmpegError> {
        let mut args = strings(&["-y", "-hide_banner", "-protocol_whitelist", PROTOCOL_WHITELIST]);
        args.extend(["-i".to_string(), url.to_string()]);
        args.extend(["-to".to_string(), format!("{:.3}", to)]);
        args.extend(strings(&["-c", "copy"]));
        args.push(output.to_string_lossy().into_owned());

        run_tool(&self.ffmpeg, &args, None, None).await?;
        Ok(())
    }

    /// Feeds a playlist to ffmpeg over stdin and remuxes what it references.
    pub async fn remux_playlist(
        &self,
        playlist: &str,
        output: &Path,
        output_args: &[String],
    ) -> Result<(), FfmpegError> {
        let mut args = strings(&["-y", "-hide_banner", "-protocol_whitelist", PROTOCOL_WHITELIST]);
        args.extend(strings(&["-i", "pipe:0"]));
        args.extend(output_args.iter().cloned());
        args.push(output.to_string_lossy().into_owned());

        run_tool(&self.ffmpeg, &args, Some(playlist.as_bytes()), None).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn start_time(&self, file: &Path) -> Result<f64, FfmpegError> {
        let mut args = strings(&[
            "-v",
            "error",
            "-show_entries",
            "format=start_time",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ]);
        args.push(file.to_string_lossy().into_owned());

        let stdout = run_tool(&self.ffprobe, &args, None, self.probe_timeout).await?;
        let text = String::from_utf8_lossy(&stdout);
        text.trim().parse().map_err(|_| FfmpegError::Parse {
            program: self.ffprobe.clone(),
            output: text.into_owned(),
        })
    }

    async fn trim(&self, input: &Path, to: f64, output: &Path) -> Result<(), FfmpegError> {
        let mut args = strings(&["-y", "-hide_banner", "-i"]);
        args.push(input.to_string_lossy().into_owned());
        args.extend(["-to".to_string(), format!("{:.3}", to)]);
        args.extend(strings(&["-c", "copy"]));
        args.push(output.to_string_lossy().into_owned());

        run_tool(&self.ffmpeg, &args, None, None).await?;
        Ok(())
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError> {
        let list = tempfile::Builder::new().suffix(".txt").tempfile()?;
        tokio::fs::write(list.path(), concat_list(inputs)).await?;

        let mut args = strings(&["-y", "-hide_banner", "-fflags", "+genpts"]);
        args.extend(strings(&["-f", "concat", "-safe", "0", "-i"]));
        args.push(list.path().to_string_lossy().into_owned());
        args.extend(strings(&["-movflags", "faststart", "-c", "copy"]));
        args.push(output.to_string_lossy().into_owned());

        run_tool(&self.ffmpeg, &args, None, None).await?;
        Ok(())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn segment_pattern(output: &Path, container: Container) -> String {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".to_string());
    output
        .with_file_name(format!("{}.%Y%m%d.%H%M%S.{}", stem, container.extension()))
        .to_string_lossy()
        .into_owned()
}

/// One ffmpeg status line, e.g.
/// `frame=  120 fps= 30 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.01x`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub size_bytes: Option<u64>,
    pub time_secs: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    Some(rest.split_whitespace().next().unwrap_or(rest))
}

impl Progress {
    pub fn parse(line: &str) -> Option<Progress> {
        if !line.contains("size=") || !line.contains("time=") {
            return None;
        }

        let size_bytes = field(line, "size=").and_then(|s| {
            let digits = s.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            let value: u64 = digits.parse().ok()?;
            let lower = s.to_ascii_lowercase();
            Some(if lower.ends_with("kib") || lower.ends_with("kb") {
                value * 1024
            } else if lower.ends_with("mib") || lower.ends_with("mb") {
                value * 1024 * 1024
            } else {
                value
            })
        });
        let time_secs = field(line, "time=").and_then(parse_time);
        let bitrate_kbps = field(line, "bitrate=")
            .and_then(|s| s.trim_end_matches("kbits/s").parse().ok());
        let speed = field(line, "speed=").and_then(|s| s.trim_end_matches('x').parse().ok());

        Some(Progress {
            size_bytes,
            time_secs,
            bitrate_kbps,
            speed,
        })
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} written, {:.1}s muxed",
            crate::util::format_bytes(self.size_bytes.unwrap_or(0)),
            self.time_secs.unwrap_or(0.0)
        )?;
        if let Some(speed) = self.speed {
            write!(f, " at {:.2}x", speed)?;
        }
        Ok(())
    }
}

/// `HH:MM:SS.ms` to seconds.
pub fn parse_time(time: &str) -> Option<f64> {
    let mut parts = time.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
