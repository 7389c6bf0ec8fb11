//! Joining a freshly captured head onto pre-existing tail segments.
//!
//! The tail segments were recorded independently, so the head is recorded a
//! little past the point where the first tail starts, the exact overlap is
//! found by audio correlation, and the head is cut there before everything
//! is concatenated without re-encoding.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use tokio_stream::wrappers::ReadDirStream;

use crate::{
    ffmpeg::{run_tool, Ffmpeg, FfmpegError, MediaTool},
    hls::{self, PlaylistError},
    source::StreamSource,
    util::HttpClient,
    worker::{open_stream, CaptureError},
};

#[derive(thiserror::Error, Debug)]
pub enum StitchError {
    #[error("No {suffix} segments in {}", .dir.display())]
    NoSegments { dir: PathBuf, suffix: String },
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("Subprocess failed")]
    Subprocess(#[from] FfmpegError),
    #[error("Could not parse offset finder output: {0:?}")]
    OffsetParse(String),
    #[error("Could not record head")]
    Capture(#[from] CaptureError),
    #[error("Could not prepare head playlist")]
    Playlist(#[from] PlaylistError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offset {
    pub seconds: f64,
    pub score: f64,
}

fn offset_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)Offset:\s*(-?[\d.]+).*?score:\s*(-?[\d.]+)").expect("valid regex")
    })
}

/// Reads `Offset: 58.12 (seconds)` / `Standard score: 21.3` output.
pub fn parse_offset(output: &str) -> Option<Offset> {
    let captures = offset_pattern().captures(output)?;
    Some(Offset {
        seconds: captures.get(1)?.as_str().parse().ok()?,
        score: captures.get(2)?.as_str().parse().ok()?,
    })
}

#[async_trait]
pub trait OffsetFinder: Send + Sync {
    /// Where in `within` the audio of `needle` begins.
    async fn find_offset(&self, within: &Path, needle: &Path) -> Result<Offset, StitchError>;
}

/// Runs the `audio-offset-finder` command.
pub struct AudioOffsetFinder {
    program: String,
    timeout: Duration,
}

impl AudioOffsetFinder {
    pub fn new(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl OffsetFinder for AudioOffsetFinder {
    async fn find_offset(&self, within: &Path, needle: &Path) -> Result<Offset, StitchError> {
        let args = [
            "--find-offset-of".to_string(),
            needle.to_string_lossy().into_owned(),
            "--within".to_string(),
            within.to_string_lossy().into_owned(),
        ];
        let stdout = run_tool(&self.program, &args, None, Some(self.timeout)).await?;
        let text = String::from_utf8_lossy(&stdout);
        parse_offset(&text).ok_or_else(|| StitchError::OffsetParse(text.into_owned()))
    }
}

#[async_trait]
pub trait HeadRecorder: Send + Sync {
    /// Stream-copies the head into `output`, stopping at `outpoint` seconds.
    async fn record(&self, output: &Path, outpoint: f64) -> Result<(), StitchError>;
}

/// Records the head from a channel that is live right now.
pub struct LiveHead {
    pub source: Arc<dyn StreamSource>,
    pub ffmpeg: Ffmpeg,
    pub channel_url: String,
    pub qualities: Vec<String>,
}

#[async_trait]
impl HeadRecorder for LiveHead {
    async fn record(&self, output: &Path, outpoint: f64) -> Result<(), StitchError> {
        let stream = open_stream(&*self.source, &self.channel_url, &self.qualities).await?;
        info!("Recording head from {} ({}) until {:.3}s", self.channel_url, stream.quality, outpoint);
        self.ffmpeg.record_until(&stream.url, outpoint, output).await?;
        Ok(())
    }
}

/// Records the head from an archived playlist, normalized first.
pub struct PlaylistHead {
    pub http: HttpClient,
    pub ffmpeg: Ffmpeg,
    pub playlist_url: String,
    pub extended: bool,
}

#[async_trait]
impl HeadRecorder for PlaylistHead {
    async fn record(&self, output: &Path, outpoint: f64) -> Result<(), StitchError> {
        let fetched = hls::fetch_playlist(&self.http, &self.playlist_url).await?;
        let normalized = hls::normalize(&fetched.playlist, &fetched.url, self.extended)?;
        info!("Recording head from {} until {:.3}s", fetched.url, outpoint);

        let args = ["-to".to_string(), format!("{:.3}", outpoint), "-c".into(), "copy".into()];
        self.ffmpeg
            .remux_playlist(&hls::to_string(&normalized)?, output, &args)
            .await?;
        Ok(())
    }
}

/// Files in `dir` ending in `suffix`, in file name order.
pub async fn tail_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, std::io::Error> {
    let dir = tokio::fs::canonicalize(dir).await?;
    let extension = suffix.trim_start_matches('.');
    let mut entries = ReadDirStream::new(tokio::fs::read_dir(&dir).await?);

    let mut files = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().await?.is_file()
            && path.extension().is_some_and(|e| e == extension)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone)]
pub struct StitchReport {
    pub start: f64,
    pub outpoint: f64,
    pub offset: Offset,
    pub tails: Vec<PathBuf>,
}

fn logged(context: &str, e: FfmpegError) -> StitchError {
    error!("Error {}: {}", context, e);
    if let Some(stderr) = e.stderr() {
        error!("{}", stderr);
    }
    e.into()
}

pub struct Stitcher {
    tool: Arc<dyn MediaTool>,
    offsets: Arc<dyn OffsetFinder>,
    overlap: f64,
    suffix: String,
}

impl Stitcher {
    pub fn new(tool: Arc<dyn MediaTool>, offsets: Arc<dyn OffsetFinder>, overlap: f64, suffix: &str) -> Self {
        Self {
            tool,
            offsets,
            overlap,
            suffix: suffix.to_string(),
        }
    }

    /// Writes `trim(head, offset) ++ tails` to `output`.
    ///
    /// Intermediate files live in a temporary directory. A failed concat may
    /// leave a partial `output` behind.
    pub async fn stitch(
        &self,
        head: &dyn HeadRecorder,
        segment_dir: &Path,
        output: &Path,
    ) -> Result<StitchReport, StitchError> {
        let tails = tail_files(segment_dir, &self.suffix).await?;
        let Some(first) = tails.first() else {
            return Err(StitchError::NoSegments {
                dir: segment_dir.to_path_buf(),
                suffix: self.suffix.clone(),
            });
        };
        info!("Found {} segments, first is {}", tails.len(), first.display());

        let start = self
            .tool
            .start_time(first)
            .await
            .map_err(|e| logged("probing first segment", e))?;
        let outpoint = start + self.overlap;

        let workdir = tempfile::tempdir()?;
        let head_path = workdir.path().join("head.mts");
        head.record(&head_path, outpoint).await?;

        let offset = self.offsets.find_offset(&head_path, first).await?;
        info!("Offset: {}s (score {})", offset.seconds, offset.score);

        let trimmed = workdir.path().join("trimmed.mts");
        self.tool
            .trim(&head_path, offset.seconds, &trimmed)
            .await
            .map_err(|e| logged("trimming head", e))?;

        let mut inputs = vec![trimmed];
        inputs.extend(tails.iter().cloned());
        self.tool
            .concat(&inputs, output)
            .await
            .map_err(|e| logged("concatenating files", e))?;

        info!("Wrote {}", output.display());
        Ok(StitchReport {
            start,
            outpoint,
            offset,
            tails,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;

    /// Tracks the duration every file would have.
    #[derive(Default)]
    struct FakeTool {
        start: f64,
        durations: Mutex<HashMap<PathBuf, f64>>,
        fail_concat: bool,
    }

    impl FakeTool {
        fn set(&self, path: &Path, duration: f64) {
            self.durations.lock().unwrap().insert(path.to_path_buf(), duration);
        }

        fn duration(&self, path: &Path) -> f64 {
            self.durations.lock().unwrap().get(path).copied().unwrap_or(0.0)
        }
    }

    #[async_trait]
    impl MediaTool for FakeTool {
        async fn start_time(&self, _file: &Path) -> Result<f64, FfmpegError> {
            Ok(self.start)
        }

        async fn trim(&self, input: &Path, to: f64, output: &Path) -> Result<(), FfmpegError> {
            self.set(output, self.duration(input).min(to));
            Ok(())
        }

        async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError> {
            if self.fail_concat {
                return Err(FfmpegError::Exit {
                    program: "ffmpeg".into(),
                    code: Some(1),
                    stderr: "Invalid data found when processing input".into(),
                });
            }
            let total = inputs.iter().map(|p| self.duration(p)).sum();
            self.set(output, total);
            Ok(())
        }
    }

    struct FakeHead {
        tool: Arc<FakeTool>,
        available: f64,
        outpoints: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl HeadRecorder for FakeHead {
        async fn record(&self, output: &Path, outpoint: f64) -> Result<(), StitchError> {
            self.outpoints.lock().unwrap().push(outpoint);
            self.tool.set(output, self.available.min(outpoint));
            Ok(())
        }
    }

    struct FixedOffset(f64);

    #[async_trait]
    impl OffsetFinder for FixedOffset {
        async fn find_offset(&self, _within: &Path, _needle: &Path) -> Result<Offset, StitchError> {
            Ok(Offset {
                seconds: self.0,
                score: 20.0,
            })
        }
    }

    fn segments(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        dir
    }

    #[test]
    fn offset_output() {
        let offset = parse_offset("Offset: 58.12 (seconds)\nStandard score: 21.3\n").unwrap();
        assert_eq!(offset.seconds, 58.12);
        assert_eq!(offset.score, 21.3);
        assert!(parse_offset("Traceback (most recent call last):").is_none());
    }

    #[tokio::test]
    async fn tails_are_sorted_and_filtered() {
        let dir = segments(&["b.mts", "a.mts", "notes.txt", "c.mts.part"]);
        std::fs::create_dir(dir.path().join("z.mts")).unwrap();

        let files = tail_files(dir.path(), ".mts").await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.mts", "b.mts"]);
        assert!(files.iter().all(|p| p.is_absolute()));
    }

    #[tokio::test]
    async fn head_is_trimmed_at_offset_and_joined() {
        let dir = segments(&["tail.000.mts", "tail.001.mts"]);
        let base = std::fs::canonicalize(dir.path()).unwrap();

        let tool = Arc::new(FakeTool {
            start: 5.0,
            ..Default::default()
        });
        tool.set(&base.join("tail.000.mts"), 30.0);
        tool.set(&base.join("tail.001.mts"), 30.0);

        let head = FakeHead {
            tool: tool.clone(),
            available: 65.0,
            outpoints: Mutex::new(Vec::new()),
        };
        let stitcher = Stitcher::new(tool.clone(), Arc::new(FixedOffset(58.0)), 60.0, ".mts");
        let output = dir.path().join("out.mp4");

        let report = stitcher.stitch(&head, dir.path(), &output).await.unwrap();

        assert_eq!(report.outpoint, 65.0);
        assert_eq!(*head.outpoints.lock().unwrap(), vec![65.0]);
        assert_eq!(report.tails.len(), 2);
        assert!((tool.duration(&output) - 118.0).abs() <= 1.0);
    }

    #[tokio::test]
    async fn overlap_window_is_configurable() {
        let dir = segments(&["a.mts"]);
        let tool = Arc::new(FakeTool {
            start: 1.5,
            ..Default::default()
        });
        let head = FakeHead {
            tool: tool.clone(),
            available: 500.0,
            outpoints: Mutex::new(Vec::new()),
        };
        let stitcher = Stitcher::new(tool, Arc::new(FixedOffset(10.0)), 90.0, ".mts");

        let report = stitcher
            .stitch(&head, dir.path(), &dir.path().join("out.mp4"))
            .await
            .unwrap();
        assert_eq!(report.outpoint, 91.5);
    }

    #[tokio::test]
    async fn empty_segment_dir() {
        let dir = segments(&["readme.txt"]);
        let tool = Arc::new(FakeTool::default());
        let head = FakeHead {
            tool: tool.clone(),
            available: 65.0,
            outpoints: Mutex::new(Vec::new()),
        };
        let stitcher = Stitcher::new(tool, Arc::new(FixedOffset(1.0)), 60.0, ".mts");

        let err = stitcher
            .stitch(&head, dir.path(), &dir.path().join("out.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, StitchError::NoSegments { .. }));
        assert!(head.outpoints.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concat_failure_carries_stderr() {
        let dir = segments(&["a.mts"]);
        let tool = Arc::new(FakeTool {
            fail_concat: true,
            ..Default::default()
        });
        let head = FakeHead {
            tool: tool.clone(),
            available: 65.0,
            outpoints: Mutex::new(Vec::new()),
        };
        let stitcher = Stitcher::new(tool, Arc::new(FixedOffset(1.0)), 60.0, ".mts");

        let err = stitcher
            .stitch(&head, dir.path(), &dir.path().join("out.mp4"))
            .await
            .unwrap_err();
        match err {
            StitchError::Subprocess(e) => {
                assert_eq!(e.stderr(), Some("Invalid data found when processing input"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
