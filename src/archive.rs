//! Archived broadcasts: playlist, muted-audio audit, chat replay and the
//! files they are saved as.
//!
//! For an archive named `name` the output directory receives
//!
//! - `name.json`: metadata, the raw playlist and its URI, the muted table
//! - `name.m3u8` and `name.normalized.m3u8` when playlists are saved
//! - `name.chat.json` when a chat replay was fetched
//! - `name.jpg` when a thumbnail was fetched
//! - `name.mp4`, the remuxed broadcast

use std::{
    future::Future,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::{
    ffmpeg::{Ffmpeg, FfmpegError},
    hls::{self, FetchedPlaylist, MutedRange, MutedSegment, PlaylistError},
    util::{HttpClient, HttpError},
};

const PLAYLIST_KEY: &str = "_m3u";
const MUTED_KEY: &str = "_muted";
const CHAT_URL_KEY: &str = "chat_url";
const WEBPAGE_URL_KEY: &str = "webpage_url";
const THUMBNAIL_URL_KEY: &str = "thumbnail_url";

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("{} already exists (use --force to overwrite)", .0.display())]
    Exists(PathBuf),
    #[error("Archive has no playlist")]
    MissingPlaylist,
    #[error("Archive info is not a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Playlist(#[from] PlaylistError),
    #[error("Request failed")]
    Http(#[from] HttpError),
    #[error("Invalid JSON")]
    Json(#[from] serde_json::Error),
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("Remux failed")]
    Subprocess(#[from] FfmpegError),
}

impl From<reqwest::Error> for ArchiveError {
    fn from(e: reqwest::Error) -> Self {
        ArchiveError::Http(e.into())
    }
}

impl From<reqwest_middleware::Error> for ArchiveError {
    fn from(e: reqwest_middleware::Error) -> Self {
        ArchiveError::Http(e.into())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EmbeddedPlaylist {
    uri: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct MutedTable<'a> {
    segments: &'a [MutedSegment],
    ranges: &'a [MutedRange],
}

/// Layout of `name.chat.json`.
#[derive(Debug, Serialize)]
struct ChatDump<'a> {
    url: Option<&'a str>,
    comments: &'a [Value],
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatPage {
    #[serde(default)]
    pub comments: Vec<Value>,
    #[serde(rename = "_next")]
    pub next: Option<String>,
}

/// Collects every page, following the `_next` cursor until it runs out.
pub async fn paginate<F, Fut, E>(mut fetch: F) -> Result<Vec<Value>, E>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<ChatPage, E>>,
{
    let mut comments = Vec::new();
    let mut cursor = None;
    loop {
        let page = fetch(cursor).await?;
        comments.extend(page.comments);
        match page.next {
            Some(next) => cursor = Some(next),
            None => return Ok(comments),
        }
    }
}

fn ensure_writable(path: &Path, force: bool) -> Result<(), ArchiveError> {
    if !force && path.exists() {
        return Err(ArchiveError::Exists(path.to_path_buf()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Archive {
    pub name: String,
    pub info: Map<String, Value>,
    pub playlist: Option<FetchedPlaylist>,
    pub chat: Vec<Value>,
    pub muted: Vec<MutedSegment>,
    pub muted_ranges: Vec<MutedRange>,
}

impl Archive {
    pub fn new(name: &str, info: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            info,
            playlist: None,
            chat: Vec::new(),
            muted: Vec::new(),
            muted_ranges: Vec::new(),
        }
    }

    pub async fn fetch(
        http: &HttpClient,
        playlist_url: &str,
        name: &str,
        info: Map<String, Value>,
    ) -> Result<Self, ArchiveError> {
        info!("Fetching playlist {}", playlist_url);
        let mut archive = Self::new(name, info);
        archive.playlist = Some(hls::fetch_playlist(http, playlist_url).await?);
        archive.scan_for_muted();
        Ok(archive)
    }

    /// Rebuilds an archive from a previous `name.json` dump.
    pub async fn load(path: &Path) -> Result<Self, ArchiveError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json(&text, &archive_name(path))
    }

    pub fn from_json(text: &str, name: &str) -> Result<Self, ArchiveError> {
        let Value::Object(mut info) = serde_json::from_str(text)? else {
            return Err(ArchiveError::NotAnObject);
        };
        info.remove(MUTED_KEY);

        let playlist = match info.remove(PLAYLIST_KEY) {
            Some(value) => {
                let embedded: EmbeddedPlaylist = serde_json::from_value(value)?;
                let url = Url::parse(&embedded.uri).map_err(|source| PlaylistError::Uri {
                    uri: embedded.uri.clone(),
                    source,
                })?;
                Some(FetchedPlaylist {
                    url,
                    playlist: hls::parse_media(&embedded.content)?,
                    raw: embedded.content,
                })
            }
            None => None,
        };

        let mut archive = Self::new(name, info);
        archive.playlist = playlist;
        archive.scan_for_muted();
        Ok(archive)
    }

    pub fn playlist(&self) -> Result<&FetchedPlaylist, ArchiveError> {
        self.playlist.as_ref().ok_or(ArchiveError::MissingPlaylist)
    }

    pub fn scan_for_muted(&mut self) {
        let Some(fetched) = &self.playlist else {
            return;
        };
        self.muted = hls::scan_muted(&fetched.playlist);
        self.muted_ranges = hls::muted_ranges(&fetched.playlist);
        for range in &self.muted_ranges {
            warn!(
                "Muted audio from {:.1}s to {:.1}s (between {} and {})",
                range.start,
                range.end,
                range.before.as_deref().unwrap_or("start"),
                range.after.as_deref().unwrap_or("end")
            );
        }
    }

    fn info_str(&self, key: &str) -> Option<&str> {
        self.info.get(key).and_then(|v| v.as_str())
    }

    pub async fn load_chat(&mut self, http: &HttpClient) -> Result<usize, ArchiveError> {
        let Some(url) = self.info_str(CHAT_URL_KEY).map(String::from) else {
            return Ok(0);
        };
        let referer = self.info_str(WEBPAGE_URL_KEY).unwrap_or("https://www.twitch.tv").to_string();

        self.chat = paginate(|cursor| {
            let url = url.clone();
            let referer = referer.clone();
            async move {
                debug!("Downloading {} (cursor {:?})", url, cursor);
                let mut req = http
                    .client
                    .get(&url)
                    .header("Accept", "application/vnd.twitchtv.v5+json; charset=UTF-8")
                    .header("Referer", referer);
                if let Some(cursor) = cursor {
                    req = req.query(&[("cursor", cursor)]);
                }
                let text = req.send().await?.error_for_status()?.text().await?;
                Ok::<_, ArchiveError>(serde_json::from_str::<ChatPage>(&text)?)
            }
        })
        .await?;

        info!("Fetched {} chat messages", self.chat.len());
        Ok(self.chat.len())
    }

    pub async fn load_thumbnail(
        &self,
        http: &HttpClient,
        dir: &Path,
        force: bool,
    ) -> Result<Option<PathBuf>, ArchiveError> {
        let Some(url) = self.info_str(THUMBNAIL_URL_KEY) else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.jpg", self.name));
        ensure_writable(&path, force)?;
        http.download_file(url, &path).await?;
        Ok(Some(path))
    }

    pub fn to_json(&self) -> Result<Value, ArchiveError> {
        let mut info = self.info.clone();
        if let Some(fetched) = &self.playlist {
            info.insert(
                PLAYLIST_KEY.into(),
                serde_json::to_value(EmbeddedPlaylist {
                    uri: fetched.url.to_string(),
                    content: fetched.raw.clone(),
                })?,
            );
            info.insert(
                MUTED_KEY.into(),
                serde_json::to_value(MutedTable {
                    segments: &self.muted,
                    ranges: &self.muted_ranges,
                })?,
            );
        }
        Ok(Value::Object(info))
    }

    /// Writes `name.json`, plus `name.chat.json` when chat was fetched.
    pub async fn dump(&self, dir: &Path, force: bool) -> Result<PathBuf, ArchiveError> {
        let path = dir.join(format!("{}.json", self.name));
        ensure_writable(&path, force)?;
        info!("Dumping info to {}", path.display());
        tokio::fs::write(&path, serde_json::to_vec(&self.to_json()?)?).await?;

        if !self.chat.is_empty() {
            let chat_path = dir.join(format!("{}.chat.json", self.name));
            ensure_writable(&chat_path, force)?;
            let chat = ChatDump {
                url: self.info_str(WEBPAGE_URL_KEY),
                comments: &self.chat,
            };
            tokio::fs::write(&chat_path, serde_json::to_vec(&chat)?).await?;
        }
        Ok(path)
    }

    /// Writes the raw playlist and its normalized form next to each other.
    pub async fn save_playlists(
        &self,
        dir: &Path,
        extended: bool,
        force: bool,
    ) -> Result<(PathBuf, PathBuf), ArchiveError> {
        let fetched = self.playlist()?;
        let raw = dir.join(format!("{}.m3u8", self.name));
        let normalized = dir.join(format!("{}.normalized.m3u8", self.name));
        ensure_writable(&raw, force)?;
        ensure_writable(&normalized, force)?;

        tokio::fs::write(&raw, &fetched.raw).await?;
        let text = hls::to_string(&hls::normalize(&fetched.playlist, &fetched.url, extended)?)?;
        tokio::fs::write(&normalized, text).await?;
        Ok((raw, normalized))
    }

    /// Remuxes the normalized playlist into `name.mp4`.
    pub async fn remux(
        &self,
        ffmpeg: &Ffmpeg,
        dir: &Path,
        extended: bool,
        force: bool,
    ) -> Result<PathBuf, ArchiveError> {
        let fetched = self.playlist()?;
        let output = dir.join(format!("{}.mp4", self.name));
        ensure_writable(&output, force)?;

        let text = hls::to_string(&hls::normalize(&fetched.playlist, &fetched.url, extended)?)?;
        info!(
            "Downloading {} segments to {}",
            fetched.playlist.segments.len(),
            output.display()
        );
        let args: Vec<String> = ["-c", "copy", "-bsf:a", "aac_adtstoasc", "-f", "mp4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        ffmpeg.remux_playlist(&text, &output, &args).await?;
        Ok(output)
    }
}

/// `dir/name.json` gives `name`.
fn archive_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    const URI: &str = "https://vod.example.net/abc123/chunked/index-dvr.m3u8";

    fn fixture_archive() -> Archive {
        let path = format!("{}/resources/test/vod.m3u8", env!("CARGO_MANIFEST_DIR"));
        let raw = std::fs::read_to_string(path).unwrap();
        let mut info = Map::new();
        info.insert("title".into(), "A long stream".into());
        let mut archive = Archive::new("vod-210301", info);
        archive.playlist = Some(FetchedPlaylist {
            url: Url::parse(URI).unwrap(),
            playlist: hls::parse_media(&raw).unwrap(),
            raw,
        });
        archive.scan_for_muted();
        archive
    }

    #[tokio::test]
    async fn pages_follow_cursor() {
        let mut pages: VecDeque<ChatPage> = VecDeque::from(vec![
            ChatPage {
                comments: vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 2})],
                next: Some("c1".into()),
            },
            ChatPage {
                comments: vec![serde_json::json!({"id": 3})],
                next: None,
            },
        ]);
        let mut cursors = Vec::new();

        let comments = paginate(|cursor| {
            cursors.push(cursor);
            let page = pages.pop_front().unwrap_or_default();
            async move { Ok::<_, ArchiveError>(page) }
        })
        .await
        .unwrap();

        assert_eq!(comments.len(), 3);
        assert_eq!(cursors, vec![None, Some("c1".to_string())]);
    }

    #[test]
    fn chat_page_shape() {
        let page: ChatPage =
            serde_json::from_str(r#"{"comments":[{"_id":"x"}],"_next":"abc"}"#).unwrap();
        assert_eq!(page.comments.len(), 1);
        assert_eq!(page.next.as_deref(), Some("abc"));
    }

    #[test]
    fn json_embeds_playlist_and_muted_table() {
        let archive = fixture_archive();
        let json = archive.to_json().unwrap();

        assert_eq!(json["title"], "A long stream");
        assert_eq!(json[PLAYLIST_KEY]["uri"], URI);
        assert!(json[PLAYLIST_KEY]["content"]
            .as_str()
            .unwrap()
            .contains("2-muted.ts"));
        assert_eq!(json[MUTED_KEY]["segments"].as_array().unwrap().len(), 3);
        assert_eq!(json[MUTED_KEY]["ranges"][0]["before"], "1.ts");
    }

    #[tokio::test]
    async fn dump_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = fixture_archive();
        archive.chat = vec![serde_json::json!({"body": "hi"})];
        archive.info.insert(
            WEBPAGE_URL_KEY.into(),
            Value::String("https://www.twitch.tv/videos/1".into()),
        );

        let path = archive.dump(dir.path(), false).await.unwrap();
        let chat: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("vod-210301.chat.json")).unwrap())
                .unwrap();
        assert_eq!(
            chat,
            serde_json::json!({
                "url": "https://www.twitch.tv/videos/1",
                "comments": [{"body": "hi"}],
            })
        );

        let loaded = Archive::load(&path).await.unwrap();
        assert_eq!(loaded.name, "vod-210301");
        assert_eq!(loaded.info.get("title"), archive.info.get("title"));
        assert!(!loaded.info.contains_key(PLAYLIST_KEY));
        let playlist = loaded.playlist().unwrap();
        assert_eq!(playlist.url.as_str(), URI);
        assert_eq!(playlist.playlist.segments.len(), 8);
        assert_eq!(loaded.muted, archive.muted);
    }

    #[tokio::test]
    async fn existing_files_need_force() {
        let dir = tempfile::tempdir().unwrap();
        let archive = fixture_archive();

        archive.dump(dir.path(), false).await.unwrap();
        assert!(matches!(
            archive.dump(dir.path(), false).await,
            Err(ArchiveError::Exists(_))
        ));
        archive.dump(dir.path(), true).await.unwrap();
    }

    #[tokio::test]
    async fn saves_both_playlists() {
        let dir = tempfile::tempdir().unwrap();
        let archive = fixture_archive();

        let (raw, normalized) = archive.save_playlists(dir.path(), true, false).await.unwrap();
        let raw = std::fs::read_to_string(raw).unwrap();
        let normalized = std::fs::read_to_string(normalized).unwrap();
        assert!(raw.contains("#EXT-X-TWITCH-ELAPSED-SECS"));
        assert!(!normalized.contains("TWITCH"));
        assert!(normalized.contains("https://vod.example.net/abc123/chunked/6.ts"));
    }

    #[test]
    fn info_must_be_an_object() {
        assert!(matches!(
            Archive::from_json("[1, 2]", "x"),
            Err(ArchiveError::NotAnObject)
        ));
        let archive = Archive::from_json(r#"{"title": "no playlist"}"#, "x").unwrap();
        assert!(matches!(archive.playlist(), Err(ArchiveError::MissingPlaylist)));
    }
}
