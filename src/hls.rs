//! Playlist normalization for archived broadcasts.
//!
//! Archived playlists carry platform-specific tags, relative segment URIs
//! and trimmed segments (`<index>v<variant>-<sequence>.ts`) whose durations
//! are unreliable. [`normalize`] turns them into something ffmpeg can remux
//! from stdin without surprises.

use std::sync::OnceLock;

use m3u8_rs::{MediaPlaylist, MediaSegment, Playlist};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::util::{self, HttpClient, HttpError};

#[derive(thiserror::Error, Debug)]
pub enum PlaylistError {
    #[error("Could not parse playlist: {0}")]
    Parse(String),
    #[error("Segment URI {uri:?} cannot be made absolute: {source}")]
    Uri {
        uri: String,
        source: url::ParseError,
    },
    #[error("Master playlist has no usable variants")]
    NoVariants,
    #[error("Could not fetch playlist")]
    Http(#[from] HttpError),
    #[error("Playlist is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

fn trimmed_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+v\d+-(\d+)\.ts$").expect("valid regex"))
}

/// Sequence number of a trimmed segment, e.g. `12v3-456.ts` gives `456`.
pub fn trimmed_sequence(uri: &str) -> Option<&str> {
    trimmed_segment()
        .captures(util::file_name(uri))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

pub fn is_muted(uri: &str) -> bool {
    util::file_name(uri).contains("-muted")
}

pub fn parse_media(text: &str) -> Result<MediaPlaylist, PlaylistError> {
    m3u8_rs::parse_media_playlist_res(text.as_bytes())
        .map_err(|e| PlaylistError::Parse(format!("{:?}", e)))
}

pub fn to_string(playlist: &MediaPlaylist) -> Result<String, PlaylistError> {
    let mut out = Vec::new();
    playlist.write_to(&mut out)?;
    Ok(String::from_utf8(out)?)
}

/// A media playlist together with where it was fetched from.
#[derive(Debug, Clone)]
pub struct FetchedPlaylist {
    pub url: Url,
    pub raw: String,
    pub playlist: MediaPlaylist,
}

/// Fetches a media playlist. A master playlist is followed one level down to
/// its highest-bandwidth variant.
pub async fn fetch_playlist(http: &HttpClient, url: &str) -> Result<FetchedPlaylist, PlaylistError> {
    let mut url = Url::parse(url).map_err(|source| PlaylistError::Uri {
        uri: url.to_string(),
        source,
    })?;
    let mut raw = http.fetch_text(url.as_str()).await?;

    if let Ok(Playlist::MasterPlaylist(master)) = m3u8_rs::parse_playlist_res(raw.as_bytes()) {
        let variant = master
            .variants
            .iter()
            .filter(|v| !v.is_i_frame)
            .max_by_key(|v| v.bandwidth)
            .ok_or(PlaylistError::NoVariants)?;
        url = url.join(&variant.uri).map_err(|source| PlaylistError::Uri {
            uri: variant.uri.clone(),
            source,
        })?;
        debug!("Following variant {} ({} bps)", url, variant.bandwidth);
        raw = http.fetch_text(url.as_str()).await?;
    }

    let playlist = parse_media(&raw)?;
    Ok(FetchedPlaylist { url, raw, playlist })
}

/// Keeps only version, target duration, media sequence, playlist type and
/// end-list, rebuilding every segment with an absolute URI and no
/// discontinuity marker.
///
/// With `extended`, trimmed segments are rewritten to the untrimmed
/// `<sequence>.ts` next to them and given the target duration.
pub fn normalize(
    playlist: &MediaPlaylist,
    base: &Url,
    extended: bool,
) -> Result<MediaPlaylist, PlaylistError> {
    let target = playlist.target_duration as f32;
    let mut out = MediaPlaylist {
        version: playlist.version,
        target_duration: playlist.target_duration,
        media_sequence: playlist.media_sequence,
        playlist_type: playlist.playlist_type.clone(),
        end_list: playlist.end_list,
        ..Default::default()
    };

    for segment in &playlist.segments {
        let mut uri = base.join(&segment.uri).map_err(|source| PlaylistError::Uri {
            uri: segment.uri.clone(),
            source,
        })?;
        let mut duration = segment.duration;

        if extended {
            if let Some(sequence) = trimmed_sequence(&segment.uri) {
                uri = util::with_file_name(&uri, &format!("{}.ts", sequence));
                duration = target;
            }
        }
        if duration <= 0.0 || duration.is_nan() {
            duration = target;
        }

        out.segments.push(MediaSegment {
            uri: uri.into(),
            duration,
            ..MediaSegment::empty()
        });
    }

    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutedSegment {
    pub uri: String,
    pub start: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutedRange {
    pub start: f64,
    pub end: f64,
    /// Last audible segment before the range.
    pub before: Option<String>,
    /// First audible segment after the range.
    pub after: Option<String>,
}

pub fn scan_muted(playlist: &MediaPlaylist) -> Vec<MutedSegment> {
    let mut start = 0.0;
    let mut muted = Vec::new();
    for segment in &playlist.segments {
        if is_muted(&segment.uri) {
            muted.push(MutedSegment {
                uri: segment.uri.clone(),
                start,
            });
        }
        start += segment.duration as f64;
    }
    muted
}

pub fn muted_ranges(playlist: &MediaPlaylist) -> Vec<MutedRange> {
    let mut ranges = Vec::new();
    let mut current: Option<MutedRange> = None;
    let mut previous: Option<&str> = None;
    let mut time = 0.0;

    for segment in &playlist.segments {
        let muted = is_muted(&segment.uri);
        if muted && current.is_none() {
            current = Some(MutedRange {
                start: time,
                end: time,
                before: previous.map(String::from),
                after: None,
            });
        } else if !muted {
            if let Some(mut range) = current.take() {
                range.after = Some(segment.uri.clone());
                ranges.push(range);
            }
        }

        time += segment.duration as f64;
        if let Some(range) = current.as_mut() {
            range.end = time;
        }
        previous = Some(&segment.uri);
    }

    ranges.extend(current);
    ranges
}
