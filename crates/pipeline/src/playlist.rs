//! HLS playlist handling.
//!
//! Media playlists are parsed and checked against the segment files on disk.
//! The same check backs both the encode worker's completion test and the
//! catalog scanner, so an asset is only ever accepted through one rule.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Master playlist file name inside an asset directory.
pub const MASTER_PLAYLIST: &str = "master.m3u8";
/// Media playlist file name inside a rendition directory.
pub const MEDIA_PLAYLIST: &str = "playlist.m3u8";
/// printf-style segment pattern handed to the encoder.
pub const SEGMENT_PATTERN: &str = "segment_%04d.ts";

/// File name of segment `index`, matching [`SEGMENT_PATTERN`].
pub fn segment_file_name(index: usize) -> String {
    format!("segment_{:04}.ts", index)
}

fn is_segment_file_name(name: &str) -> bool {
    name.strip_prefix("segment_")
        .and_then(|rest| rest.strip_suffix(".ts"))
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

/// Reasons a playlist or rendition directory is rejected.
#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed playlist: {0}")]
    Malformed(String),

    #[error("playlist is not finalized (missing #EXT-X-ENDLIST)")]
    NotFinalized,

    #[error("playlist references no segments")]
    Empty,

    #[error("segment {index} is named {uri}, expected {expected}")]
    UnexpectedSegmentName {
        index: usize,
        uri: String,
        expected: String,
    },

    #[error("segment {0} is missing on disk")]
    MissingSegment(String),

    #[error("segment {0} is empty")]
    EmptySegment(String),

    #[error("playlist lists {listed} segments but {on_disk} exist on disk")]
    SegmentCountMismatch { listed: usize, on_disk: usize },

    #[error("segment {index} lasts {duration:.3}s, target is {target:.3}s")]
    DurationMismatch {
        index: usize,
        duration: f64,
        target: f64,
    },
}

/// One `#EXTINF` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub duration: f64,
    pub uri: String,
}

/// Parsed media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub version: Option<u32>,
    pub target_duration: Option<u64>,
    pub segments: Vec<MediaSegment>,
    /// `#EXT-X-ENDLIST` seen.
    pub ended: bool,
}

impl MediaPlaylist {
    pub fn parse(contents: &str) -> Result<Self, PlaylistError> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err(PlaylistError::Malformed("missing #EXTM3U header".into()));
        }

        let mut playlist = MediaPlaylist {
            version: None,
            target_duration: None,
            segments: Vec::new(),
            ended: false,
        };
        let mut pending_duration: Option<f64> = None;

        for line in contents.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
                playlist.version = Some(
                    value
                        .parse()
                        .map_err(|_| PlaylistError::Malformed("invalid EXT-X-VERSION".into()))?,
                );
            } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                playlist.target_duration = Some(value.parse().map_err(|_| {
                    PlaylistError::Malformed("invalid EXT-X-TARGETDURATION".into())
                })?);
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value
                    .split(',')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| PlaylistError::Malformed(format!("invalid EXTINF: {}", line)))?;
                pending_duration = Some(duration);
            } else if line == "#EXT-X-ENDLIST" {
                playlist.ended = true;
            } else if line.is_empty() || line.starts_with('#') {
                continue;
            } else if let Some(duration) = pending_duration.take() {
                playlist.segments.push(MediaSegment {
                    duration,
                    uri: line.to_string(),
                });
            } else {
                return Err(PlaylistError::Malformed(format!(
                    "segment {} has no #EXTINF",
                    line
                )));
            }
        }

        Ok(playlist)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

/// Segment duration rule applied during validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolicy {
    pub target_duration: f64,
    pub tolerance: f64,
}

impl SegmentPolicy {
    pub fn new(target_duration_secs: u32, tolerance: f64) -> Self {
        Self {
            target_duration: target_duration_secs as f64,
            tolerance,
        }
    }

    /// Every segment but the last is on target; the last is positive and
    /// not longer than the target.
    fn check(&self, index: usize, is_last: bool, duration: f64) -> Result<(), PlaylistError> {
        let on_target = (duration - self.target_duration).abs() <= self.tolerance;
        let valid_tail = duration > 0.0 && duration <= self.target_duration + self.tolerance;
        if (is_last && valid_tail) || (!is_last && on_target) {
            Ok(())
        } else {
            Err(PlaylistError::DurationMismatch {
                index,
                duration,
                target: self.target_duration,
            })
        }
    }
}

/// Summary of a rendition directory that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRendition {
    pub segment_count: usize,
    pub total_duration: f64,
}

/// Checks a rendition directory's playlist against the files beside it.
///
/// Rejects unfinalized or empty playlists, segment names out of sequence,
/// missing or empty segment files, extra segment files on disk and segment
/// durations outside `policy`.
pub fn validate_rendition_dir(
    dir: &Path,
    policy: &SegmentPolicy,
) -> Result<ValidatedRendition, PlaylistError> {
    let playlist_path = dir.join(MEDIA_PLAYLIST);
    let contents = fs::read_to_string(&playlist_path).map_err(|source| PlaylistError::Io {
        path: playlist_path.clone(),
        source,
    })?;
    let playlist = MediaPlaylist::parse(&contents)?;

    if !playlist.ended {
        return Err(PlaylistError::NotFinalized);
    }
    if playlist.segments.is_empty() {
        return Err(PlaylistError::Empty);
    }

    let last = playlist.segments.len() - 1;
    for (index, segment) in playlist.segments.iter().enumerate() {
        let expected = segment_file_name(index);
        if segment.uri != expected {
            return Err(PlaylistError::UnexpectedSegmentName {
                index,
                uri: segment.uri.clone(),
                expected,
            });
        }

        let size = fs::metadata(dir.join(&segment.uri))
            .map(|m| m.len())
            .map_err(|_| PlaylistError::MissingSegment(segment.uri.clone()))?;
        if size == 0 {
            return Err(PlaylistError::EmptySegment(segment.uri.clone()));
        }

        policy.check(index, index == last, segment.duration)?;
    }

    let on_disk = count_segment_files(dir)?;
    if on_disk != playlist.segments.len() {
        return Err(PlaylistError::SegmentCountMismatch {
            listed: playlist.segments.len(),
            on_disk,
        });
    }

    Ok(ValidatedRendition {
        segment_count: playlist.segments.len(),
        total_duration: playlist.total_duration(),
    })
}

fn count_segment_files(dir: &Path) -> Result<usize, PlaylistError> {
    let entries = fs::read_dir(dir).map_err(|source| PlaylistError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| e.file_name().to_str().is_some_and(is_segment_file_name))
        .count())
}

/// One `#EXT-X-STREAM-INF` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantStream {
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
    /// Playlist path relative to the master, e.g. `480p/playlist.m3u8`.
    pub uri: String,
}

/// Top-level manifest listing every rendition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MasterPlaylist {
    pub variants: Vec<VariantStream>,
}

impl MasterPlaylist {
    /// Builds a master playlist with variants ordered by ascending height.
    pub fn new(mut variants: Vec<VariantStream>) -> Self {
        variants.sort_by_key(|v| (v.height, v.bandwidth));
        Self { variants }
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        for variant in &self.variants {
            out.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}\n",
                variant.bandwidth, variant.width, variant.height, variant.uri
            ));
        }
        out
    }

    pub fn parse(contents: &str) -> Result<Self, PlaylistError> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err(PlaylistError::Malformed("missing #EXTM3U header".into()));
        }

        let mut variants = Vec::new();
        let mut pending: Option<(u64, u32, u32)> = None;

        for line in contents.lines().map(str::trim) {
            if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
                pending = Some(parse_stream_inf(attrs)?);
            } else if line.is_empty() || line.starts_with('#') {
                continue;
            } else if let Some((bandwidth, width, height)) = pending.take() {
                variants.push(VariantStream {
                    bandwidth,
                    width,
                    height,
                    uri: line.to_string(),
                });
            }
        }

        Ok(Self { variants })
    }

    /// Writes `master.m3u8` into `dir` through a temporary file.
    pub fn write_to_dir(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(MASTER_PLAYLIST);
        let tmp = dir.join(format!("{}.tmp", MASTER_PLAYLIST));
        fs::write(&tmp, self.render())?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

fn parse_stream_inf(attrs: &str) -> Result<(u64, u32, u32), PlaylistError> {
    let mut bandwidth = None;
    let mut resolution = (0, 0);

    for attr in attrs.split(',') {
        match attr.split_once('=') {
            Some(("BANDWIDTH", value)) => {
                bandwidth = value.trim().parse::<u64>().ok();
            }
            Some(("RESOLUTION", value)) => {
                if let Some((w, h)) = value.trim().split_once('x') {
                    resolution = (w.parse().unwrap_or(0), h.parse().unwrap_or(0));
                }
            }
            _ => {}
        }
    }

    let bandwidth = bandwidth
        .ok_or_else(|| PlaylistError::Malformed("EXT-X-STREAM-INF without BANDWIDTH".into()))?;
    Ok((bandwidth, resolution.0, resolution.1))
}
