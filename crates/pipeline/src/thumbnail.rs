//! Poster frame extraction.

use crate::config::{Config, ThumbnailConfig};
use crate::exec::{CommandRunner, ExecError, Invocation};
use crate::playlist::{segment_file_name, MediaPlaylist, PlaylistError, SegmentPolicy, MEDIA_PLAYLIST};
use crate::scanner::inspect_asset_dir;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Thumbnail file name inside an asset directory.
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("ffmpeg exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("ffmpeg produced no image data")]
    EmptyOutput,

    #[error("no valid rendition to extract a frame from in {0}")]
    NoRendition(PathBuf),

    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct ThumbnailGenerator {
    runner: Arc<dyn CommandRunner>,
    ffmpeg: PathBuf,
    settings: ThumbnailConfig,
}

impl ThumbnailGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>, ffmpeg: PathBuf, settings: ThumbnailConfig) -> Self {
        Self {
            runner,
            ffmpeg,
            settings,
        }
    }

    pub fn from_config(runner: Arc<dyn CommandRunner>, cfg: &Config) -> Self {
        Self::new(runner, cfg.tools.ffmpeg.clone(), cfg.thumbnail.clone())
    }

    /// Seek position for a source of the given duration.
    ///
    /// Never negative and never inside the end margin of a known duration.
    pub fn pick_offset(&self, duration: Option<f64>) -> f64 {
        match duration {
            Some(d) if d > 0.0 => {
                let at = d * self.settings.position_fraction;
                at.min(d - self.settings.end_margin_secs).max(0.0)
            }
            _ => self.settings.fallback_offset_secs.max(0.0),
        }
    }

    /// `seek_after_input` places `-ss` after `-i`, which transport-stream
    /// segments need because their timestamps do not start at zero.
    pub fn build_invocation(&self, input: &Path, at: f64, seek_after_input: bool) -> Invocation {
        let seek = format!("{:.3}", at);
        let mut inv = Invocation::new(&self.ffmpeg);
        inv.args(["-hide_banner", "-nostdin", "-v", "error"]);
        if seek_after_input {
            inv.arg("-i").arg(input).arg("-ss").arg(&seek);
        } else {
            inv.arg("-ss").arg(&seek).arg("-i").arg(input);
        }
        inv.args(["-frames:v", "1", "-q:v", "2", "-f", "image2", "-c:v", "mjpeg", "pipe:1"]);
        inv
    }

    fn extract(&self, inv: &Invocation) -> Result<Vec<u8>, ThumbnailError> {
        let timeout = Duration::from_secs(self.settings.timeout_secs);
        let output = self.runner.run(inv, Some(timeout))?;
        if !output.success() {
            return Err(ThumbnailError::Failed {
                code: output.exit_code,
                stderr: output.stderr_tail(3),
            });
        }
        if output.stdout.is_empty() {
            return Err(ThumbnailError::EmptyOutput);
        }
        Ok(output.stdout)
    }

    /// JPEG bytes of the frame at `at_seconds`.
    pub fn generate(&self, path: &Path, at_seconds: f64) -> Result<Vec<u8>, ThumbnailError> {
        self.extract(&self.build_invocation(path, at_seconds, false))
    }

    /// Writes `thumbnail.jpg` for `source` into `dest_dir`.
    pub fn write_thumbnail(
        &self,
        source: &Path,
        duration: Option<f64>,
        dest_dir: &Path,
    ) -> Result<PathBuf, ThumbnailError> {
        let at = self.pick_offset(duration);
        let bytes = self.generate(source, at)?;
        let path = write_atomically(dest_dir, &bytes)?;
        debug!(at, path = %path.display(), "thumbnail written");
        Ok(path)
    }

    /// Rebuilds the thumbnail of a published asset from its best rendition.
    ///
    /// The frame comes from the segment in the middle of the 10%..90% window
    /// of the highest valid rendition.
    pub fn regenerate(
        &self,
        asset_dir: &Path,
        policy: &SegmentPolicy,
    ) -> Result<PathBuf, ThumbnailError> {
        let id = asset_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let inspected = inspect_asset_dir(&id, asset_dir, policy);
        let best = inspected
            .available_renditions
            .last()
            .ok_or_else(|| ThumbnailError::NoRendition(asset_dir.to_path_buf()))?;

        let rendition_dir = asset_dir.join(&best.label);
        let playlist = MediaPlaylist::parse(&fs::read_to_string(rendition_dir.join(MEDIA_PLAYLIST))?)?;
        let (index, offset) = pick_segment(&playlist);
        let segment = rendition_dir.join(segment_file_name(index));

        let bytes = self.extract(&self.build_invocation(&segment, offset, true))?;
        let path = write_atomically(asset_dir, &bytes)?;
        info!(
            asset = %id,
            rendition = %best.label,
            segment = index,
            "thumbnail regenerated"
        );
        Ok(path)
    }
}

/// Segment index and in-segment offset for a regenerated thumbnail.
fn pick_segment(playlist: &MediaPlaylist) -> (usize, f64) {
    let count = playlist.segments.len();
    let index = if count > 2 {
        let start = count / 10;
        let end = (count * 9 / 10).min(count - 1);
        (start + end) / 2
    } else {
        0
    };
    let duration = playlist.segments.get(index).map(|s| s.duration).unwrap_or(0.0);
    let offset = if duration > 1.0 { duration / 2.0 } else { 0.0 };
    (index, offset)
}

fn write_atomically(dir: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let path = dir.join(THUMBNAIL_FILE);
    let tmp = dir.join(format!("{}.tmp", THUMBNAIL_FILE));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}
