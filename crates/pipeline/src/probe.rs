//! Probe module for reading source video metadata.
//!
//! Runs ffprobe with JSON output and reduces it to the few fields the
//! pipeline needs: container, duration, frame size and bitrate.

use crate::exec::{CommandRunner, ExecError, Invocation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Source file is missing or cannot be read.
    #[error("source {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// ffprobe exited non-zero.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// No video stream with a usable frame size.
    #[error("no decodable video stream in {0}")]
    NoVideoStream(PathBuf),

    /// ffprobe could not be started or timed out.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Smallest frame height the encoder can scale to with 4:2:0 chroma.
pub const MIN_FRAME_HEIGHT: u32 = 2;

/// Probed, immutable description of an uploaded source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceAsset {
    pub path: PathBuf,
    /// ffprobe `format_name`, e.g. "mov,mp4,m4a,3gp,3g2,mj2".
    pub container: String,
    /// `None` when ffprobe reports no or a zero duration.
    pub duration_secs: Option<f64>,
    pub width: u32,
    pub height: u32,
    /// Video bitrate in bits per second, container bitrate as fallback.
    pub video_bitrate: Option<u64>,
}

impl SourceAsset {
    /// Width matching `height` at the source aspect ratio, rounded to even.
    pub fn width_for_height(&self, height: u32) -> u32 {
        if self.height == 0 {
            return even(height * 16 / 9);
        }
        let width = self.width as f64 * height as f64 / self.height as f64;
        (((width / 2.0).round() as u32) * 2).max(2)
    }
}

fn even(value: u32) -> u32 {
    value - value % 2
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Parses ffprobe JSON output into a [`SourceAsset`] for `path`.
pub fn parse_ffprobe_output(path: &Path, json_str: &str) -> Result<SourceAsset, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video = streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .find(|s| s.width.unwrap_or(0) > 0 && s.height.unwrap_or(0) >= MIN_FRAME_HEIGHT)
        .ok_or_else(|| ProbeError::NoVideoStream(path.to_path_buf()))?;

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    let parse_bitrate = |raw: &Option<String>| {
        raw.as_ref()
            .and_then(|br| br.parse::<u64>().ok())
            .filter(|br| *br > 0)
    };
    let video_bitrate = parse_bitrate(&video.bit_rate).or_else(|| parse_bitrate(&format.bit_rate));

    Ok(SourceAsset {
        path: path.to_path_buf(),
        container: format.format_name.unwrap_or_default(),
        duration_secs,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        video_bitrate,
    })
}

/// Reads source metadata through ffprobe.
#[derive(Clone)]
pub struct ProbeService {
    runner: Arc<dyn CommandRunner>,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl ProbeService {
    pub fn new(runner: Arc<dyn CommandRunner>, ffprobe: PathBuf, timeout: Duration) -> Self {
        Self {
            runner,
            ffprobe,
            timeout,
        }
    }

    /// Builds `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
    pub fn build_probe_invocation(&self, path: &Path) -> Invocation {
        let mut inv = Invocation::new(&self.ffprobe);
        inv.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ]);
        inv.arg(path);
        inv
    }

    /// Probes `path`. Read-only: nothing is written to disk.
    pub fn probe(&self, path: &Path) -> Result<SourceAsset, ProbeError> {
        std::fs::File::open(path).map_err(|source| ProbeError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let output = self
            .runner
            .run(&self.build_probe_invocation(path), Some(self.timeout))?;

        if !output.success() {
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with {:?}: {}",
                output.exit_code,
                output.stderr_tail(5)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let asset = parse_ffprobe_output(path, &stdout)?;
        debug!(
            path = %path.display(),
            width = asset.width,
            height = asset.height,
            duration = ?asset.duration_secs,
            "probed source"
        );
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ffprobe_json, FakeRunner};
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "bit_rate": "128000"},
                {"codec_type": "video", "width": 1920, "height": 1080, "bit_rate": "4500000"}
            ],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "63.480000", "bit_rate": "4700000"}
        }"#;

        let asset = parse_ffprobe_output(Path::new("/in/a.mp4"), json).unwrap();
        assert_eq!(asset.width, 1920);
        assert_eq!(asset.height, 1080);
        assert_eq!(asset.duration_secs, Some(63.48));
        assert_eq!(asset.video_bitrate, Some(4_500_000));
        assert_eq!(asset.container, "mov,mp4,m4a,3gp,3g2,mj2");
    }

    #[test]
    fn test_missing_duration_is_unknown_not_error() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 640, "height": 360}],
            "format": {"format_name": "matroska,webm", "duration": "0.000000", "bit_rate": "900000"}
        }"#;

        let asset = parse_ffprobe_output(Path::new("/in/b.mkv"), json).unwrap();
        assert_eq!(asset.duration_secs, None);
        // Falls back to the container bitrate
        assert_eq!(asset.video_bitrate, Some(900_000));
    }

    #[test]
    fn test_no_video_stream_is_rejected() {
        let json = r#"{
            "streams": [{"codec_type": "audio"}],
            "format": {"duration": "10.0"}
        }"#;
        let result = parse_ffprobe_output(Path::new("/in/c.mp4"), json);
        assert!(matches!(result, Err(ProbeError::NoVideoStream(_))));
    }

    #[test]
    fn test_zero_sized_video_stream_is_rejected() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 0, "height": 0}],
            "format": {"duration": "10.0"}
        }"#;
        let result = parse_ffprobe_output(Path::new("/in/d.mp4"), json);
        assert!(matches!(result, Err(ProbeError::NoVideoStream(_))));
    }

    #[test]
    fn test_single_line_video_is_rejected() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 640, "height": 1}],
            "format": {"duration": "10.0"}
        }"#;
        let result = parse_ffprobe_output(Path::new("/in/line.mp4"), json);
        assert!(matches!(result, Err(ProbeError::NoVideoStream(_))));
    }

    #[test]
    fn test_garbage_output_is_parse_error() {
        let result = parse_ffprobe_output(Path::new("/in/e.mp4"), "not json");
        assert!(matches!(result, Err(ProbeError::ParseError(_))));
    }

    #[test]
    fn test_probe_unreadable_file_never_spawns() {
        let runner = Arc::new(FakeRunner::new());
        let service = ProbeService::new(
            runner.clone(),
            PathBuf::from("ffprobe"),
            Duration::from_secs(5),
        );

        let result = service.probe(Path::new("/definitely/not/here.mp4"));
        assert!(matches!(result, Err(ProbeError::Unreadable { .. })));
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn test_probe_reports_tool_failure() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.mp4");
        std::fs::write(&source, b"not really a video").unwrap();

        let runner = Arc::new(FakeRunner::new().with_probe_failure());
        let service = ProbeService::new(runner, PathBuf::from("ffprobe"), Duration::from_secs(5));

        let result = service.probe(&source);
        assert!(matches!(result, Err(ProbeError::FfprobeFailed(_))));
    }

    #[test]
    fn test_probe_uses_json_invocation() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("ok.mp4");
        std::fs::write(&source, b"fake").unwrap();

        let runner = Arc::new(FakeRunner::new().with_source(1280, 720, Some(30.0)));
        let service = ProbeService::new(
            runner.clone(),
            PathBuf::from("/opt/ffprobe"),
            Duration::from_secs(5),
        );

        let asset = service.probe(&source).unwrap();
        assert_eq!((asset.width, asset.height), (1280, 720));

        let calls = runner.invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, PathBuf::from("/opt/ffprobe"));
        assert_eq!(calls[0].flag_value("-print_format"), Some("json".to_string()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_parsed_dimensions_round_trip(
            width in 2u32..8000,
            height in 2u32..5000,
            duration in proptest::option::of(0.1f64..20_000.0),
        ) {
            let json = ffprobe_json(width, height, duration);
            let asset = parse_ffprobe_output(Path::new("/in/p.mp4"), &json).unwrap();

            prop_assert_eq!(asset.width, width);
            prop_assert_eq!(asset.height, height);
            prop_assert_eq!(asset.duration_secs.is_some(), duration.is_some());
        }

        #[test]
        fn prop_derived_width_is_even_and_positive(
            width in 2u32..8000,
            height in 2u32..5000,
            target in 2u32..2200,
        ) {
            let asset = SourceAsset {
                path: PathBuf::from("/in/x.mp4"),
                container: String::new(),
                duration_secs: None,
                width,
                height,
                video_bitrate: None,
            };
            let derived = asset.width_for_height(target);
            prop_assert_eq!(derived % 2, 0);
            prop_assert!(derived >= 2);
        }
    }

    #[test]
    fn test_width_for_height_standard_aspect() {
        let asset = SourceAsset {
            path: PathBuf::from("/in/x.mp4"),
            container: String::new(),
            duration_secs: Some(10.0),
            width: 1920,
            height: 1080,
            video_bitrate: None,
        };
        assert_eq!(asset.width_for_height(720), 1280);
        assert_eq!(asset.width_for_height(480), 854);
        assert_eq!(asset.width_for_height(240), 426);
    }
}
