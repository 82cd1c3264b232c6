//! HLS rendition encoder for hlsforge
//!
//! Builds and runs one ffmpeg invocation per rendition tier, producing a
//! VOD media playlist plus fixed-duration transport stream segments.

use crate::config::Config;
use crate::exec::{CommandRunner, ExecError, Invocation};
use crate::ladder::RenditionSpec;
use crate::playlist::{
    validate_rendition_dir, PlaylistError, SegmentPolicy, MEDIA_PLAYLIST, SEGMENT_PATTERN,
};
use crate::probe::SourceAsset;
use crate::ConcurrencyPlan;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder exited with non-zero status
    #[error("encoder failed with exit code {code}: {stderr}")]
    Process { code: i32, stderr: String },

    /// Encoder process was terminated by signal
    #[error("encoder process was terminated by signal")]
    Terminated,

    /// Encoder ran past its ceiling and was killed
    #[error("encoder exceeded {}s", .0.as_secs())]
    Timeout(Duration),

    /// Encoder exited cleanly but the rendition is unusable
    #[error("invalid rendition output: {0}")]
    InvalidOutput(#[from] PlaylistError),

    /// Encoder could not be started
    #[error("failed to start encoder: {0}")]
    Spawn(String),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for EncodeError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::TimedOut { timeout, .. } => EncodeError::Timeout(timeout),
            ExecError::Spawn { .. } => EncodeError::Spawn(err.to_string()),
            ExecError::Io(e) => EncodeError::Io(e),
        }
    }
}

/// Lifecycle of a single rendition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RenditionState {
    Pending,
    Complete,
    Failed(String),
}

/// Result of encoding one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenditionOutput {
    pub spec: RenditionSpec,
    pub dir: PathBuf,
    pub playlist_path: PathBuf,
    pub segment_count: usize,
    pub total_duration: f64,
    pub state: RenditionState,
}

impl RenditionOutput {
    pub fn pending(spec: RenditionSpec, dir: PathBuf) -> Self {
        let playlist_path = dir.join(MEDIA_PLAYLIST);
        Self {
            spec,
            dir,
            playlist_path,
            segment_count: 0,
            total_duration: 0.0,
            state: RenditionState::Pending,
        }
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.state = RenditionState::Failed(reason.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.state == RenditionState::Complete
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, RenditionState::Failed(_))
    }
}

/// Encoder settings shared by every rendition of a job.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub ffmpeg: PathBuf,
    pub video_codec: String,
    pub preset: String,
    pub audio_codec: String,
    pub segment_duration_secs: u32,
    pub duration_tolerance_secs: f64,
    pub threads: u32,
    /// `None` disables the ceiling.
    pub timeout: Option<Duration>,
}

impl EncodeSettings {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            ffmpeg: cfg.tools.ffmpeg.clone(),
            video_codec: cfg.encode.video_codec.clone(),
            preset: cfg.encode.preset.clone(),
            audio_codec: cfg.encode.audio_codec.clone(),
            segment_duration_secs: cfg.hls.segment_duration_secs,
            duration_tolerance_secs: cfg.hls.duration_tolerance_secs,
            threads: plan.threads_per_encode,
            timeout: (cfg.encode.timeout_secs > 0)
                .then(|| Duration::from_secs(cfg.encode.timeout_secs)),
        }
    }

    pub fn segment_policy(&self) -> SegmentPolicy {
        SegmentPolicy::new(self.segment_duration_secs, self.duration_tolerance_secs)
    }
}

/// Build the ffmpeg invocation for one rendition
///
/// Creates an invocation configured with:
/// - Scaling to the tier height with an even, aspect-preserving width
/// - Constrained-bitrate video at the tier bitrate
/// - Keyframes forced on every segment boundary
/// - Stereo audio at the tier bitrate
/// - VOD HLS output into `output_dir`
pub fn build_encode_invocation(
    settings: &EncodeSettings,
    input: &Path,
    spec: &RenditionSpec,
    output_dir: &Path,
) -> Invocation {
    let segment = settings.segment_duration_secs;
    let mut inv = Invocation::new(&settings.ffmpeg);

    inv.args(["-hide_banner", "-nostdin", "-y"]);
    inv.arg("-i").arg(input);

    // First video stream, audio only when the source has one
    inv.args(["-map", "0:v:0", "-map", "0:a:0?"]);

    inv.arg("-vf").arg(format!("scale=-2:{}", spec.height));
    inv.arg("-c:v").arg(&settings.video_codec);
    inv.arg("-preset").arg(&settings.preset);
    inv.arg("-b:v").arg(format!("{}k", spec.video_kbps));
    inv.arg("-maxrate")
        .arg(format!("{}k", spec.video_kbps * 107 / 100));
    inv.arg("-bufsize").arg(format!("{}k", spec.video_kbps * 3 / 2));

    // Segment boundaries must land on keyframes
    inv.arg("-force_key_frames")
        .arg(format!("expr:gte(t,n_forced*{})", segment));
    inv.args(["-sc_threshold", "0"]);

    inv.arg("-c:a").arg(&settings.audio_codec);
    inv.arg("-b:a").arg(format!("{}k", spec.audio_kbps));
    inv.args(["-ac", "2"]);

    inv.arg("-threads").arg(settings.threads.to_string());

    inv.args(["-f", "hls"]);
    inv.arg("-hls_time").arg(segment.to_string());
    inv.args([
        "-hls_playlist_type",
        "vod",
        "-hls_list_size",
        "0",
        "-start_number",
        "0",
    ]);
    inv.arg("-hls_segment_filename")
        .arg(output_dir.join(SEGMENT_PATTERN));
    inv.arg(output_dir.join(MEDIA_PLAYLIST));

    inv
}

/// Encodes single renditions through an injected [`CommandRunner`].
#[derive(Clone)]
pub struct EncodeWorker {
    runner: Arc<dyn CommandRunner>,
    settings: EncodeSettings,
}

impl EncodeWorker {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: EncodeSettings) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &EncodeSettings {
        &self.settings
    }

    /// Encode `source` at `spec` into `output_dir`
    ///
    /// Blocking. The returned output is `Complete` only when the encoder
    /// exited 0 and the playlist passed validation. On any error the output
    /// directory is removed so no partial rendition survives.
    pub fn encode(
        &self,
        source: &SourceAsset,
        spec: &RenditionSpec,
        output_dir: &Path,
    ) -> Result<RenditionOutput, EncodeError> {
        let output = RenditionOutput::pending(spec.clone(), output_dir.to_path_buf());

        match self.run_encoder(source, spec, output_dir) {
            Ok(validated) => Ok(RenditionOutput {
                segment_count: validated.segment_count,
                total_duration: validated.total_duration,
                state: RenditionState::Complete,
                ..output
            }),
            Err(err) => {
                warn!(rendition = %spec.label, error = %err, "rendition encode failed");
                if let Err(e) = std::fs::remove_dir_all(output_dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(dir = %output_dir.display(), error = %e, "failed to remove partial rendition");
                    }
                }
                Err(err)
            }
        }
    }

    fn run_encoder(
        &self,
        source: &SourceAsset,
        spec: &RenditionSpec,
        output_dir: &Path,
    ) -> Result<crate::playlist::ValidatedRendition, EncodeError> {
        std::fs::create_dir_all(output_dir)?;

        let invocation = build_encode_invocation(&self.settings, &source.path, spec, output_dir);
        debug!(rendition = %spec.label, args = ?invocation.args_lossy(), "starting encoder");

        let result = self.runner.run(&invocation, self.settings.timeout)?;
        if !result.success() {
            return Err(match result.exit_code {
                Some(code) => EncodeError::Process {
                    code,
                    stderr: result.stderr_tail(5),
                },
                None => EncodeError::Terminated,
            });
        }

        Ok(validate_rendition_dir(
            output_dir,
            &self.settings.segment_policy(),
        )?)
    }
}
