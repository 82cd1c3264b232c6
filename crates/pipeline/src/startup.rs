//! Startup checks module for hlsforge
//!
//! Preflight checks run before any job is accepted:
//! - ffmpeg and ffprobe start and report a version
//! - the output root exists (created if missing) and is a directory

use crate::config::Config;
use crate::exec::{CommandRunner, Invocation};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const VERSION_TIMEOUT: Duration = Duration::from_secs(15);

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("output root {0} is not a directory")]
    OutputRootNotDirectory(PathBuf),

    #[error("failed to create output root {path}: {source}")]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What a successful preflight found
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupReport {
    pub ffmpeg_version: Option<String>,
    pub ffmpeg_major: Option<u32>,
    pub ffprobe_version: Option<String>,
    pub output_root: PathBuf,
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
/// - ffprobe banners: "ffprobe version 6.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    major_version(&version_token(version_output)?)
}

fn major_version(token: &str) -> Option<u32> {
    let version_str = token.trim_start_matches('n');

    // Major version is everything before the first '.' or '-'
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Raw version token following "<tool> version" on the banner line.
fn version_token(version_output: &str) -> Option<String> {
    version_output.lines().find_map(|line| {
        let lower = line.to_lowercase();
        let (_, rest) = lower.split_once(" version ")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

/// Run `<tool> -version` and return its reported version token
pub fn check_tool(
    runner: &dyn CommandRunner,
    program: &Path,
    tool: &str,
) -> Result<Option<String>, StartupError> {
    let mut invocation = Invocation::new(program);
    invocation.arg("-version");

    let output = runner
        .run(&invocation, Some(VERSION_TIMEOUT))
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} (is it installed and in PATH?)", e),
        })?;

    if !output.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("-version exited with {:?}", output.exit_code),
        });
    }

    let banner = String::from_utf8_lossy(&output.stdout);
    let version = version_token(&banner);
    if version.is_none() {
        warn!(tool, "could not parse version banner");
    }
    Ok(version)
}

/// Create the output root if needed and make sure it is a directory
pub fn ensure_output_root(root: &Path) -> Result<(), StartupError> {
    if root.exists() && !root.is_dir() {
        return Err(StartupError::OutputRootNotDirectory(root.to_path_buf()));
    }
    fs::create_dir_all(root).map_err(|source| StartupError::OutputRoot {
        path: root.to_path_buf(),
        source,
    })
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg availability and version
/// 2. ffprobe availability
/// 3. Output root
pub fn run_startup_checks(
    cfg: &Config,
    runner: &dyn CommandRunner,
) -> Result<StartupReport, StartupError> {
    let ffmpeg_version = check_tool(runner, &cfg.tools.ffmpeg, "ffmpeg")?;
    let ffmpeg_major = ffmpeg_version.as_deref().and_then(major_version);
    info!(version = ?ffmpeg_version, major = ?ffmpeg_major, "ffmpeg available");

    let ffprobe_version = check_tool(runner, &cfg.tools.ffprobe, "ffprobe")?;
    info!(version = ?ffprobe_version, "ffprobe available");

    ensure_output_root(&cfg.storage.output_root)?;
    info!(root = %cfg.storage.output_root.display(), "output root ready");

    Ok(StartupReport {
        ffmpeg_version,
        ffmpeg_major,
        ffprobe_version,
        output_root: cfg.storage.output_root.clone(),
    })
}
