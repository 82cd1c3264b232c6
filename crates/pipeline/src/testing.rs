//! Test fixtures: a scripted ffmpeg/ffprobe and HLS directory builders.

use crate::config::Config;
use crate::exec::{CommandRunner, ExecError, Invocation, ProcessOutput};
use crate::playlist::{segment_file_name, MEDIA_PLAYLIST};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Bytes returned for thumbnail invocations: SOI, a JFIF marker, EOI.
pub const FAKE_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0xFF, 0xD9];

/// ffprobe JSON for a single video stream plus an audio stream.
pub fn ffprobe_json(width: u32, height: u32, duration: Option<f64>) -> String {
    let duration = duration
        .map(|d| format!("\"{:.6}\"", d))
        .unwrap_or_else(|| "\"N/A\"".to_string());
    format!(
        r#"{{
  "streams": [
    {{"index": 0, "codec_type": "video", "codec_name": "h264", "width": {w}, "height": {h}, "bit_rate": "6000000"}},
    {{"index": 1, "codec_type": "audio", "codec_name": "aac", "bit_rate": "128000"}}
  ],
  "format": {{"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": {d}, "bit_rate": "6200000"}}
}}"#,
        w = width,
        h = height,
        d = duration
    )
}

/// Writes a finalized rendition with one segment per entry of `durations`.
pub fn write_rendition(dir: &Path, durations: &[f64]) {
    write_rendition_with(dir, durations, true);
}

pub fn write_rendition_with(dir: &Path, durations: &[f64], ended: bool) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(MEDIA_PLAYLIST), media_playlist(durations, ended)).unwrap();
    for index in 0..durations.len() {
        fs::write(dir.join(segment_file_name(index)), b"\x47fake-ts").unwrap();
    }
}

fn media_playlist(durations: &[f64], ended: bool) -> String {
    let target = durations.iter().cloned().fold(1.0f64, f64::max).ceil() as u64;
    let mut out = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n",
        target
    );
    for (index, duration) in durations.iter().enumerate() {
        out.push_str(&format!("#EXTINF:{:.6},\n{}\n", duration, segment_file_name(index)));
    }
    if ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

/// Splits `total` into full segments of `target` plus a shorter tail.
fn segment_durations(total: f64, target: f64) -> Vec<f64> {
    let mut durations = Vec::new();
    let mut remaining = total;
    while remaining > target + 0.01 {
        durations.push(target);
        remaining -= target;
    }
    if remaining > 0.01 {
        durations.push(remaining);
    }
    durations
}

/// Config rooted at `root` with fixed small concurrency.
pub fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage.output_root = root.to_path_buf();
    cfg.cpu.logical_cores = Some(4);
    cfg.encode.max_parallel_encodes = 2;
    cfg.encode.threads_per_encode = 2;
    cfg.tools.ffmpeg = PathBuf::from("ffmpeg");
    cfg.tools.ffprobe = PathBuf::from("ffprobe");
    cfg
}

/// Writes a placeholder upload; the fake runner never reads it.
pub fn fake_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"\x00\x00\x00\x18ftypmp42").unwrap();
    path
}

/// Scripted stand-in for ffmpeg and ffprobe.
///
/// Encode invocations write a real HLS rendition into the output directory
/// so the validation and publish paths run unmodified.
pub struct FakeRunner {
    source: (u32, u32, Option<f64>),
    probe_fails: bool,
    missing_tools: bool,
    thumbnail_fails: bool,
    failing_heights: Vec<u32>,
    timeout_heights: Vec<u32>,
    broken_heights: Vec<u32>,
    encode_delay: Option<Duration>,
    occupy_target: bool,
    calls: Mutex<Vec<Invocation>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            source: (1920, 1080, Some(20.0)),
            probe_fails: false,
            missing_tools: false,
            thumbnail_fails: false,
            failing_heights: Vec::new(),
            timeout_heights: Vec::new(),
            broken_heights: Vec::new(),
            encode_delay: None,
            occupy_target: false,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        }
    }

    pub fn with_source(mut self, width: u32, height: u32, duration: Option<f64>) -> Self {
        self.source = (width, height, duration);
        self
    }

    pub fn with_probe_failure(mut self) -> Self {
        self.probe_fails = true;
        self
    }

    pub fn with_missing_tools(mut self) -> Self {
        self.missing_tools = true;
        self
    }

    pub fn with_thumbnail_failure(mut self) -> Self {
        self.thumbnail_fails = true;
        self
    }

    /// Encodes to `height` exit 1 after writing a partial segment.
    pub fn failing_at(mut self, height: u32) -> Self {
        self.failing_heights.push(height);
        self
    }

    pub fn timing_out_at(mut self, height: u32) -> Self {
        self.timeout_heights.push(height);
        self
    }

    /// Encodes to `height` exit 0 but leave a segment missing.
    pub fn broken_at(mut self, height: u32) -> Self {
        self.broken_heights.push(height);
        self
    }

    pub fn with_encode_delay(mut self, delay: Duration) -> Self {
        self.encode_delay = Some(delay);
        self
    }

    /// Encodes also create the published directory for their asset, so the
    /// final publish finds its target taken.
    pub fn occupying_published_dir(mut self) -> Self {
        self.occupy_target = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn encode_invocations(&self) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|inv| inv.flag_value("-hls_segment_filename").is_some())
            .collect()
    }

    /// Highest number of encodes observed running at once.
    pub fn peak_concurrent_encodes(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    fn exit(code: i32, stdout: Vec<u8>, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            exit_code: Some(code),
            stdout,
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    fn version(&self, invocation: &Invocation) -> ProcessOutput {
        let banner = format!(
            "{} version n6.1.1-3-gabcdef0 Copyright (c) 2000-2023 the FFmpeg developers\nbuilt with gcc 12\n",
            invocation.program_name()
        );
        Self::exit(0, banner.into_bytes(), "")
    }

    fn probe(&self) -> ProcessOutput {
        if self.probe_fails {
            return Self::exit(1, Vec::new(), "moov atom not found\nInvalid data found when processing input");
        }
        let (w, h, d) = self.source;
        Self::exit(0, ffprobe_json(w, h, d).into_bytes(), "")
    }

    fn thumbnail(&self) -> ProcessOutput {
        if self.thumbnail_fails {
            return Self::exit(1, Vec::new(), "Output file is empty, nothing was encoded");
        }
        Self::exit(0, FAKE_JPEG.to_vec(), "")
    }

    fn encode(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, ExecError> {
        let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(current, Ordering::SeqCst);
        let result = self.encode_inner(invocation, timeout);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn encode_inner(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, ExecError> {
        if let Some(delay) = self.encode_delay {
            thread::sleep(delay);
        }

        let height = invocation
            .flag_value("-vf")
            .and_then(|vf| vf.rsplit(':').next().and_then(|h| h.parse::<u32>().ok()))
            .unwrap_or(0);
        let target: f64 = invocation
            .flag_value("-hls_time")
            .and_then(|t| t.parse().ok())
            .unwrap_or(6.0);
        let playlist = PathBuf::from(
            invocation
                .args_lossy()
                .last()
                .cloned()
                .unwrap_or_default(),
        );
        let dir = playlist.parent().map(Path::to_path_buf).unwrap_or_default();
        fs::create_dir_all(&dir)?;

        if self.occupy_target {
            // <root>/.staging/<id>/<label> -> <root>/<id>
            let asset_dir = dir.parent().unwrap();
            let root = asset_dir.parent().and_then(Path::parent).unwrap();
            let taken = root.join(asset_dir.file_name().unwrap());
            fs::create_dir_all(&taken)?;
            fs::write(taken.join("occupied"), b"x")?;
        }

        if self.timeout_heights.contains(&height) {
            fs::write(dir.join(segment_file_name(0)), b"\x47partial")?;
            return Err(ExecError::TimedOut {
                program: invocation.program_name(),
                timeout: timeout.unwrap_or_default(),
            });
        }
        if self.failing_heights.contains(&height) {
            fs::write(dir.join(segment_file_name(0)), b"\x47partial")?;
            return Ok(Self::exit(
                1,
                Vec::new(),
                "[libx264 @ 0x55d] Error initializing output stream 0:0\nConversion failed!",
            ));
        }

        let durations = segment_durations(self.source.2.unwrap_or(14.0), target);
        fs::write(&playlist, media_playlist(&durations, true))?;
        let skip = if self.broken_heights.contains(&height) {
            durations.len().checked_sub(1)
        } else {
            None
        };
        for index in 0..durations.len() {
            if Some(index) != skip {
                fs::write(dir.join(segment_file_name(index)), b"\x47fake-ts")?;
            }
        }
        Ok(Self::exit(0, Vec::new(), ""))
    }
}

impl CommandRunner for FakeRunner {
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, ExecError> {
        self.calls.lock().unwrap().push(invocation.clone());

        if self.missing_tools {
            return Err(ExecError::Spawn {
                program: invocation.program_name(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            });
        }

        let args = invocation.args_lossy();
        if args.iter().any(|a| a == "-version") {
            Ok(self.version(invocation))
        } else if args.iter().any(|a| a == "-show_streams") {
            Ok(self.probe())
        } else if args.iter().any(|a| a == "-hls_segment_filename") {
            self.encode(invocation, timeout)
        } else if args.iter().any(|a| a == "-frames:v") {
            Ok(self.thumbnail())
        } else {
            Ok(Self::exit(1, Vec::new(), "unrecognised invocation"))
        }
    }
}

#[test]
fn segment_durations_split_with_tail() {
    assert_eq!(segment_durations(14.0, 6.0), vec![6.0, 6.0, 2.0]);
    assert_eq!(segment_durations(12.0, 6.0), vec![6.0, 6.0]);
    assert_eq!(segment_durations(3.0, 6.0), vec![3.0]);
}
