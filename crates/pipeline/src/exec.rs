//! External process execution.
//!
//! Every call out to ffmpeg/ffprobe goes through [`CommandRunner`] so the
//! pipeline can be driven by a scripted fake in tests.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors raised while running an external process.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran past its ceiling and was killed.
    #[error("{program} exceeded {}s and was killed", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    /// IO error while waiting on the child.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Arguments as lossy strings, for logging and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<String> {
        let args = self.args_lossy();
        args.windows(2)
            .find(|pair| pair[0] == flag)
            .map(|pair| pair[1].clone())
    }

    /// Program file name, used in error messages.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last `max_lines` lines of stderr, for failure reasons.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Synchronous process execution capability.
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` to completion, killing it once `timeout` elapses.
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, ExecError>;
}

/// Runs real processes via `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        })
    }

    fn wait_with_deadline(
        child: &mut Child,
        timeout: Option<Duration>,
    ) -> std::io::Result<Option<std::process::ExitStatus>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, ExecError> {
        let program = invocation.program_name();
        let mut child = invocation
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Pipes are drained concurrently so a chatty child never blocks on a full buffer
        let stdout = Self::drain(child.stdout.take());
        let stderr = Self::drain(child.stderr.take());

        let status = match Self::wait_with_deadline(&mut child, timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout.join();
                let _ = stderr.join();
                return Err(ExecError::TimedOut {
                    program,
                    timeout: timeout.unwrap_or_default(),
                });
            }
        };

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builder_and_flag_lookup() {
        let mut inv = Invocation::new("/usr/bin/ffmpeg");
        inv.arg("-i").arg("in.mp4").args(["-hls_time", "6"]);

        assert_eq!(inv.args_lossy(), vec!["-i", "in.mp4", "-hls_time", "6"]);
        assert_eq!(inv.flag_value("-hls_time"), Some("6".to_string()));
        assert_eq!(inv.flag_value("-missing"), None);
        assert_eq!(inv.program_name(), "ffmpeg");
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let output = ProcessOutput {
            exit_code: Some(1),
            stdout: Vec::new(),
            stderr: b"one\ntwo\n\nthree\nfour\n".to_vec(),
        };
        assert_eq!(output.stderr_tail(2), "three\nfour");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_captures_output() {
        let mut inv = Invocation::new("sh");
        inv.args(["-c", "echo out; echo err 1>&2; exit 3"]);

        let output = SystemRunner.run(&inv, Some(Duration::from_secs(10))).unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_kills_on_timeout() {
        let mut inv = Invocation::new("sleep");
        inv.arg("5");

        let started = Instant::now();
        let result = SystemRunner.run(&inv, Some(Duration::from_millis(100)));
        assert!(matches!(result, Err(ExecError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_system_runner_reports_spawn_failure() {
        let inv = Invocation::new("/nonexistent/definitely-not-a-tool");
        let result = SystemRunner.run(&inv, None);
        assert!(matches!(result, Err(ExecError::Spawn { .. })));
    }
}
