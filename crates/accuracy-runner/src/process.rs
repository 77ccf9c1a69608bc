use crate::{RunnerStatus, ValidatorRunner, ValidatorRunnerOptions};
use accuracy_core::{BenchmarkEvent, DelegateSettings, ErrorStage};
use anyhow::Result;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub const VALIDATOR_COMMAND_ENV: &str = "ACCURACY_VALIDATOR_COMMAND";

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorCommand {
    argv: Vec<String>,
}

impl ValidatorCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn from_env() -> Self {
        let argv = std::env::var(VALIDATOR_COMMAND_ENV)
            .map(|raw| raw.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        Self { argv }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    pub fn runner(&self, options: ValidatorRunnerOptions) -> ProcessValidatorRunner {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        ProcessValidatorRunner {
            options,
            command: resolve_command(&self.argv, &base),
            initialized: false,
        }
    }
}

/// Runs each validation trial in a child process and turns every way the
/// child can go wrong into an event without a result.
#[derive(Debug)]
pub struct ProcessValidatorRunner {
    options: ValidatorRunnerOptions,
    command: Vec<String>,
    initialized: bool,
}

impl ProcessValidatorRunner {
    pub fn options(&self) -> &ValidatorRunnerOptions {
        &self.options
    }

    fn check_preconditions(&self) -> RunnerStatus {
        if self.command.is_empty() {
            return RunnerStatus::ValidatorCommandMissing;
        }
        if !self.options.data_directory_path.is_dir() || self.options.per_test_timeout_ms == 0 {
            return RunnerStatus::PreconditionNotMet;
        }
        if self.options.model.fd < 0 || self.options.model.size == 0 {
            return RunnerStatus::ModelReadFailed;
        }
        if command_part_looks_like_path(&self.command[0]) && !Path::new(&self.command[0]).exists()
        {
            return RunnerStatus::ValidatorNotFound;
        }
        let storage_parent_ok = self
            .options
            .storage_path
            .parent()
            .map(|p| p.is_dir())
            .unwrap_or(false);
        if !storage_parent_ok {
            return RunnerStatus::StorageUnavailable;
        }
        RunnerStatus::Success
    }

    fn validate_one(&self, settings: &DelegateSettings) -> BenchmarkEvent {
        let payload = match serde_json::to_vec(settings) {
            Ok(bytes) => bytes,
            Err(e) => {
                return BenchmarkEvent::failed(
                    ErrorStage::Protocol,
                    None,
                    format!("cannot encode delegate settings: {}", e),
                )
            }
        };

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.current_dir(&self.options.data_directory_path);
        for (key, value) in self.trial_env() {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return BenchmarkEvent::failed(
                    ErrorStage::Spawn,
                    None,
                    format!("failed to spawn validator {}: {}", self.command[0], e),
                )
            }
        };
        debug!(
            "validator started: pid={}, command={}",
            child.id(),
            self.command.join(" ")
        );

        // Keep stdin off the polling thread so a child that never reads it
        // cannot stall the deadline. The writer is detached and ends on its
        // own, at the latest with EPIPE once the read end is closed.
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                let _ = stdin.write_all(&payload);
            });
        }
        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let deadline = Instant::now() + Duration::from_millis(self.options.per_test_timeout_ms);
        let status = match wait_with_deadline(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(
                    "validator exceeded per-test timeout of {} ms; killed",
                    self.options.per_test_timeout_ms
                );
                return self.timed_out();
            }
            Err(e) => {
                return BenchmarkEvent::failed(
                    ErrorStage::Crash,
                    None,
                    format!("failed to wait for validator: {}", e),
                )
            }
        };

        // A descendant that inherited stdout or stderr keeps the pipe open
        // after the validator itself exits; the deadline covers draining too.
        let (Some(stdout), Some(stderr)) = (
            collect(stdout_reader, deadline),
            collect(stderr_reader, deadline),
        ) else {
            warn!(
                "validator exited ({}) but its output pipes stayed open past {} ms",
                status, self.options.per_test_timeout_ms
            );
            return self.timed_out();
        };
        event_from_output(status, &stdout, &stderr)
    }

    fn timed_out(&self) -> BenchmarkEvent {
        BenchmarkEvent::failed(
            ErrorStage::Timeout,
            None,
            format!(
                "validation did not finish within {} ms",
                self.options.per_test_timeout_ms
            ),
        )
    }

    fn trial_env(&self) -> Vec<(&'static str, String)> {
        let model = &self.options.model;
        let mut env = vec![
            ("ACCURACY_MODEL_FD", model.fd.to_string()),
            ("ACCURACY_MODEL_OFFSET", model.offset.to_string()),
            ("ACCURACY_MODEL_SIZE", model.size.to_string()),
            (
                "ACCURACY_DATA_DIR",
                self.options.data_directory_path.to_string_lossy().to_string(),
            ),
            (
                "ACCURACY_STORAGE_PATH",
                self.options.storage_path.to_string_lossy().to_string(),
            ),
            (
                "ACCURACY_TIMEOUT_MS",
                self.options.per_test_timeout_ms.to_string(),
            ),
        ];
        if cfg!(target_os = "linux") {
            env.push((
                "ACCURACY_MODEL_PATH",
                format!("/proc/{}/fd/{}", std::process::id(), model.fd),
            ));
        }
        env
    }
}

impl ValidatorRunner for ProcessValidatorRunner {
    fn init(&mut self) -> RunnerStatus {
        let status = self.check_preconditions();
        if status.is_success() {
            self.initialized = true;
        } else {
            debug!(
                "validator runner preconditions failed: {:?} (code {})",
                status,
                status.code()
            );
        }
        status
    }

    fn trigger_validation(&mut self, settings: &[&DelegateSettings]) -> Vec<Vec<u8>> {
        if !self.initialized {
            error!("validation triggered before the validator runner was initialized");
            return Vec::new();
        }
        let mut results = Vec::with_capacity(settings.len());
        for s in settings {
            let event = self.validate_one(s).with_settings(s);
            if let Err(e) = append_storage_event(&self.options.storage_path, &event) {
                warn!(
                    "Failed to append event to storage file ({}): {}",
                    self.options.storage_path.display(),
                    e
                );
            }
            match event.encode() {
                Ok(bytes) => results.push(bytes),
                Err(e) => error!("failed to encode result event: {}", e),
            }
        }
        results
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// `None` when the pipe is still open at `deadline`.
fn collect(reader: Option<Receiver<Vec<u8>>>, deadline: Instant) -> Option<Vec<u8>> {
    match reader {
        Some(rx) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .ok(),
        None => Some(Vec::new()),
    }
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {}
            Err(e) => {
                reap(child);
                return Err(e);
            }
        }
        if Instant::now() >= deadline {
            reap(child);
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn event_from_output(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> BenchmarkEvent {
    if !status.success() {
        let stderr = String::from_utf8_lossy(stderr);
        let tail = stderr_tail(&stderr);
        let message = if tail.is_empty() {
            format!("validator terminated abnormally ({})", status)
        } else {
            format!("validator terminated abnormally ({}): {}", status, tail)
        };
        return BenchmarkEvent::failed(ErrorStage::Crash, status.code(), message);
    }

    let stdout = String::from_utf8_lossy(stdout);
    let last_line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|s| s.trim().to_string());
    match last_line {
        Some(line) => match BenchmarkEvent::decode(line.as_bytes()) {
            Ok(event) => event,
            Err(e) => BenchmarkEvent::failed(ErrorStage::Protocol, status.code(), e.to_string()),
        },
        None => BenchmarkEvent::failed(
            ErrorStage::Protocol,
            status.code(),
            "validator exited without reporting a result event",
        ),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

fn append_storage_event(storage_path: &Path, event: &BenchmarkEvent) -> Result<()> {
    let mut line = event.encode()?;
    line.push(b'\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(storage_path)?;
    file.write_all(&line)?;
    file.sync_all()?;
    Ok(())
}

fn resolve_command(command: &[String], base: &Path) -> Vec<String> {
    let mut resolved = Vec::new();
    for (idx, part) in command.iter().enumerate() {
        let p = Path::new(part);
        if idx == 0 && p.is_relative() && command_part_looks_like_path(part) {
            resolved.push(normalize_path(&base.join(p)).to_string_lossy().to_string());
        } else {
            resolved.push(part.clone());
        }
    }
    resolved
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn command_part_looks_like_path(part: &str) -> bool {
    part.contains('/') || part.contains('\\')
}
