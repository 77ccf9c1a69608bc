mod process;

pub use process::{ProcessValidatorRunner, ValidatorCommand, VALIDATOR_COMMAND_ENV};

use accuracy_core::{
    load_delegate_settings, BenchmarkEvent, BenchmarkStatus, DelegateSettings, ModelHandle,
};
use anyhow::Result;
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

pub const PER_TEST_TIMEOUT_MS: u64 = 5000;
pub const STORAGE_FILE_NAME: &str = "storage_path.fb";
pub const SETTINGS_FILE_FLAG: &str = "stable_delegate_settings_file";

const PROGRAM_NAME: &str = "(MiniBenchmarkAndroid)";

#[derive(Debug, Error)]
pub enum TrialError {
    #[error("failed to parse arguments: {0}")]
    ArgumentParsing(String),
    #[error("failed to parse delegate settings from the input JSON file {0}")]
    SettingsParsing(String),
    #[error("validator runner initialization failed with error code {code}")]
    RunnerInitialization { code: i32 },
    #[error("number of result events ({actual}) doesn't match the expectation ({expected})")]
    ResultCountMismatch { expected: usize, actual: usize },
    #[error("malformed result event: {0}")]
    MalformedResult(String),
}

impl TrialError {
    pub fn status(&self) -> BenchmarkStatus {
        match self {
            TrialError::ArgumentParsing(_) => BenchmarkStatus::ArgumentParsingFailed,
            TrialError::SettingsParsing(_) => BenchmarkStatus::TfLiteSettingsParsingFailed,
            TrialError::RunnerInitialization { .. } => BenchmarkStatus::RunnerInitializationFailed,
            TrialError::ResultCountMismatch { .. } => BenchmarkStatus::ResultCountMismatch,
            TrialError::MalformedResult(_) => BenchmarkStatus::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Success,
    PreconditionNotMet,
    ModelReadFailed,
    ValidatorCommandMissing,
    ValidatorNotFound,
    StorageUnavailable,
}

impl RunnerStatus {
    pub fn code(self) -> i32 {
        match self {
            RunnerStatus::Success => 0,
            RunnerStatus::PreconditionNotMet => 1,
            RunnerStatus::ModelReadFailed => 2,
            RunnerStatus::ValidatorCommandMissing => 3,
            RunnerStatus::ValidatorNotFound => 4,
            RunnerStatus::StorageUnavailable => 5,
        }
    }

    pub fn is_success(self) -> bool {
        self == RunnerStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRunnerOptions {
    pub model: ModelHandle,
    pub data_directory_path: PathBuf,
    pub storage_path: PathBuf,
    pub per_test_timeout_ms: u64,
}

/// Execution engine that runs validation trials, normally behind a process
/// boundary.
///
/// `trigger_validation` must return one serialized [`BenchmarkEvent`] per
/// submitted configuration, in submission order. Crashes and timeouts inside
/// the engine are reported as events without a result, never as panics.
pub trait ValidatorRunner {
    fn init(&mut self) -> RunnerStatus;
    fn trigger_validation(&mut self, settings: &[&DelegateSettings]) -> Vec<Vec<u8>>;
}

#[derive(Parser, Debug)]
#[command(
    name = "(MiniBenchmarkAndroid)",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct BenchmarkArgs {
    #[arg(long = "stable_delegate_settings_file", required = true)]
    stable_delegate_settings_file: String,
}

pub fn parse_settings_file_path(args: &[String]) -> Result<String, TrialError> {
    let argv = std::iter::once(PROGRAM_NAME.to_string()).chain(args.iter().cloned());
    BenchmarkArgs::try_parse_from(argv)
        .map(|parsed| parsed.stable_delegate_settings_file)
        .map_err(|e| TrialError::ArgumentParsing(e.to_string().trim().to_string()))
}

pub fn settings_file_arg(path: &Path) -> String {
    format!("--{}={}", SETTINGS_FILE_FLAG, path.display())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRequest {
    pub model: ModelHandle,
    pub result_dir: PathBuf,
    pub per_test_timeout_ms: u64,
}

impl TrialRequest {
    pub fn new(model: ModelHandle, result_dir: &Path) -> Self {
        Self {
            model,
            result_dir: result_dir.to_path_buf(),
            per_test_timeout_ms: PER_TEST_TIMEOUT_MS,
        }
    }

    pub fn storage_path(&self) -> PathBuf {
        self.result_dir.join(STORAGE_FILE_NAME)
    }

    fn runner_options(&self) -> ValidatorRunnerOptions {
        ValidatorRunnerOptions {
            model: self.model,
            data_directory_path: self.result_dir.clone(),
            storage_path: self.storage_path(),
            per_test_timeout_ms: self.per_test_timeout_ms,
        }
    }
}

// A missing file is the common case on a first run.
fn prepare_storage(storage_path: &Path) {
    if let Err(e) = fs::remove_file(storage_path) {
        warn!(
            "Failed to remove storage file ({}): {}.",
            storage_path.display(),
            e
        );
    }
}

pub fn run_trial<R, F>(
    request: TrialRequest,
    settings: &DelegateSettings,
    make_runner: F,
) -> Result<BenchmarkEvent, TrialError>
where
    R: ValidatorRunner,
    F: FnOnce(ValidatorRunnerOptions) -> R,
{
    prepare_storage(&request.storage_path());

    let mut runner = make_runner(request.runner_options());
    let status = runner.init();
    if !status.is_success() {
        return Err(TrialError::RunnerInitialization {
            code: status.code(),
        });
    }

    let batch = [settings];
    let results = runner.trigger_validation(&batch);
    if results.len() != batch.len() {
        return Err(TrialError::ResultCountMismatch {
            expected: batch.len(),
            actual: results.len(),
        });
    }
    BenchmarkEvent::decode(&results[0]).map_err(|e| TrialError::MalformedResult(e.to_string()))
}

pub fn classify(event: &BenchmarkEvent) -> BenchmarkStatus {
    match event.result.as_ref() {
        Some(result) if result.ok => BenchmarkStatus::Pass,
        _ => BenchmarkStatus::Fail,
    }
}

pub fn benchmark(
    args: &[String],
    model_fd: i32,
    model_offset: u64,
    model_size: u64,
    result_path: &Path,
) -> BenchmarkStatus {
    let command = ValidatorCommand::from_env();
    let model = ModelHandle {
        fd: model_fd,
        offset: model_offset,
        size: model_size,
    };
    benchmark_with(args, model, result_path, |options| command.runner(options))
}

pub fn benchmark_with<R, F>(
    args: &[String],
    model: ModelHandle,
    result_path: &Path,
    make_runner: F,
) -> BenchmarkStatus
where
    R: ValidatorRunner,
    F: FnOnce(ValidatorRunnerOptions) -> R,
{
    match run_pipeline(args, model, result_path, make_runner) {
        Ok(status) => status,
        Err(err) => {
            let status = err.status();
            error!("{} (status {}, code {})", err, status, status.code());
            status
        }
    }
}

fn run_pipeline<R, F>(
    args: &[String],
    model: ModelHandle,
    result_path: &Path,
    make_runner: F,
) -> Result<BenchmarkStatus, TrialError>
where
    R: ValidatorRunner,
    F: FnOnce(ValidatorRunnerOptions) -> R,
{
    let settings_path = parse_settings_file_path(args)?;
    let settings = load_delegate_settings(Path::new(&settings_path))
        .ok_or_else(|| TrialError::SettingsParsing(settings_path.clone()))?;

    let request = TrialRequest::new(model, result_path);
    info!(
        "starting accuracy trial: delegate={}, result_dir={}, timeout_ms={}",
        settings.label(),
        request.result_dir.display(),
        request.per_test_timeout_ms
    );
    let event = run_trial(request, &settings, make_runner)?;
    let verdict = classify(&event);
    info!("accuracy trial finished: delegate={}, verdict={}", settings.label(), verdict);
    Ok(verdict)
}

pub fn read_storage_events(storage_path: &Path) -> Result<Vec<BenchmarkEvent>> {
    if !storage_path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(storage_path)?;
    let mut events = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match BenchmarkEvent::decode(line.as_bytes()) {
            Ok(event) => events.push(event),
            Err(_) => continue,
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accuracy_core::{ensure_dir, BenchmarkResult, ErrorStage};
    use chrono::Utc;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "accuracy_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    fn model() -> ModelHandle {
        ModelHandle {
            fd: 7,
            offset: 128,
            size: 4096,
        }
    }

    fn write_settings(dir: &Path, body: &str) -> Vec<String> {
        let path = dir.join("settings.json");
        fs::write(&path, body).expect("write settings");
        vec![settings_file_arg(&path)]
    }

    fn ok_event(ok: bool) -> Vec<u8> {
        BenchmarkEvent::completed(BenchmarkResult {
            ok,
            ..Default::default()
        })
        .encode()
        .expect("encode")
    }

    #[derive(Default)]
    struct Observed {
        options: Option<ValidatorRunnerOptions>,
        storage_existed_at_init: Option<bool>,
        submitted: Vec<String>,
    }

    struct FakeRunner {
        init_status: RunnerStatus,
        results: Vec<Vec<u8>>,
        observed: Rc<RefCell<Observed>>,
    }

    impl ValidatorRunner for FakeRunner {
        fn init(&mut self) -> RunnerStatus {
            let mut observed = self.observed.borrow_mut();
            let exists = observed
                .options
                .as_ref()
                .map(|o| o.storage_path.exists())
                .unwrap_or(false);
            observed.storage_existed_at_init = Some(exists);
            self.init_status
        }

        fn trigger_validation(&mut self, settings: &[&DelegateSettings]) -> Vec<Vec<u8>> {
            let mut observed = self.observed.borrow_mut();
            for s in settings {
                observed.submitted.push(s.label());
            }
            std::mem::take(&mut self.results)
        }
    }

    fn fake(
        init_status: RunnerStatus,
        results: Vec<Vec<u8>>,
    ) -> (
        Rc<RefCell<Observed>>,
        impl FnOnce(ValidatorRunnerOptions) -> FakeRunner,
    ) {
        let observed = Rc::new(RefCell::new(Observed::default()));
        let handle = Rc::clone(&observed);
        let make = move |options: ValidatorRunnerOptions| {
            handle.borrow_mut().options = Some(options);
            FakeRunner {
                init_status,
                results,
                observed: handle,
            }
        };
        (observed, make)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_settings_file_path_returns_value_verbatim() {
        for value in [
            "/tmp/cfg.json",
            "relative/settings.json",
            "/tmp/with space.json",
            "/tmp/a=b.json",
            "-leading-dash.json",
        ] {
            let list = vec![format!("--stable_delegate_settings_file={}", value)];
            let parsed = parse_settings_file_path(&list).expect("well-formed flag");
            assert_eq!(parsed, value);
        }
    }

    #[test]
    fn parse_settings_file_path_rejects_malformed_lists() {
        let cases = vec![
            args(&[]),
            args(&["--other_flag=1"]),
            args(&["/tmp/cfg.json"]),
            args(&["--stable_delegate_settings_file"]),
            args(&["--stable_delegate_settings_file=/a.json", "--extra=1"]),
            args(&["--stable_delegate_settings_file=/a.json", "positional"]),
            args(&["--", "--stable_delegate_settings_file=/a.json"]),
            args(&["--help"]),
            args(&["--version"]),
            args(&["-stable_delegate_settings_file=/a.json"]),
        ];
        for case in cases {
            let err = parse_settings_file_path(&case).expect_err("malformed args must fail");
            assert_eq!(
                err.status(),
                BenchmarkStatus::ArgumentParsingFailed,
                "case {:?}",
                case
            );
        }
    }

    #[test]
    fn benchmark_reports_argument_failure_before_touching_runner() {
        let dir = temp_dir("args");
        let (observed, make) = fake(RunnerStatus::Success, vec![ok_event(true)]);
        let status = benchmark_with(&args(&["--bogus"]), model(), &dir, make);
        assert_eq!(status, BenchmarkStatus::ArgumentParsingFailed);
        assert!(observed.borrow().options.is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn benchmark_reports_unparsable_settings() {
        let dir = temp_dir("bad_settings");
        let list = write_settings(&dir, "{ this is not json");
        let (observed, make) = fake(RunnerStatus::Success, vec![ok_event(true)]);
        let status = benchmark_with(&list, model(), &dir, make);
        assert_eq!(status, BenchmarkStatus::TfLiteSettingsParsingFailed);
        assert!(observed.borrow().options.is_none());

        let missing = vec![settings_file_arg(&dir.join("nope.json"))];
        let (_, make) = fake(RunnerStatus::Success, vec![ok_event(true)]);
        assert_eq!(
            benchmark_with(&missing, model(), &dir, make),
            BenchmarkStatus::TfLiteSettingsParsingFailed
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn benchmark_reports_init_failure_without_submitting() {
        let dir = temp_dir("init");
        let list = write_settings(&dir, r#"{"delegate": "GPU"}"#);
        let (observed, make) = fake(RunnerStatus::ModelReadFailed, vec![ok_event(true)]);
        let status = benchmark_with(&list, model(), &dir, make);
        assert_eq!(status, BenchmarkStatus::RunnerInitializationFailed);
        assert!(observed.borrow().submitted.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_trial_carries_native_init_code() {
        let dir = temp_dir("init_code");
        let (_, make) = fake(RunnerStatus::StorageUnavailable, Vec::new());
        let err = run_trial(
            TrialRequest::new(model(), &dir),
            &DelegateSettings::default(),
            make,
        )
        .expect_err("init must fail");
        match err {
            TrialError::RunnerInitialization { code } => assert_eq!(code, 5),
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn benchmark_reports_result_count_mismatch() {
        let dir = temp_dir("mismatch");
        let list = write_settings(&dir, r#"{"delegate": "XNNPACK"}"#);
        let (_, make) = fake(RunnerStatus::Success, Vec::new());
        assert_eq!(
            benchmark_with(&list, model(), &dir, make),
            BenchmarkStatus::ResultCountMismatch
        );
        let (_, make) = fake(RunnerStatus::Success, vec![ok_event(true), ok_event(true)]);
        assert_eq!(
            benchmark_with(&list, model(), &dir, make),
            BenchmarkStatus::ResultCountMismatch
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn benchmark_maps_result_event_to_verdict() {
        let dir = temp_dir("verdict");
        let list = write_settings(&dir, r#"{"delegate": "NNAPI"}"#);

        let (observed, make) = fake(RunnerStatus::Success, vec![ok_event(true)]);
        assert_eq!(benchmark_with(&list, model(), &dir, make), BenchmarkStatus::Pass);
        assert_eq!(observed.borrow().submitted, vec!["NNAPI".to_string()]);

        let (_, make) = fake(RunnerStatus::Success, vec![ok_event(false)]);
        assert_eq!(benchmark_with(&list, model(), &dir, make), BenchmarkStatus::Fail);

        let crashed = BenchmarkEvent::failed(ErrorStage::Crash, Some(139), "segfault")
            .encode()
            .expect("encode");
        let (_, make) = fake(RunnerStatus::Success, vec![crashed]);
        assert_eq!(benchmark_with(&list, model(), &dir, make), BenchmarkStatus::Fail);

        let (_, make) = fake(RunnerStatus::Success, vec![b"\x00garbage".to_vec()]);
        assert_eq!(benchmark_with(&list, model(), &dir, make), BenchmarkStatus::Fail);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn classify_requires_ok_result() {
        let mut event = BenchmarkEvent::default();
        assert_eq!(classify(&event), BenchmarkStatus::Fail);
        event.result = Some(BenchmarkResult::default());
        assert_eq!(classify(&event), BenchmarkStatus::Fail);
        event.result = Some(BenchmarkResult {
            ok: true,
            ..Default::default()
        });
        assert_eq!(classify(&event), BenchmarkStatus::Pass);
    }

    #[test]
    fn runner_receives_request_options() {
        let dir = temp_dir("options");
        let list = write_settings(&dir, "{}");
        let (observed, make) = fake(RunnerStatus::Success, vec![ok_event(true)]);
        benchmark_with(&list, model(), &dir, make);
        let observed = observed.borrow();
        let options = observed.options.as_ref().expect("runner constructed");
        assert_eq!(options.model, model());
        assert_eq!(options.data_directory_path, dir);
        assert_eq!(options.storage_path, dir.join(STORAGE_FILE_NAME));
        assert_eq!(options.per_test_timeout_ms, PER_TEST_TIMEOUT_MS);
        drop(observed);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stale_storage_is_removed_before_each_trial() {
        let dir = temp_dir("storage");
        let list = write_settings(&dir, "{}");
        let storage = dir.join(STORAGE_FILE_NAME);

        let (observed, make) = fake(RunnerStatus::Success, vec![ok_event(true)]);
        assert_eq!(benchmark_with(&list, model(), &dir, make), BenchmarkStatus::Pass);
        assert_eq!(observed.borrow().storage_existed_at_init, Some(false));

        fs::write(&storage, b"stale state from a previous run").expect("write stale");
        let (observed, make) = fake(RunnerStatus::Success, vec![ok_event(true)]);
        assert_eq!(benchmark_with(&list, model(), &dir, make), BenchmarkStatus::Pass);
        assert_eq!(observed.borrow().storage_existed_at_init, Some(false));
        assert!(!storage.exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn read_storage_events_skips_malformed_lines() {
        let dir = temp_dir("read_storage");
        let storage = dir.join(STORAGE_FILE_NAME);
        assert!(read_storage_events(&storage).expect("missing is empty").is_empty());

        let mut body = String::from_utf8(ok_event(true)).expect("utf8");
        body.push_str("\nnot json\n\n");
        body.push_str(&String::from_utf8(ok_event(false)).expect("utf8"));
        body.push('\n');
        fs::write(&storage, body).expect("write");
        let events = read_storage_events(&storage).expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(classify(&events[0]), BenchmarkStatus::Pass);
        assert_eq!(classify(&events[1]), BenchmarkStatus::Fail);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn end_to_end_with_process_runner() {
        use std::os::unix::io::AsRawFd;

        let dir = temp_dir("e2e");
        let model_path = dir.join("model.tflite");
        fs::write(&model_path, vec![0u8; 64]).expect("write model");
        let model_file = fs::File::open(&model_path).expect("open model");
        let model = ModelHandle {
            fd: model_file.as_raw_fd(),
            offset: 0,
            size: 64,
        };
        let list = write_settings(
            &dir,
            r#"{"delegate": "XNNPACK", "xnnpack_settings": {"num_threads": 2}}"#,
        );
        let command = ValidatorCommand::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "grep -q XNNPACK && echo '{\"result\":{\"ok\":true}}'".to_string(),
        ]);

        for _ in 0..2 {
            let status = benchmark_with(&list, model, &dir, |options| command.runner(options));
            assert_eq!(status, BenchmarkStatus::Pass);
            let events = read_storage_events(&dir.join(STORAGE_FILE_NAME)).expect("storage");
            assert_eq!(events.len(), 1, "storage must be reset between runs");
        }
        drop(model_file);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn benchmark_without_validator_command_fails_initialization() {
        let dir = temp_dir("no_validator");
        let list = write_settings(&dir, "{}");
        let status = benchmark_with(&list, model(), &dir, |options| {
            ValidatorCommand::default().runner(options)
        });
        assert_eq!(status, BenchmarkStatus::RunnerInitializationFailed);
        let _ = fs::remove_dir_all(dir);
    }
}
