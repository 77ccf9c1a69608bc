use accuracy_core::{
    parse_delegate_settings_file, sha256_file, BenchmarkEvent, BenchmarkStatus, ModelHandle,
};
use accuracy_runner::{ValidatorCommand, STORAGE_FILE_NAME};
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "accuracy-bench",
    version,
    about = "Delegate accuracy benchmark runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(long)]
        model: PathBuf,
        #[arg(long, default_value_t = 0)]
        model_offset: u64,
        #[arg(long)]
        model_size: Option<u64>,
        #[arg(long)]
        result_dir: PathBuf,
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        validator: Option<String>,
        #[arg(long = "validator-arg", allow_hyphen_values = true)]
        validator_args: Vec<String>,
        #[arg(long)]
        json: bool,
        #[arg(last = true)]
        benchmark_args: Vec<String>,
    },
    CheckSettings {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    InspectStorage {
        #[arg(long)]
        result_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Statuses {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(outcome) => {
            if let Some(payload) = outcome.payload {
                emit_json(&payload);
            }
            if outcome.exit_code != 0 {
                std::process::exit(outcome.exit_code);
            }
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(ERROR_EXIT_CODE);
        }
    }
}

/// Command errors exit like a non-verdict status, never like `Fail`.
const ERROR_EXIT_CODE: i32 = 2;

fn exit_code_for(status: BenchmarkStatus) -> i32 {
    match status {
        BenchmarkStatus::Pass => 0,
        BenchmarkStatus::Fail => 1,
        _ => ERROR_EXIT_CODE,
    }
}

struct CommandOutcome {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutcome {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }
}

fn run_command(command: Commands) -> Result<CommandOutcome> {
    match command {
        Commands::Run {
            model,
            model_offset,
            model_size,
            result_dir,
            settings,
            validator,
            validator_args,
            json,
            benchmark_args,
        } => {
            let model_file = File::open(&model)
                .map_err(|e| anyhow!("cannot open model {}: {}", model.display(), e))?;
            let model_len = model_file.metadata()?.len();
            let handle = ModelHandle {
                fd: raw_fd(&model_file)?,
                offset: model_offset,
                size: resolve_model_size(model_len, model_offset, model_size)
                    .map_err(|e| anyhow!("{}: {}", model.display(), e))?,
            };
            debug!(
                "model {} opened as fd {} (offset {}, size {})",
                model.display(),
                handle.fd,
                handle.offset,
                handle.size
            );

            let mut args = Vec::new();
            if let Some(path) = settings.as_ref() {
                args.push(accuracy_runner::settings_file_arg(path));
            }
            args.extend(benchmark_args);

            let command = match validator {
                Some(program) => {
                    let mut argv = vec![program];
                    argv.extend(validator_args);
                    ValidatorCommand::new(argv)
                }
                None => ValidatorCommand::from_env(),
            };

            let status = accuracy_runner::benchmark_with(&args, handle, &result_dir, |options| {
                command.runner(options)
            });
            drop(model_file);

            let exit_code = exit_code_for(status);
            if json {
                return Ok(CommandOutcome {
                    payload: Some(run_payload(status, &model, &handle, &result_dir, &command)),
                    exit_code,
                });
            }
            println!("status: {}", status);
            println!("code: {}", status.code());
            println!("result_dir: {}", result_dir.display());
            Ok(CommandOutcome {
                payload: None,
                exit_code,
            })
        }
        Commands::CheckSettings { file, json } => {
            let settings = parse_delegate_settings_file(&file)?;
            let digest = sha256_file(&file)?;
            if json {
                return Ok(CommandOutcome {
                    payload: Some(json!({
                        "ok": true,
                        "command": "check-settings",
                        "file": file.display().to_string(),
                        "digest": digest,
                        "delegate": settings.label(),
                        "settings": serde_json::to_value(&settings)?,
                    })),
                    exit_code: 0,
                });
            }
            println!("file: {}", file.display());
            println!("digest: {}", digest);
            println!("delegate: {}", settings.label());
            Ok(CommandOutcome::done())
        }
        Commands::InspectStorage { result_dir, json } => {
            let storage_path = result_dir.join(STORAGE_FILE_NAME);
            let events = accuracy_runner::read_storage_events(&storage_path)?;
            if json {
                let items: Vec<Value> = events.iter().map(event_to_json).collect();
                return Ok(CommandOutcome {
                    payload: Some(json!({
                        "ok": true,
                        "command": "inspect-storage",
                        "storage_path": storage_path.display().to_string(),
                        "events": items,
                    })),
                    exit_code: 0,
                });
            }
            println!("storage_path: {}", storage_path.display());
            println!("events: {}", events.len());
            for (idx, event) in events.iter().enumerate() {
                print_event(idx, event);
            }
            Ok(CommandOutcome::done())
        }
        Commands::Statuses { json } => {
            if json {
                return Ok(CommandOutcome {
                    payload: Some(statuses_payload()),
                    exit_code: 0,
                });
            }
            for status in BenchmarkStatus::ALL {
                println!("{:>2} {}", status.code(), status);
            }
            Ok(CommandOutcome::done())
        }
    }
}

fn resolve_model_size(model_len: u64, offset: u64, size: Option<u64>) -> Result<u64> {
    if offset > model_len {
        return Err(anyhow!(
            "model offset {} is past the end of the file ({} bytes)",
            offset,
            model_len
        ));
    }
    let available = model_len - offset;
    match size {
        Some(size) if size > available => Err(anyhow!(
            "model size {} at offset {} runs past the end of the file ({} bytes)",
            size,
            offset,
            model_len
        )),
        Some(size) => Ok(size),
        None => Ok(available),
    }
}

fn run_payload(
    status: BenchmarkStatus,
    model: &Path,
    handle: &ModelHandle,
    result_dir: &Path,
    command: &ValidatorCommand,
) -> Value {
    json!({
        "ok": status.is_verdict(),
        "command": "run",
        "status": status.as_str(),
        "code": status.code(),
        "model": {
            "path": model.display().to_string(),
            "offset": handle.offset,
            "size": handle.size,
        },
        "result_dir": result_dir.display().to_string(),
        "storage_path": result_dir.join(STORAGE_FILE_NAME).display().to_string(),
        "validator": command.argv(),
    })
}

fn statuses_payload() -> Value {
    let items: Vec<Value> = BenchmarkStatus::ALL
        .iter()
        .map(|s| {
            json!({
                "name": s.as_str(),
                "code": s.code(),
                "exit_code": exit_code_for(*s),
            })
        })
        .collect();
    json!({
        "ok": true,
        "command": "statuses",
        "statuses": items,
    })
}

#[cfg(unix)]
fn raw_fd(file: &File) -> Result<i32> {
    use std::os::unix::io::AsRawFd;
    Ok(file.as_raw_fd())
}

#[cfg(not(unix))]
fn raw_fd(_file: &File) -> Result<i32> {
    Err(anyhow!("model file descriptors are only supported on unix targets"))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::CheckSettings { json, .. }
        | Commands::InspectStorage { json, .. }
        | Commands::Statuses { json } => *json,
    }
}

fn event_to_json(event: &BenchmarkEvent) -> Value {
    json!({
        "event_type": event.event_type,
        "delegate": event.delegate_settings.as_ref().map(|s| s.label()),
        "ok": event.result.as_ref().map(|r| r.ok),
        "error_stage": event.error.as_ref().map(|e| e.stage),
        "exit_code": event.error.as_ref().and_then(|e| e.exit_code),
        "message": event.error.as_ref().and_then(|e| e.message.clone()),
        "wallclock_us": event.wallclock_us,
    })
}

fn print_event(idx: usize, event: &BenchmarkEvent) {
    let delegate = event
        .delegate_settings
        .as_ref()
        .map(|s| s.label())
        .unwrap_or_else(|| "unknown".to_string());
    match (&event.result, &event.error) {
        (Some(result), _) => println!("[{}] delegate={} ok={}", idx, delegate, result.ok),
        (None, Some(err)) => println!(
            "[{}] delegate={} error={:?} exit_code={} message={}",
            idx,
            delegate,
            err.stage,
            err.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            err.message.as_deref().unwrap_or("")
        ),
        (None, None) => println!("[{}] delegate={} no result", idx, delegate),
    }
}
