use anyhow::{anyhow, Result};
use chrono::Utc;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::error;

pub const DELEGATE_SETTINGS_SCHEMA: &str = "delegate_settings_v1.jsonschema";

/// Outcome of one `benchmark` call as seen by the caller.
///
/// The integer codes are stable. Variants are ordered by code so callers can
/// compare them directly. `Success` only ever reports a successful argument
/// resolution and is never returned from a completed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum BenchmarkStatus {
    #[serde(rename = "success")]
    Success = 0,
    #[serde(rename = "argument_parsing_failed")]
    ArgumentParsingFailed = 1,
    #[serde(rename = "runner_initialization_failed")]
    RunnerInitializationFailed = 2,
    #[serde(rename = "tflite_settings_parsing_failed")]
    TfLiteSettingsParsingFailed = 3,
    #[serde(rename = "result_count_mismatch")]
    ResultCountMismatch = 4,
    #[serde(rename = "fail")]
    Fail = 5,
    #[serde(rename = "pass")]
    Pass = 6,
}

impl BenchmarkStatus {
    pub const ALL: [BenchmarkStatus; 7] = [
        BenchmarkStatus::Success,
        BenchmarkStatus::ArgumentParsingFailed,
        BenchmarkStatus::RunnerInitializationFailed,
        BenchmarkStatus::TfLiteSettingsParsingFailed,
        BenchmarkStatus::ResultCountMismatch,
        BenchmarkStatus::Fail,
        BenchmarkStatus::Pass,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BenchmarkStatus::Success => "success",
            BenchmarkStatus::ArgumentParsingFailed => "argument_parsing_failed",
            BenchmarkStatus::RunnerInitializationFailed => "runner_initialization_failed",
            BenchmarkStatus::TfLiteSettingsParsingFailed => "tflite_settings_parsing_failed",
            BenchmarkStatus::ResultCountMismatch => "result_count_mismatch",
            BenchmarkStatus::Fail => "fail",
            BenchmarkStatus::Pass => "pass",
        }
    }

    // A verdict means the trial actually ran.
    pub fn is_verdict(self) -> bool {
        matches!(self, BenchmarkStatus::Pass | BenchmarkStatus::Fail)
    }
}

impl fmt::Display for BenchmarkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub fd: i32,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delegate {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "NNAPI")]
    Nnapi,
    #[serde(rename = "GPU")]
    Gpu,
    #[serde(rename = "HEXAGON")]
    Hexagon,
    #[serde(rename = "XNNPACK")]
    Xnnpack,
    #[serde(rename = "EDGETPU")]
    EdgeTpu,
    #[serde(rename = "EDGETPU_CORAL")]
    EdgeTpuCoral,
    #[serde(rename = "CORE_ML")]
    CoreMl,
    #[serde(rename = "ARMNN")]
    ArmNn,
    #[serde(rename = "MTK_NEURON")]
    MtkNeuron,
}

impl Delegate {
    pub fn as_str(self) -> &'static str {
        match self {
            Delegate::None => "NONE",
            Delegate::Nnapi => "NNAPI",
            Delegate::Gpu => "GPU",
            Delegate::Hexagon => "HEXAGON",
            Delegate::Xnnpack => "XNNPACK",
            Delegate::EdgeTpu => "EDGETPU",
            Delegate::EdgeTpuCoral => "EDGETPU_CORAL",
            Delegate::CoreMl => "CORE_ML",
            Delegate::ArmNn => "ARMNN",
            Delegate::MtkNeuron => "MTK_NEURON",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StableDelegateLoaderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_precision_loss_allowed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_quantized_inference: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_backend: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XnnpackSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NnapiSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_fp16_precision_for_fp32: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_dynamic_dimensions: Option<bool>,
}

/// Settings for exactly one delegate, as decoded from the settings JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegateSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Delegate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_delegate_loader_settings: Option<StableDelegateLoaderSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_settings: Option<CpuSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_settings: Option<GpuSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xnnpack_settings: Option<XnnpackSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nnapi_settings: Option<NnapiSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delegated_partitions: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_default_delegates: Option<bool>,
}

impl DelegateSettings {
    pub fn label(&self) -> String {
        if let Some(name) = self
            .stable_delegate_loader_settings
            .as_ref()
            .and_then(|s| s.delegate_name.as_deref())
        {
            return name.to_string();
        }
        self.delegate
            .unwrap_or(Delegate::None)
            .as_str()
            .to_string()
    }
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let raw = match name {
        DELEGATE_SETTINGS_SCHEMA => include_str!("../schemas/delegate_settings_v1.jsonschema"),
        other => return Err(anyhow!("unknown schema: {}", other)),
    };
    let schema_json: Value = serde_json::from_str(raw)?;
    JSONSchema::compile(&schema_json).map_err(|e| anyhow!("invalid schema {}: {}", name, e))
}

pub fn parse_delegate_settings(data: &str) -> Result<DelegateSettings> {
    let schema = compile_schema(DELEGATE_SETTINGS_SCHEMA)?;
    let settings_json: Value = serde_json::from_str(data)?;
    if let Err(errors) = schema.validate(&settings_json) {
        let mut msgs = Vec::new();
        for e in errors {
            msgs.push(e.to_string());
        }
        return Err(anyhow!(
            "delegate settings schema validation failed: {}",
            msgs.join("; ")
        ));
    }
    Ok(serde_json::from_value(settings_json)?)
}

pub fn parse_delegate_settings_file(path: &Path) -> Result<DelegateSettings> {
    let data = fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read {}: {}", path.display(), e))?;
    parse_delegate_settings(&data)
}

/// Reads and decodes a settings file. Every failure collapses to `None`.
pub fn load_delegate_settings(path: &Path) -> Option<DelegateSettings> {
    match parse_delegate_settings_file(path) {
        Ok(settings) => Some(settings),
        Err(err) => {
            error!(
                "Failed to parse delegate settings from the input JSON file {}: {}",
                path.display(),
                err
            );
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkEventType {
    Start,
    #[default]
    End,
    Error,
    Logged,
    RecoveredError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    #[default]
    Unknown,
    Initialization,
    Inference,
    Spawn,
    Timeout,
    Crash,
    Protocol,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMetric {
    pub name: String,
    #[serde(default)]
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initialization_time_us: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inference_time_us: Vec<i64>,
    #[serde(default)]
    pub max_memory_kb: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<BenchmarkMetric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkError {
    #[serde(default)]
    pub stage: ErrorStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkEvent {
    #[serde(default)]
    pub event_type: BenchmarkEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_settings: Option<DelegateSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BenchmarkResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BenchmarkError>,
    #[serde(default)]
    pub wallclock_us: i64,
}

impl BenchmarkEvent {
    pub fn completed(result: BenchmarkResult) -> Self {
        Self {
            event_type: BenchmarkEventType::End,
            delegate_settings: None,
            result: Some(result),
            error: None,
            wallclock_us: Utc::now().timestamp_micros(),
        }
    }

    pub fn failed(stage: ErrorStage, exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            event_type: BenchmarkEventType::Error,
            delegate_settings: None,
            result: None,
            error: Some(BenchmarkError {
                stage,
                exit_code,
                message: Some(message.into()),
            }),
            wallclock_us: Utc::now().timestamp_micros(),
        }
    }

    pub fn with_settings(mut self, settings: &DelegateSettings) -> Self {
        self.delegate_settings = Some(settings.clone());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow!("malformed benchmark event: {}", e))
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}
