//! Configuration structures for lmshim
//!
//! Configuration is loaded from a YAML file and can be overridden by
//! environment variables prefixed with `LMSHIM_`, using `__` to separate
//! nested keys (for example `LMSHIM_GENERATION__TOP_K=20`).

use crate::error::{LmShimError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "LMSHIM";

/// Top-level configuration for the predictor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Which model to load and from where
    #[serde(default)]
    pub model: ModelConfig,

    /// Defaults merged under every request
    #[serde(default)]
    pub generation: GenerationDefaults,

    /// Device and precision
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Model source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hub repository id
    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Hub revision (branch, tag or commit)
    #[serde(default = "default_revision")]
    pub revision: String,

    /// Load from this directory instead of the hub
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<PathBuf>,

    /// Hub cache directory (hub default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Hub access token for gated repositories
    #[serde(default, skip_serializing)]
    pub hf_token: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            revision: default_revision(),
            local_dir: None,
            cache_dir: None,
            hf_token: None,
        }
    }
}

/// Generation parameter defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    #[serde(default = "default_no_repeat_ngram_size")]
    pub no_repeat_ngram_size: usize,

    #[serde(default = "default_do_sample")]
    pub do_sample: bool,

    /// Reuse attention keys/values between decoding steps
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,

    /// Stream when the request does not say
    #[serde(default)]
    pub stream: bool,

    /// Include the prompt text in the returned or streamed output
    #[serde(default = "default_echo_prompt")]
    pub echo_prompt: bool,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            no_repeat_ngram_size: default_no_repeat_ngram_size(),
            do_sample: default_do_sample(),
            use_cache: default_use_cache(),
            stream: false,
            echo_prompt: default_echo_prompt(),
        }
    }
}

/// Device selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// CUDA if available, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Weight precision
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WeightDType {
    #[default]
    F16,
    Bf16,
    F32,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DeviceKind,

    /// Accelerator ordinal
    #[serde(default)]
    pub device_ordinal: usize,

    #[serde(default)]
    pub dtype: WeightDType,

    #[serde(default)]
    pub use_flash_attn: bool,

    /// Text chunks buffered between the generation thread and its consumer
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Seconds a request waits for the model before failing as busy
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Auto,
            device_ordinal: 0,
            dtype: WeightDType::F16,
            use_flash_attn: false,
            stream_buffer: default_stream_buffer(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Write the metrics exposition here on exit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_file: Option<PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
            enable_metrics: default_metrics(),
            metrics_file: None,
        }
    }
}

/// Default value functions
fn default_model_id() -> String {
    "NousResearch/Nous-Capybara-34B".to_string()
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_max_new_tokens() -> usize {
    256
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.8
}

fn default_top_k() -> usize {
    40
}

fn default_repetition_penalty() -> f32 {
    1.3
}

fn default_no_repeat_ngram_size() -> usize {
    5
}

fn default_do_sample() -> bool {
    true
}

fn default_use_cache() -> bool {
    true
}

fn default_echo_prompt() -> bool {
    true
}

fn default_stream_buffer() -> usize {
    64
}

fn default_lock_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl PredictorConfig {
    /// Load configuration from a YAML file layered under `LMSHIM_*` variables
    ///
    /// A missing file is only an error when `required` is set.
    pub fn load<P: AsRef<Path>>(path: P, required: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = config::File::new(&path.to_string_lossy(), config::FileFormat::Yaml)
            .required(required);

        Self::build(file, None)
    }

    /// Load configuration from a YAML string and an explicit variable map
    pub fn from_yaml_str(yaml: &str, env: HashMap<String, String>) -> Result<Self> {
        let file = config::File::from_str(yaml, config::FileFormat::Yaml);
        Self::build(file, Some(env))
    }

    fn build<S>(file: S, env: Option<HashMap<String, String>>) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let config: PredictorConfig = config::Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.local_dir.is_none() && self.model.model_id.trim().is_empty() {
            return Err(LmShimError::config(
                "model.model_id is required when model.local_dir is not set",
            ));
        }

        let generation = &self.generation;
        if generation.max_new_tokens == 0 {
            return Err(LmShimError::config("generation.max_new_tokens must be positive"));
        }
        if generation.do_sample && generation.temperature <= 0.0 {
            return Err(LmShimError::config(format!(
                "generation.temperature must be positive when sampling, got {}",
                generation.temperature
            )));
        }
        if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
            return Err(LmShimError::config(format!(
                "generation.top_p must be in (0, 1], got {}",
                generation.top_p
            )));
        }
        if generation.repetition_penalty <= 0.0 {
            return Err(LmShimError::config(format!(
                "generation.repetition_penalty must be positive, got {}",
                generation.repetition_penalty
            )));
        }
        if self.runtime.stream_buffer == 0 {
            return Err(LmShimError::config("runtime.stream_buffer must be positive"));
        }
        if self.runtime.lock_timeout_secs == 0 {
            return Err(LmShimError::config("runtime.lock_timeout_secs must be positive"));
        }

        Ok(())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| LmShimError::config(format!("Failed to render config: {}", e)))
    }
}
