//! Configuration loading and validation.
//!
//! The config is read once at startup and shared as `Arc<Config>`; nothing
//! downstream reads the environment on its own except through the
//! `resolve_*` helpers below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition: Option<RecognitionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Websocket route for client audio (default: "/voice-stream").
    #[serde(default = "default_ws_path")]
    pub path: String,
}

fn default_port() -> u16 {
    3000
}

fn default_ws_path() -> String {
    "/voice-stream".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            path: default_ws_path(),
        }
    }
}

/// Which recognition flag marks a transcript as turn-ending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTrigger {
    /// The backend's per-segment `is_final` flag.
    #[default]
    IsFinal,
    /// The backend's endpointing flag (`speech_final`).
    SpeechFinal,
}

/// Speech recognition (Deepgram live streaming) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_recognition_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_deepgram_key_env")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_deepgram_url")]
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "default_language")]
    pub language: String,

    /// Raw audio encoding of client frames (default: "linear16").
    #[serde(default = "default_encoding")]
    pub encoding: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,

    #[serde(default = "default_true")]
    pub punctuate: bool,

    #[serde(default)]
    pub interim_results: bool,

    /// Silence in ms before the backend finalizes an utterance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpointing: Option<u32>,

    #[serde(default)]
    pub turn_trigger: TurnTrigger,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Keepalive period while no audio flows (0 disables).
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// Max audio frames buffered toward the backend (oldest dropped first).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_recognition_provider() -> String {
    "deepgram".into()
}

fn default_deepgram_key_env() -> Option<String> {
    Some("DEEPGRAM_API_KEY".into())
}

fn default_deepgram_url() -> String {
    "wss://api.deepgram.com/v1/listen".into()
}

fn default_language() -> String {
    "en".into()
}

fn default_encoding() -> String {
    "linear16".into()
}

fn default_open_timeout_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_ms() -> u64 {
    250
}

fn default_keepalive_interval_ms() -> u64 {
    8_000
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            provider: default_recognition_provider(),
            api_key: None,
            api_key_env: default_deepgram_key_env(),
            url: default_deepgram_url(),
            model: None,
            language: default_language(),
            encoding: default_encoding(),
            sample_rate: None,
            punctuate: true,
            interim_results: false,
            endpointing: None,
            turn_trigger: TurnTrigger::default(),
            open_timeout_ms: default_open_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl RecognitionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text generation (OpenAI-compatible chat completions) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_openai_key_env")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Time allowed until the response stream is established.
    #[serde(default = "default_generation_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Time allowed until the completion sentinel arrives.
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
}

fn default_generation_provider() -> String {
    "openai".into()
}

fn default_openai_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".into())
}

fn default_generation_model() -> String {
    "gpt-4o".into()
}

fn default_system_prompt() -> String {
    "You are a helpful voice assistant. Respond naturally, concisely, and warmly.".into()
}

fn default_generation_open_timeout_ms() -> u64 {
    10_000
}

fn default_completion_timeout_ms() -> u64 {
    30_000
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            api_key: None,
            api_key_env: default_openai_key_env(),
            base_url: None,
            model: default_generation_model(),
            system_prompt: default_system_prompt(),
            max_tokens: None,
            temperature: None,
            open_timeout_ms: default_generation_open_timeout_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
        }
    }
}

impl GenerationConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Speech synthesis (ElevenLabs streaming input) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_synthesis_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_elevenlabs_key_env")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,

    #[serde(default = "default_voice_id_env")]
    pub voice_id_env: Option<String>,

    #[serde(default = "default_synthesis_model")]
    pub model_id: String,

    /// Websocket URL template; `{voice_id}` is substituted.
    #[serde(default = "default_elevenlabs_url")]
    pub url: String,

    #[serde(default = "default_streaming_latency")]
    pub optimize_streaming_latency: Option<u8>,

    /// e.g. "pcm_16000" or "mp3_44100_128". Backend default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,

    #[serde(default = "default_stability")]
    pub stability: f32,

    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Upper bound on waiting for the backend to finish after end-of-input.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_synthesis_provider() -> String {
    "elevenlabs".into()
}

fn default_elevenlabs_key_env() -> Option<String> {
    Some("ELEVENLABS_API_KEY".into())
}

fn default_voice_id_env() -> Option<String> {
    Some("ELEVENLABS_VOICE_ID".into())
}

fn default_synthesis_model() -> String {
    "eleven_multilingual_v2".into()
}

fn default_elevenlabs_url() -> String {
    "wss://api.elevenlabs.io/v1/text-to-speech/{voice_id}/stream-input".into()
}

fn default_streaming_latency() -> Option<u8> {
    Some(3)
}

fn default_stability() -> f32 {
    0.5
}

fn default_similarity_boost() -> f32 {
    0.75
}

fn default_drain_timeout_ms() -> u64 {
    15_000
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesis_provider(),
            api_key: None,
            api_key_env: default_elevenlabs_key_env(),
            voice_id: None,
            voice_id_env: default_voice_id_env(),
            model_id: default_synthesis_model(),
            url: default_elevenlabs_url(),
            optimize_streaming_latency: default_streaming_latency(),
            output_format: None,
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            open_timeout_ms: default_open_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl SynthesisConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn resolve_voice_id(&self) -> Option<String> {
        resolve_secret_field(&self.voice_id, &self.voice_id_env)
    }
}

/// Per-session pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Max synthesized frames buffered toward the client (oldest dropped first).
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,

    /// Capacity of each upstream-to-orchestrator event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_client_queue_capacity() -> usize {
    512
}

fn default_event_buffer() -> usize {
    64
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: default_client_queue_capacity(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::ParleyError::Io)?;
        let config = Self::parse(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse config text (JSON5) after env substitution.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::ParleyError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json5")
    }

    pub fn gateway(&self) -> GatewayConfig {
        self.gateway.clone().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn recognition(&self) -> RecognitionConfig {
        self.recognition.clone().unwrap_or_default()
    }

    pub fn generation(&self) -> GenerationConfig {
        self.generation.clone().unwrap_or_default()
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        self.synthesis.clone().unwrap_or_default()
    }

    pub fn pipeline(&self) -> PipelineConfig {
        self.pipeline.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let recognition = self.recognition();
        let generation = self.generation();
        let synthesis = self.synthesis();
        let pipeline = self.pipeline();

        if recognition.provider != "deepgram" {
            errors.push(format!(
                "Unsupported recognition provider '{}'",
                recognition.provider
            ));
        }
        if generation.provider != "openai" {
            errors.push(format!(
                "Unsupported generation provider '{}'",
                generation.provider
            ));
        }
        if synthesis.provider != "elevenlabs" {
            errors.push(format!(
                "Unsupported synthesis provider '{}'",
                synthesis.provider
            ));
        }

        if recognition.resolve_api_key().is_none() {
            errors.push("Recognition API key is required (set api_key or api_key_env)".to_string());
        }
        if generation.resolve_api_key().is_none() {
            errors.push("Generation API key is required (set api_key or api_key_env)".to_string());
        }
        if synthesis.resolve_api_key().is_none() {
            errors.push("Synthesis API key is required (set api_key or api_key_env)".to_string());
        }

        if synthesis.resolve_voice_id().is_none() {
            errors.push("Synthesis voice_id is required (set voice_id or voice_id_env)".to_string());
        }
        if !synthesis.url.contains("{voice_id}") {
            warnings.push("Synthesis url has no {voice_id} placeholder".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if !gw.path.starts_with('/') {
                errors.push(format!("Gateway path must start with '/': {}", gw.path));
            }
        }

        if recognition.queue_capacity == 0
            || synthesis.queue_capacity == 0
            || pipeline.client_queue_capacity == 0
            || pipeline.event_buffer == 0
        {
            errors.push("Queue capacities must be greater than 0".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
