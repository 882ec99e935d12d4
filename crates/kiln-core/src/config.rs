use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use once_cell::sync::OnceCell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::util::{env_bool, env_string};
use crate::Backoff;

pub const CONFIG_FILE_NAME: &str = "kiln.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration in {path}: {errors}")]
    Invalid { path: PathBuf, errors: String },
    #[error("environment override {key}={value} is not valid")]
    Env { key: &'static str, value: String },
    #[error("config schema unavailable: {0}")]
    Schema(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct IpcConfig {
    /// Loopback host the backend listens on.
    pub host: String,
    pub port: u16,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 47321,
        }
    }
}

impl IpcConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct BackendConfig {
    /// Explicit path to the backend executable.
    pub binary: Option<String>,
    /// Directory for the instance lock and downloaded artifacts.
    pub state_dir: Option<String>,
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_cap_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            binary: None,
            state_dir: None,
            connect_attempts: 8,
            backoff_base_ms: 200,
            backoff_factor: 1.6,
            backoff_cap_ms: 5_000,
        }
    }
}

impl BackendConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_factor,
            Duration::from_millis(self.backoff_cap_ms),
            self.connect_attempts.max(1),
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the generation service HTTP API.
    pub base_url: String,
    /// Command (program followed by arguments) that starts the service.
    pub launch_command: Option<Vec<String>>,
    pub startup_timeout_secs: u64,
    pub probe_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Model checkpoint loaded by the generated workflow.
    pub checkpoint: String,
    pub sampler: String,
    pub scheduler: String,
    pub cfg_scale: f64,
    /// Subscribe to the service's websocket for live step progress.
    pub push: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".into(),
            launch_command: None,
            startup_timeout_secs: 90,
            probe_timeout_ms: 1_500,
            request_timeout_ms: 30_000,
            checkpoint: "sd_xl_base_1.0.safetensors".into(),
            sampler: "euler".into(),
            scheduler: "normal".into(),
            cfg_scale: 7.0,
            push: true,
        }
    }
}

/// Which bridge transport to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Derived from the security context.
    #[default]
    Auto,
    /// Plain loopback websocket.
    Local,
    /// Encrypted peer websocket.
    Peer,
}

impl std::str::FromStr for TransportPreference {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "local" => Ok(Self::Local),
            "peer" => Ok(Self::Peer),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub transport: TransportPreference,
    /// Whether the bridge runs inside a secure context.
    pub secure: bool,
    pub local_url: String,
    pub peer_url: Option<String>,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub reconnect_attempts: u32,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Scene group that completed jobs are filed under.
    pub scene_group: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportPreference::Auto,
            secure: false,
            local_url: "ws://127.0.0.1:4455".into(),
            peer_url: None,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            reconnect_attempts: 10,
            probe_interval_secs: 15,
            probe_timeout_secs: 10,
            request_timeout_secs: 10,
            scene_group: "Kiln".into(),
        }
    }
}

impl BridgeConfig {
    pub fn reconnect(&self) -> Backoff {
        Backoff::doubling(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_cap_ms),
            self.reconnect_attempts.max(1),
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct JobsConfig {
    pub max_jobs: usize,
    /// Seconds a terminal job stays queryable before it expires.
    pub retention_secs: u64,
    /// Seconds after creation at which an unfinished job is given up on.
    pub stale_after_secs: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub default_steps: u32,
    /// Calibrated wall time of one sampling step, used for estimates.
    pub per_step_estimate_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_jobs: 256,
            retention_secs: 3_600,
            stale_after_secs: 7_200,
            poll_interval_ms: 1_000,
            max_attempts: 3,
            default_steps: 20,
            per_step_estimate_ms: 450,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub ipc: IpcConfig,
    pub backend: BackendConfig,
    pub service: ServiceConfig,
    pub bridge: BridgeConfig,
    pub jobs: JobsConfig,
}

impl Config {
    /// Submission retries share the supervisor's growth curve but use the
    /// job attempt budget.
    pub fn job_submit_backoff(&self) -> Backoff {
        self.backend
            .backoff()
            .with_max_attempts(self.jobs.max_attempts.max(1))
    }

    /// Apply `KILN_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(raw) = env_string("KILN_IPC_PORT") {
            self.ipc.port = raw.parse().map_err(|_| ConfigError::Env {
                key: "KILN_IPC_PORT",
                value: raw.clone(),
            })?;
        }
        if let Some(url) = env_string("KILN_SERVICE_URL") {
            self.service.base_url = url;
        }
        if let Some(raw) = env_string("KILN_BRIDGE_TRANSPORT") {
            self.bridge.transport = raw.parse().map_err(|_| ConfigError::Env {
                key: "KILN_BRIDGE_TRANSPORT",
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = env_string("KILN_BRIDGE_SECURE") {
            self.bridge.secure = env_bool("KILN_BRIDGE_SECURE").ok_or(ConfigError::Env {
                key: "KILN_BRIDGE_SECURE",
                value: raw,
            })?;
        }
        if let Some(bin) = env_string("KILN_BACKEND_BIN") {
            self.backend.binary = Some(bin);
        }
        Ok(())
    }

    /// Directory holding the instance lock and downloaded outputs.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = env_string("KILN_STATE_DIR") {
            return PathBuf::from(dir);
        }
        if let Some(dir) = self.backend.state_dir.as_deref() {
            return PathBuf::from(dir);
        }
        directories::ProjectDirs::from("dev", "kiln", "kiln")
            .map(|p| p.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".kiln"))
    }
}

static CONFIG_SCHEMA: OnceCell<Validator> = OnceCell::new();

fn schema_validator() -> Result<&'static Validator, ConfigError> {
    CONFIG_SCHEMA.get_or_try_init(|| {
        let schema = config_schema_json()?;
        validator_for(&schema).map_err(|e| ConfigError::Schema(e.to_string()))
    })
}

/// Returns the JSON schema describing the configuration structure.
pub fn config_schema_json() -> Result<serde_json::Value, ConfigError> {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).map_err(|e| ConfigError::Schema(e.to_string()))
}

pub fn write_schema_file(path: &Path) -> Result<(), ConfigError> {
    let schema_json = config_schema_json()?;
    let text =
        serde_json::to_string_pretty(&schema_json).map_err(|e| ConfigError::Schema(e.to_string()))?;
    std::fs::write(path, text).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and validate a config file. Environment overrides are not applied.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: toml::Table = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let json_value =
        serde_json::to_value(&raw).map_err(|e| ConfigError::Schema(e.to_string()))?;
    let validation_errors: Vec<_> = schema_validator()?
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            errors: validation_errors.join(", "),
        });
    }
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `KILN_CONFIG`, else the first `kiln.toml` / `configs/kiln.toml` found
/// walking up from the working directory, else next to the executable.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Some(explicit) = env_string("KILN_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    let mut roots: Vec<PathBuf> = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.extend(cwd.ancestors().map(Path::to_path_buf));
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        roots.push(exe_dir);
    }
    roots.into_iter().find_map(|root| {
        [
            root.join(CONFIG_FILE_NAME),
            root.join("configs").join(CONFIG_FILE_NAME),
        ]
        .into_iter()
        .find(|p| p.is_file())
    })
}

/// Discovered file (or defaults) with environment overrides applied.
pub fn load_effective_config() -> Result<Config, ConfigError> {
    let mut cfg = match resolve_config_path() {
        Some(path) => {
            tracing::debug!(target: "kiln::config", path = %path.display(), "loading config");
            load_config(&path)?
        }
        None => Config::default(),
    };
    cfg.apply_env_overrides()?;
    Ok(cfg)
}
