//! Shared configuration, retry policy and the job orchestrator.

mod backoff;
mod config;
pub mod orchestrator;
pub mod util;

pub use backoff::Backoff;
pub use config::{
    config_schema_json, load_config, load_effective_config, resolve_config_path,
    write_schema_file, BackendConfig, BridgeConfig, Config, ConfigError, IpcConfig, JobsConfig,
    ServiceConfig, TransportPreference,
};
