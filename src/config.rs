use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dag::DagLoadMode;
use crate::device::Backend;
use crate::error_handling::RetryConfig;
use crate::miner::EngineSettings;
use crate::pool::PoolEndpoint;
use crate::pool::session::SessionSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    // Pool connection
    pub pool_url: String,
    pub pool_allow_self_signed: bool,
    pub pool_email: Option<String>,
    pub work_timeout_secs: u64,
    pub submit_hashrate: bool,
    pub hashrate_interval_secs: u64,

    // Devices
    pub backend: Backend,
    /// Ordinals to mine on; empty means all.
    pub devices: Vec<usize>,
    pub cpu_memory_mb: u64,

    // Search tuning
    pub grid_size: u32,
    pub block_size: u32,
    pub streams: usize,
    pub no_eval: bool,

    // Dataset loading
    pub dag_load_mode: DagLoadMode,
    /// Device that builds the dataset in single mode.
    pub dag_builder: usize,
    pub dag_turn_timeout_secs: u64,

    // Admin API
    pub api_bind: String,
    /// 0 disables the API.
    pub api_port: u16,
    pub api_readonly: bool,

    // Monitoring and logging
    pub log_level: String,
    pub metrics_enabled: bool,

    // Error handling and recovery
    pub exit_on_error: bool,
    /// 0 retries forever.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            pool_url: String::new(),
            pool_allow_self_signed: false,
            pool_email: None,
            work_timeout_secs: 180,
            submit_hashrate: true,
            hashrate_interval_secs: 60,

            backend: Backend::Cpu,
            devices: Vec::new(),
            cpu_memory_mb: 4096,

            grid_size: 1024,
            block_size: 512,
            streams: 2,
            no_eval: false,

            dag_load_mode: DagLoadMode::Parallel,
            dag_builder: 0,
            dag_turn_timeout_secs: 600,

            api_bind: "127.0.0.1".to_string(),
            api_port: 3333,
            api_readonly: false,

            log_level: "info".to_string(),
            metrics_enabled: true,

            exit_on_error: false,
            max_retries: 0,
            retry_delay_ms: 1000,
        }
    }
}

fn flag(val: &str) -> bool {
    matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parsed<T: FromStr>(name: &str, val: String) -> Result<T, ConfigError> {
    val.parse().map_err(|_| ConfigError::InvalidEnvVar(name.to_string(), val))
}

impl MinerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = MinerConfig::default();

        // Required configuration
        config.pool_url = lookup("MINER_POOL_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MINER_POOL_URL".to_string()))?;

        // Pool
        if let Some(val) = lookup("MINER_POOL_ALLOW_SELF_SIGNED") {
            config.pool_allow_self_signed = flag(&val);
        }
        if let Some(val) = lookup("MINER_POOL_EMAIL") {
            config.pool_email = Some(val).filter(|v| !v.is_empty());
        }
        if let Some(val) = lookup("MINER_WORK_TIMEOUT_SECS") {
            config.work_timeout_secs = parsed("MINER_WORK_TIMEOUT_SECS", val)?;
        }
        if let Some(val) = lookup("MINER_SUBMIT_HASHRATE") {
            config.submit_hashrate = flag(&val);
        }
        if let Some(val) = lookup("MINER_HASHRATE_INTERVAL_SECS") {
            config.hashrate_interval_secs = parsed("MINER_HASHRATE_INTERVAL_SECS", val)?;
        }

        // Devices
        if let Some(val) = lookup("MINER_BACKEND") {
            config.backend = parsed("MINER_BACKEND", val)?;
        }
        if let Some(val) = lookup("MINER_DEVICES") {
            config.devices = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parsed("MINER_DEVICES", s.to_string()))
                .collect::<Result<_, _>>()?;
        }
        if let Some(val) = lookup("MINER_CPU_MEMORY_MB") {
            config.cpu_memory_mb = parsed("MINER_CPU_MEMORY_MB", val)?;
        }

        // Search tuning
        if let Some(val) = lookup("MINER_GRID_SIZE") {
            config.grid_size = parsed("MINER_GRID_SIZE", val)?;
        }
        if let Some(val) = lookup("MINER_BLOCK_SIZE") {
            config.block_size = parsed("MINER_BLOCK_SIZE", val)?;
        }
        if let Some(val) = lookup("MINER_STREAMS") {
            config.streams = parsed("MINER_STREAMS", val)?;
        }
        if let Some(val) = lookup("MINER_NO_EVAL") {
            config.no_eval = flag(&val);
        }

        // Dataset loading
        if let Some(val) = lookup("MINER_DAG_LOAD_MODE") {
            config.dag_load_mode = parsed("MINER_DAG_LOAD_MODE", val)?;
        }
        if let Some(val) = lookup("MINER_DAG_BUILDER") {
            config.dag_builder = parsed("MINER_DAG_BUILDER", val)?;
        }
        if let Some(val) = lookup("MINER_DAG_TURN_TIMEOUT_SECS") {
            config.dag_turn_timeout_secs = parsed("MINER_DAG_TURN_TIMEOUT_SECS", val)?;
        }

        // Admin API
        if let Some(val) = lookup("MINER_API_BIND") {
            config.api_bind = val;
        }
        if let Some(val) = lookup("MINER_API_PORT") {
            config.api_port = parsed("MINER_API_PORT", val)?;
        }
        if let Some(val) = lookup("MINER_API_READONLY") {
            config.api_readonly = flag(&val);
        }

        // Logging
        if let Some(val) = lookup("MINER_LOG_LEVEL") {
            config.log_level = val;
        }
        if let Some(val) = lookup("MINER_METRICS_ENABLED") {
            config.metrics_enabled = flag(&val);
        }

        // Error handling
        if let Some(val) = lookup("MINER_EXIT_ON_ERROR") {
            config.exit_on_error = flag(&val);
        }
        if let Some(val) = lookup("MINER_MAX_RETRIES") {
            config.max_retries = parsed("MINER_MAX_RETRIES", val)?;
        }
        if let Some(val) = lookup("MINER_RETRY_DELAY_MS") {
            config.retry_delay_ms = parsed("MINER_RETRY_DELAY_MS", val)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        PoolEndpoint::parse(&self.pool_url)
            .map_err(|e| ConfigError::ValidationError(format!("MINER_POOL_URL: {e}")))?;

        if self.grid_size == 0 || self.block_size == 0 {
            return Err(ConfigError::ValidationError(
                "MINER_GRID_SIZE and MINER_BLOCK_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.streams == 0 {
            return Err(ConfigError::ValidationError("MINER_STREAMS must be greater than 0".to_string()));
        }

        if self.work_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "MINER_WORK_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.hashrate_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "MINER_HASHRATE_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.dag_load_mode == DagLoadMode::Single
            && !self.devices.is_empty()
            && !self.devices.contains(&self.dag_builder)
        {
            return Err(ConfigError::ValidationError(format!(
                "MINER_DAG_BUILDER {} is not among MINER_DEVICES",
                self.dag_builder
            )));
        }

        Ok(())
    }

    pub fn endpoint(&self) -> Result<PoolEndpoint, ConfigError> {
        PoolEndpoint::parse(&self.pool_url)
            .map(|e| e.with_self_signed(self.pool_allow_self_signed))
            .map_err(|e| ConfigError::ValidationError(format!("MINER_POOL_URL: {e}")))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            work_timeout: Duration::from_secs(self.work_timeout_secs),
            submit_hashrate: self.submit_hashrate,
            email: self.pool_email.clone(),
            ..Default::default()
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            grid: self.grid_size,
            block: self.block_size,
            streams: self.streams,
            no_eval: self.no_eval,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            retry_delay: self.get_retry_delay(),
            ..Default::default()
        }
    }

    pub fn get_retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn get_hashrate_interval(&self) -> Duration {
        Duration::from_secs(self.hashrate_interval_secs)
    }

    pub fn get_dag_turn_timeout(&self) -> Option<Duration> {
        match self.dag_turn_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn cpu_memory_bytes(&self) -> u64 {
        self.cpu_memory_mb.saturating_mul(1 << 20)
    }
}
