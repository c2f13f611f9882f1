use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MinerConfig;
use crate::metrics::{DeviceMetrics, HealthStatus, MetricsCollector};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: String,
}

pub struct HealthChecker {
    metrics: Arc<MetricsCollector>,
    config: MinerConfig,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(metrics: Arc<MetricsCollector>, config: MinerConfig) -> Self {
        Self {
            metrics,
            config,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn get_health(&self) -> HealthResponse {
        let health_status = self.metrics.get_health_status();

        HealthResponse {
            status: health_status.to_string(),
            uptime_seconds: self.uptime_seconds(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.metrics.get_health_status(), HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Pool address without credentials.
    pub fn pool(&self) -> String {
        self.config
            .endpoint()
            .map(|e| e.address())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    pub fn get_detailed_status(&self) -> DetailedStatus {
        let metrics = self.metrics.get_metrics();
        let health_status = self.metrics.get_health_status();
        let verdicts = metrics.accepted + metrics.rejected;

        DetailedStatus {
            health: health_status.to_string(),
            uptime_seconds: metrics.uptime_seconds,
            connected: metrics.connected,
            reconnects: metrics.reconnects,
            hashrate: metrics.hashrate,
            accepted: metrics.accepted,
            rejected: metrics.rejected,
            stale: metrics.stale,
            failed: metrics.failed,
            acceptance_rate: if verdicts > 0 {
                metrics.accepted as f64 / verdicts as f64
            } else {
                0.0
            },
            last_accepted_seconds: metrics.last_accepted,
            devices: metrics.devices,
            error_counts: ErrorCounts {
                gpu_errors: metrics.gpu_errors,
                network_errors: metrics.network_errors,
                protocol_errors: metrics.protocol_errors,
                compile_errors: metrics.compile_errors,
            },
            config_summary: ConfigSummary {
                pool: self.pool(),
                backend: self.config.backend.to_string(),
                dag_load_mode: self.config.dag_load_mode.to_string(),
                grid_size: self.config.grid_size,
                block_size: self.config.block_size,
                streams: self.config.streams,
                max_retries: self.config.max_retries,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedStatus {
    pub health: String,
    pub uptime_seconds: u64,
    pub connected: bool,
    pub reconnects: u64,
    pub hashrate: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub failed: u64,
    pub acceptance_rate: f64,
    pub last_accepted_seconds: Option<u64>,
    pub devices: Vec<DeviceMetrics>,
    pub error_counts: ErrorCounts,
    pub config_summary: ConfigSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub gpu_errors: u64,
    pub network_errors: u64,
    pub protocol_errors: u64,
    pub compile_errors: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub pool: String,
    pub backend: String,
    pub dag_load_mode: String,
    pub grid_size: u32,
    pub block_size: u32,
    pub streams: usize,
    pub max_retries: u32,
}
