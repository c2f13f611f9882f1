use std::time::Duration;

use thiserror::Error;
use tracing::error;

use crate::metrics::{ErrorType, MetricsCollector};

/// Failures raised by a compute device or the dataset it depends on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device {device}: insufficient memory, need {required} bytes, have {available}")]
    InsufficientMemory { device: usize, required: u64, available: u64 },
    #[error("device {device}: {operation} failed: {message}")]
    Runtime { device: usize, operation: &'static str, message: String },
    #[error("device {device}: kernel compilation failed:\n{log}")]
    Compile { device: usize, log: String },
    #[error("epoch {epoch}: {message}")]
    EpochCache { epoch: u32, message: String },
    #[error("backend {backend} is not compiled into this build")]
    BackendUnavailable { backend: String },
    #[error("no compute devices found")]
    NoDevices,
    #[error("{count} devices selected, at most {max} can share the nonce space")]
    TooManyDevices { count: usize, max: usize },
}

impl DeviceError {
    pub fn runtime(device: usize, operation: &'static str, message: impl ToString) -> Self {
        DeviceError::Runtime { device, operation, message: message.to_string() }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            DeviceError::Compile { .. } => ErrorType::Compile,
            _ => ErrorType::Gpu,
        }
    }
}

/// Failures that end a pool session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("could not resolve {host}: {message}")]
    Resolve { host: String, message: String },
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: std::io::Error },
    #[error("TLS handshake with {host} failed: {message}")]
    Tls { host: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response from pool within {0:?}")]
    ResponseTimeout(Duration),
    #[error("no new work received in {0:?}")]
    WorkTimeout(Duration),
    #[error("worker not authorized: {0}")]
    Unauthorized(String),
    #[error("connection closed by pool")]
    Closed,
}

impl SessionError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            SessionError::Unauthorized(_) => ErrorType::Protocol,
            _ => ErrorType::Network,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff before reconnect attempt `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(32) as i32);
        Duration::from_secs_f64(
            (self.retry_delay.as_secs_f64() * factor).min(self.max_retry_delay.as_secs_f64()),
        )
    }

    /// `max_retries == 0` retries forever.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries != 0 && attempt >= self.max_retries
    }
}

/// Decides what a fatal device error does to the process.
#[derive(Debug, Clone)]
pub struct FatalPolicy {
    pub exit_on_error: bool,
}

impl FatalPolicy {
    pub fn new(exit_on_error: bool) -> Self {
        Self { exit_on_error }
    }

    /// Records the error and exits the process when configured to.
    pub fn escalate(&self, err: &DeviceError, metrics: &MetricsCollector) {
        metrics.record_error(err.error_type());
        if self.exit_on_error {
            error!(%err, "terminating on device error");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let cfg = RetryConfig {
            max_retries: 0,
            retry_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(3),
        };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(500));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for(10), Duration::from_secs(3));
        assert!(!cfg.exhausted(1_000));
    }

    #[test]
    fn retry_limit_is_honored() {
        let cfg = RetryConfig { max_retries: 2, ..Default::default() };
        assert!(!cfg.exhausted(1));
        assert!(cfg.exhausted(2));
    }

    #[test]
    fn compile_log_is_kept_verbatim() {
        let err = DeviceError::Compile { device: 1, log: "line 3: oops".into() };
        assert!(err.to_string().ends_with("line 3: oops"));
        assert_eq!(err.error_type(), ErrorType::Compile);
    }

    #[test]
    fn non_exiting_policy_counts_error() {
        let metrics = MetricsCollector::new();
        FatalPolicy::new(false).escalate(&DeviceError::NoDevices, &metrics);
        assert_eq!(metrics.get_metrics().gpu_errors, 1);
    }
}
