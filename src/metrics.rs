use std::sync::atomic::{AtomicU64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

/// Window over which hashrates are averaged.
const HASHRATE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub ordinal: usize,
    pub name: String,
    pub hashes: u64,
    pub hashrate: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    // Share accounting
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub failed: u64,

    // Hashing
    pub total_hashes: u64,
    pub hashrate: f64,
    pub devices: Vec<DeviceMetrics>,

    // Error metrics
    pub gpu_errors: u64,
    pub network_errors: u64,
    pub protocol_errors: u64,
    pub compile_errors: u64,

    // Health metrics
    pub uptime_seconds: u64,
    pub connected: bool,
    pub reconnects: u64,
    pub consecutive_rejects: u32,
    pub last_accepted: Option<u64>,
}

#[derive(Debug)]
struct DeviceCounters {
    name: String,
    hashes: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    sampler: Mutex<RateSampler>,
}

/// Rolling hash rate over `HASHRATE_WINDOW`.
#[derive(Debug)]
struct RateSampler {
    window_start: Instant,
    window_hashes: u64,
    rate: f64,
}

impl RateSampler {
    fn new() -> Self {
        Self { window_start: Instant::now(), window_hashes: 0, rate: 0.0 }
    }

    fn add(&mut self, hashes: u64) {
        self.window_hashes += hashes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= HASHRATE_WINDOW {
            self.rate = self.window_hashes as f64 / elapsed.as_secs_f64();
            self.window_hashes = 0;
            self.window_start = Instant::now();
        }
    }

    fn rate(&self) -> f64 {
        // Until the first window closes, report the running average.
        if self.rate == 0.0 {
            let secs = self.window_start.elapsed().as_secs_f64();
            if secs > 0.0 {
                return self.window_hashes as f64 / secs;
            }
        }
        self.rate
    }
}

#[derive(Debug)]
pub struct MetricsCollector {
    accepted: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
    gpu_errors: AtomicU64,
    network_errors: AtomicU64,
    protocol_errors: AtomicU64,
    compile_errors: AtomicU64,
    reconnects: AtomicU64,
    consecutive_rejects: AtomicU32,
    connected: AtomicU32,

    start_time: Instant,
    last_accepted: Mutex<Option<Instant>>,
    devices: Mutex<Vec<Arc<DeviceCounters>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            gpu_errors: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            compile_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            consecutive_rejects: AtomicU32::new(0),
            connected: AtomicU32::new(0),
            start_time: Instant::now(),
            last_accepted: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Registers a device slot; ordinals index into the device list.
    pub fn register_device(&self, ordinal: usize, name: &str) {
        if let Ok(mut devices) = self.devices.lock() {
            while devices.len() <= ordinal {
                devices.push(Arc::new(DeviceCounters {
                    name: String::new(),
                    hashes: AtomicU64::new(0),
                    accepted: AtomicU64::new(0),
                    rejected: AtomicU64::new(0),
                    failed: AtomicU64::new(0),
                    sampler: Mutex::new(RateSampler::new()),
                }));
            }
            devices[ordinal] = Arc::new(DeviceCounters {
                name: name.to_string(),
                hashes: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                sampler: Mutex::new(RateSampler::new()),
            });
        }
    }

    fn device(&self, ordinal: usize) -> Option<Arc<DeviceCounters>> {
        self.devices.lock().ok().and_then(|d| d.get(ordinal).cloned())
    }

    pub fn add_hashes(&self, ordinal: usize, hashes: u64) {
        if let Some(dev) = self.device(ordinal) {
            dev.hashes.fetch_add(hashes, Ordering::Relaxed);
            if let Ok(mut sampler) = dev.sampler.lock() {
                sampler.add(hashes);
            }
        }
    }

    pub fn record_accepted(&self, ordinal: Option<usize>, stale: bool) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        self.consecutive_rejects.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_accepted.lock() {
            *last = Some(Instant::now());
        }
        if let Some(dev) = ordinal.and_then(|o| self.device(o)) {
            dev.accepted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self, ordinal: Option<usize>, stale: bool) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        self.consecutive_rejects.fetch_add(1, Ordering::Relaxed);
        if let Some(dev) = ordinal.and_then(|o| self.device(o)) {
            dev.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A device result that did not verify on the host.
    pub fn record_failed(&self, ordinal: usize) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(dev) = self.device(ordinal) {
            dev.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, error_type: ErrorType) {
        match error_type {
            ErrorType::Gpu => self.gpu_errors.fetch_add(1, Ordering::Relaxed),
            ErrorType::Network => self.network_errors.fetch_add(1, Ordering::Relaxed),
            ErrorType::Protocol => self.protocol_errors.fetch_add(1, Ordering::Relaxed),
            ErrorType::Compile => self.compile_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected as u32, Ordering::Relaxed);
        if connected && was == 0 {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sum of per-device rates in hashes per second.
    pub fn hashrate(&self) -> f64 {
        self.device_rates().iter().sum()
    }

    pub fn device_rates(&self) -> Vec<f64> {
        let devices = match self.devices.lock() {
            Ok(d) => d.clone(),
            Err(_) => return Vec::new(),
        };
        devices
            .iter()
            .map(|d| d.sampler.lock().map(|s| s.rate()).unwrap_or(0.0))
            .collect()
    }

    pub fn get_metrics(&self) -> Metrics {
        let devices: Vec<DeviceMetrics> = match self.devices.lock() {
            Ok(d) => d
                .iter()
                .enumerate()
                .map(|(ordinal, dev)| DeviceMetrics {
                    ordinal,
                    name: dev.name.clone(),
                    hashes: dev.hashes.load(Ordering::Relaxed),
                    hashrate: dev.sampler.lock().map(|s| s.rate()).unwrap_or(0.0),
                    accepted: dev.accepted.load(Ordering::Relaxed),
                    rejected: dev.rejected.load(Ordering::Relaxed),
                    failed: dev.failed.load(Ordering::Relaxed),
                })
                .collect(),
            Err(_) => Vec::new(),
        };

        let last_accepted = match self.last_accepted.lock() {
            Ok(last) => last.map(|t| t.duration_since(self.start_time).as_secs()),
            Err(_) => None,
        };

        Metrics {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            total_hashes: devices.iter().map(|d| d.hashes).sum(),
            hashrate: devices.iter().map(|d| d.hashrate).sum(),
            devices,
            gpu_errors: self.gpu_errors.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            compile_errors: self.compile_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connected: self.connected.load(Ordering::Relaxed) != 0,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            consecutive_rejects: self.consecutive_rejects.load(Ordering::Relaxed),
            last_accepted,
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let m = self.get_metrics();
        if m.consecutive_rejects >= 10 || (m.gpu_errors > 0 && m.hashrate == 0.0) {
            HealthStatus::Critical
        } else if !m.connected {
            HealthStatus::Unhealthy
        } else if m.consecutive_rejects >= 3 || m.failed > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Gpu,
    Network,
    Protocol,
    Compile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_counters_track_stale_flag() {
        let m = MetricsCollector::new();
        m.register_device(0, "dev0");
        m.record_accepted(Some(0), false);
        m.record_accepted(Some(0), true);
        m.record_rejected(None, true);
        let s = m.get_metrics();
        assert_eq!((s.accepted, s.rejected, s.stale), (2, 1, 2));
        assert_eq!(s.devices[0].accepted, 2);
        assert_eq!(s.consecutive_rejects, 1);
    }

    #[test]
    fn hashes_are_summed_per_device() {
        let m = MetricsCollector::new();
        m.register_device(1, "dev1");
        m.add_hashes(1, 500);
        m.add_hashes(1, 500);
        m.add_hashes(7, 1);
        let s = m.get_metrics();
        assert_eq!(s.devices.len(), 2);
        assert_eq!(s.total_hashes, 1000);
    }

    #[test]
    fn reconnects_count_rising_edges() {
        let m = MetricsCollector::new();
        assert_eq!(m.get_health_status(), HealthStatus::Unhealthy);
        m.set_connected(true);
        m.set_connected(true);
        m.set_connected(false);
        m.set_connected(true);
        assert_eq!(m.get_metrics().reconnects, 2);
        assert_eq!(m.get_health_status(), HealthStatus::Healthy);
    }
}
