use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::metrics::Metrics;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DeviceLabels {
    device: String,
    name: String,
}

/// Prometheus view of a `MetricsCollector` snapshot.
pub struct PrometheusMetrics {
    registry: Registry,

    // Counters
    accepted: Counter,
    rejected: Counter,
    stale: Counter,
    failed: Counter,
    hashes: Counter,
    gpu_errors: Counter,
    network_errors: Counter,
    protocol_errors: Counter,
    compile_errors: Counter,
    reconnects: Counter,

    // Gauges
    uptime_seconds: Gauge,
    connected: Gauge,
    consecutive_rejects: Gauge,
    hashrate: Gauge<f64, AtomicU64>,
    device_hashrate: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("progminer");

        let accepted = Counter::default();
        let rejected = Counter::default();
        let stale = Counter::default();
        let failed = Counter::default();
        let hashes = Counter::default();
        let gpu_errors = Counter::default();
        let network_errors = Counter::default();
        let protocol_errors = Counter::default();
        let compile_errors = Counter::default();
        let reconnects = Counter::default();

        let uptime_seconds = Gauge::default();
        let connected = Gauge::default();
        let consecutive_rejects = Gauge::default();
        let hashrate = Gauge::<f64, AtomicU64>::default();
        let device_hashrate = Family::<DeviceLabels, Gauge<f64, AtomicU64>>::default();

        registry.register("solutions_accepted", "Solutions accepted by the pool", accepted.clone());
        registry.register("solutions_rejected", "Solutions rejected by the pool", rejected.clone());
        registry.register("solutions_stale", "Verdicts on solutions for superseded jobs", stale.clone());
        registry.register("solutions_failed", "Device results that failed host verification", failed.clone());
        registry.register("hashes", "Nonces searched across all devices", hashes.clone());
        registry.register("gpu_errors", "Device runtime and memory errors", gpu_errors.clone());
        registry.register("network_errors", "Pool transport failures", network_errors.clone());
        registry.register("protocol_errors", "Pool protocol failures", protocol_errors.clone());
        registry.register("compile_errors", "Search kernel compilation failures", compile_errors.clone());
        registry.register("pool_connects", "Pool connections established", reconnects.clone());
        registry.register("uptime_seconds", "Miner uptime in seconds", uptime_seconds.clone());
        registry.register("pool_connected", "1 while a pool session is up", connected.clone());
        registry.register("consecutive_rejects", "Rejected solutions since the last accept", consecutive_rejects.clone());
        registry.register("hashrate", "Combined hashrate in hashes per second", hashrate.clone());
        registry.register("device_hashrate", "Per device hashrate in hashes per second", device_hashrate.clone());

        Self {
            registry,
            accepted,
            rejected,
            stale,
            failed,
            hashes,
            gpu_errors,
            network_errors,
            protocol_errors,
            compile_errors,
            reconnects,
            uptime_seconds,
            connected,
            consecutive_rejects,
            hashrate,
            device_hashrate,
        }
    }

    /// Bring every series up to date with a snapshot. Counters only advance.
    pub fn update_from_metrics(&self, metrics: &Metrics) {
        advance(&self.accepted, metrics.accepted);
        advance(&self.rejected, metrics.rejected);
        advance(&self.stale, metrics.stale);
        advance(&self.failed, metrics.failed);
        advance(&self.hashes, metrics.total_hashes);
        advance(&self.gpu_errors, metrics.gpu_errors);
        advance(&self.network_errors, metrics.network_errors);
        advance(&self.protocol_errors, metrics.protocol_errors);
        advance(&self.compile_errors, metrics.compile_errors);
        advance(&self.reconnects, metrics.reconnects);

        self.uptime_seconds.set(metrics.uptime_seconds as i64);
        self.connected.set(metrics.connected as i64);
        self.consecutive_rejects.set(metrics.consecutive_rejects as i64);
        self.hashrate.set(metrics.hashrate);
        for device in &metrics.devices {
            let labels = DeviceLabels { device: device.ordinal.to_string(), name: device.name.clone() };
            self.device_hashrate.get_or_create(&labels).set(device.hashrate);
        }
    }

    pub fn export_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

fn advance(counter: &Counter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;

    #[test]
    fn snapshot_updates_are_idempotent() {
        let collector = MetricsCollector::new();
        collector.register_device(0, "host-0");
        collector.record_accepted(Some(0), false);
        collector.record_accepted(Some(0), true);
        collector.add_hashes(0, 4096);

        let prom = PrometheusMetrics::new();
        let snapshot = collector.get_metrics();
        prom.update_from_metrics(&snapshot);
        prom.update_from_metrics(&snapshot);

        let text = prom.export_metrics().unwrap();
        assert!(text.contains("progminer_solutions_accepted_total 2"));
        assert!(text.contains("progminer_solutions_stale_total 1"));
        assert!(text.contains("progminer_hashes_total 4096"));
        assert!(text.contains("progminer_device_hashrate{device=\"0\",name=\"host-0\"}"));
        assert!(text.ends_with("# EOF\n"));
    }
}
