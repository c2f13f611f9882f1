//! Per-device search loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, error, info, warn};

use crate::compiler::KernelCompiler;
use crate::dag::{DagCoordinator, DatasetManager};
use crate::device::{ComputeDevice, SearchHit, SearchParams};
use crate::epoch::EpochCache;
use crate::error_handling::{DeviceError, FatalPolicy};
use crate::farm::{FarmFace, MinerSignals};
use crate::metrics::MetricsCollector;
use crate::progpow::Verifier;
use crate::types::{Solution, WorkPackage};

/// Devices per pool connection addressable by nonce partitioning.
pub const LOG2_MAX_MINERS: u32 = 5;
pub const MAX_MINERS: usize = 1 << LOG2_MAX_MINERS;

const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub grid: u32,
    pub block: u32,
    pub streams: usize,
    /// Trust device results without re-hashing on the host.
    pub no_eval: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { grid: 1024, block: 512, streams: 2, no_eval: false }
    }
}

impl EngineSettings {
    pub fn batch(&self) -> u64 {
        self.grid as u64 * self.block as u64
    }
}

/// Start nonce for engine `index` when the pool fixed the top `ex_bits` bits.
pub fn partitioned_start_nonce(base: u64, index: usize, ex_bits: u32) -> u64 {
    match 64u32.checked_sub(LOG2_MAX_MINERS + ex_bits) {
        Some(shift) => base | (index as u64).checked_shl(shift).unwrap_or(0),
        None => base,
    }
}

struct InFlight {
    start_nonce: u64,
    work: Arc<WorkPackage>,
}

pub struct SearchEngine {
    index: usize,
    ordinal: usize,
    device: Box<dyn ComputeDevice>,
    farm: Arc<dyn FarmFace>,
    signals: Arc<MinerSignals>,
    settings: EngineSettings,
    datasets: DatasetManager,
    compiler: KernelCompiler,
    verifier: Verifier,
    epochs: Arc<dyn EpochCache>,
    policy: FatalPolicy,
    metrics: Arc<MetricsCollector>,
}

impl SearchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        device: Box<dyn ComputeDevice>,
        farm: Arc<dyn FarmFace>,
        signals: Arc<MinerSignals>,
        settings: EngineSettings,
        coordinator: Arc<DagCoordinator>,
        epochs: Arc<dyn EpochCache>,
        policy: FatalPolicy,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let ordinal = device.info().ordinal;
        let datasets = DatasetManager::new(
            ordinal,
            coordinator,
            epochs.clone(),
            settings.grid,
            settings.block,
            settings.streams,
        );
        Self {
            index,
            ordinal,
            device,
            farm,
            signals,
            settings,
            datasets,
            compiler: KernelCompiler::new(),
            verifier: Verifier::new(epochs.clone()),
            epochs,
            policy,
            metrics,
        }
    }

    /// Thread body. Returns when stopped or after a device failure.
    pub fn run(mut self) {
        info!(device = self.ordinal, name = %self.device.info().name, "engine started");
        match self.work_loop() {
            Ok(()) => info!(device = self.ordinal, "engine stopped"),
            Err(err) => {
                error!(device = self.ordinal, %err, "engine failed");
                if let Err(reset) = self.device.reset() {
                    warn!(device = self.ordinal, %reset, "device reset failed");
                }
                self.policy.escalate(&err, &self.metrics);
            }
        }
    }

    fn stopping(&self) -> bool {
        self.signals.stop.load(Ordering::SeqCst)
    }

    fn work_loop(&mut self) -> Result<(), DeviceError> {
        let signals = self.signals.clone();
        while !self.stopping() {
            if signals.restart.swap(false, Ordering::SeqCst) {
                info!(device = self.ordinal, "rebuilding dataset and kernel");
                self.datasets.invalidate();
                self.compiler.invalidate();
            }

            signals.new_work.store(false, Ordering::SeqCst);
            let work = self.farm.work();
            if !work.is_valid() {
                std::thread::sleep(IDLE_WAIT);
                continue;
            }

            if let Err(err) = self.prepare(&work, &signals.stop) {
                if self.stopping() {
                    return Ok(());
                }
                return Err(err);
            }
            self.search(work)?;
        }
        Ok(())
    }

    fn prepare(&mut self, work: &WorkPackage, stop: &AtomicBool) -> Result<(), DeviceError> {
        self.datasets.ensure_dataset(self.device.as_mut(), work.epoch, stop)?;
        let elements = self.epochs.dataset_elements(work.epoch);
        if self.compiler.ensure(self.device.as_mut(), work.height, elements)? {
            debug!(device = self.ordinal, height = work.height, "kernel rebuilt");
        }
        Ok(())
    }

    /// Runs batches on `work` until new work arrives or the engine stops,
    /// then drains every in-flight launch.
    fn search(&mut self, work: Arc<WorkPackage>) -> Result<(), DeviceError> {
        let target = work.boundary.upper_u64();
        let batch = self.settings.batch();
        let mut nonce = match work.ex_size_bits {
            Some(bits) => partitioned_start_nonce(work.start_nonce, self.index, bits),
            None => rand::thread_rng().next_u64(),
        };
        debug!(device = self.ordinal, start_nonce = format!("{nonce:#018x}"), "searching");

        let mut in_flight: Vec<Option<InFlight>> = (0..self.settings.streams).map(|_| None).collect();
        loop {
            let mut pending = false;
            for slot in 0..in_flight.len() {
                if let Some(prev) = in_flight[slot].take() {
                    let hits = self.device.collect(slot)?;
                    self.report(&prev, hits)?;
                    self.farm.add_hash_count(self.ordinal, batch);
                }

                if self.signals.new_work.load(Ordering::SeqCst) || self.stopping() {
                    continue;
                }
                let params = SearchParams { header: work.header, target, start_nonce: nonce };
                self.device.launch_search(slot, &params, self.settings.grid, self.settings.block)?;
                in_flight[slot] = Some(InFlight { start_nonce: nonce, work: work.clone() });
                nonce = nonce.wrapping_add(batch);
                pending = true;
            }
            if !pending && in_flight.iter().all(Option::is_none) {
                return Ok(());
            }
        }
    }

    fn report(&mut self, launch: &InFlight, hits: Vec<SearchHit>) -> Result<(), DeviceError> {
        for hit in hits {
            let nonce = launch.start_nonce.wrapping_add(hit.gid as u64);
            let mix_hash = if self.settings.no_eval {
                hit.mix
            } else {
                let r = self.verifier.eval(&launch.work, nonce)?;
                if r.value >= launch.work.boundary || r.mix != hit.mix {
                    warn!(device = self.ordinal, nonce = format!("{nonce:#018x}"), "device result failed verification");
                    self.farm.failed_solution(self.ordinal);
                    continue;
                }
                r.mix
            };
            let stale = self.signals.new_work.load(Ordering::SeqCst)
                || self.farm.generation() != launch.work.generation;
            info!(device = self.ordinal, nonce = format!("{nonce:#018x}"), stale, "solution found");
            self.farm.submit_proof(Solution {
                nonce,
                mix_hash,
                work: launch.work.clone(),
                stale,
                generation: launch.work.generation,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;
    use crate::dag::DagLoadMode;
    use crate::testing::{TinyEpochs, work};
    use crate::types::H256;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct RecordingFarm {
        work: Mutex<Arc<WorkPackage>>,
        generation: AtomicU64,
        proofs: Mutex<Vec<Solution>>,
        failed: AtomicU64,
        hashes: AtomicU64,
    }

    impl RecordingFarm {
        fn with_work(mut w: WorkPackage) -> Arc<Self> {
            w.generation = 1;
            let farm = RecordingFarm::default();
            *farm.work.lock().unwrap() = Arc::new(w);
            farm.generation.store(1, Ordering::SeqCst);
            Arc::new(farm)
        }
    }

    impl FarmFace for RecordingFarm {
        fn work(&self) -> Arc<WorkPackage> {
            self.work.lock().unwrap().clone()
        }
        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }
        fn submit_proof(&self, solution: Solution) {
            self.proofs.lock().unwrap().push(solution);
        }
        fn failed_solution(&self, _ordinal: usize) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        fn add_hash_count(&self, _ordinal: usize, hashes: u64) {
            self.hashes.fetch_add(hashes, Ordering::SeqCst);
        }
    }

    fn engine(farm: Arc<RecordingFarm>, device: CpuDevice, no_eval: bool) -> (SearchEngine, Arc<MinerSignals>) {
        let signals = Arc::new(MinerSignals::default());
        let coordinator = Arc::new(DagCoordinator::new(DagLoadMode::Parallel, 0, vec![0], None));
        let settings = EngineSettings { grid: 1, block: 8, streams: 2, no_eval };
        let engine = SearchEngine::new(
            0,
            Box::new(device),
            farm,
            signals.clone(),
            settings,
            coordinator,
            Arc::new(TinyEpochs::default()),
            FatalPolicy::new(false),
            Arc::new(MetricsCollector::new()),
        );
        (engine, signals)
    }

    fn easy_work() -> WorkPackage {
        let mut w = work(9, 0, 25);
        w.boundary = H256::MAX;
        w.start_nonce = 0x1234_0000_0000_0000;
        w.ex_size_bits = Some(16);
        w
    }

    #[test]
    fn start_nonces_are_disjoint_across_devices() {
        let base = 0xabcd_0000_0000_0000u64;
        let span = 1u64 << (64 - LOG2_MAX_MINERS - 16);
        let starts: Vec<u64> = (0..32).map(|i| partitioned_start_nonce(base, i, 16)).collect();
        for (i, a) in starts.iter().enumerate() {
            assert_eq!(a >> 48, 0xabcd);
            for b in &starts[i + 1..] {
                assert!(a.abs_diff(*b) >= span);
            }
        }
        assert_eq!(partitioned_start_nonce(base, 3, 16), partitioned_start_nonce(base, 3, 16));
        assert_eq!(partitioned_start_nonce(7, 1, 64), 7);
    }

    #[test]
    fn verified_hits_are_submitted_in_slot_order() {
        let farm = RecordingFarm::with_work(easy_work());
        let (mut engine, signals) = engine(farm.clone(), CpuDevice::new(0, 1 << 24), false);
        let w = farm.work();
        engine.prepare(&w, &signals.stop).unwrap();

        let batch_start = partitioned_start_nonce(w.start_nonce, 0, 16);
        let hits = vec![
            SearchHit { gid: 1, mix: H256::zero() },
            SearchHit { gid: 2, mix: H256::zero() },
        ];
        let launch = InFlight { start_nonce: batch_start, work: w.clone() };
        engine.settings.no_eval = true;
        engine.report(&launch, hits).unwrap();

        let proofs = farm.proofs.lock().unwrap();
        assert_eq!(proofs.iter().map(|p| p.nonce - batch_start).collect::<Vec<_>>(), vec![1, 2]);
        assert!(proofs.iter().all(|p| !p.stale && p.generation == 1));
    }

    #[test]
    fn search_runs_until_new_work_and_counts_hashes() {
        let farm = RecordingFarm::with_work(easy_work());
        let (mut engine, signals) = engine(farm.clone(), CpuDevice::new(0, 1 << 24), false);
        let w = farm.work();
        engine.prepare(&w, &signals.stop).unwrap();

        let kicker = {
            let signals = signals.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                signals.new_work.store(true, Ordering::SeqCst);
            })
        };
        engine.search(w.clone()).unwrap();
        kicker.join().unwrap();

        let hashes = farm.hashes.load(Ordering::SeqCst);
        assert!(hashes >= 16 && hashes % 8 == 0);
        let proofs = farm.proofs.lock().unwrap();
        assert!(!proofs.is_empty());
        assert_eq!(farm.failed.load(Ordering::SeqCst), 0);
        let start = partitioned_start_nonce(w.start_nonce, 0, 16);
        assert!(proofs.iter().all(|p| p.nonce >= start));
        // Results harvested after the kick are flagged stale.
        assert!(proofs.last().unwrap().stale);
    }

    #[test]
    fn bogus_device_results_become_failed_solutions() {
        let farm = RecordingFarm::with_work(easy_work());
        let mut dev = CpuDevice::new(0, 1 << 24);
        dev.faults.bogus_hits = true;
        let (mut engine, signals) = engine(farm.clone(), dev, false);
        let w = farm.work();
        engine.prepare(&w, &signals.stop).unwrap();
        signals.new_work.store(true, Ordering::SeqCst);
        // Nothing launches once new work is flagged; prime one slot by hand.
        engine
            .device
            .launch_search(0, &SearchParams { header: w.header, target: u64::MAX, start_nonce: 0 }, 1, 8)
            .unwrap();
        let hits = engine.device.collect(0).unwrap();
        engine.report(&InFlight { start_nonce: 0, work: w.clone() }, hits).unwrap();
        assert_eq!(farm.failed.load(Ordering::SeqCst), 1);
        assert!(farm.proofs.lock().unwrap().is_empty());
    }

    #[test]
    fn superseded_generation_marks_stale() {
        let farm = RecordingFarm::with_work(easy_work());
        let (mut engine, _signals) = engine(farm.clone(), CpuDevice::new(0, 1 << 24), true);
        let w = farm.work();
        farm.generation.store(2, Ordering::SeqCst);
        engine
            .report(&InFlight { start_nonce: 10, work: w }, vec![SearchHit { gid: 0, mix: H256::zero() }])
            .unwrap();
        let proofs = farm.proofs.lock().unwrap();
        assert!(proofs[0].stale);
        assert_eq!(proofs[0].generation, 1);
    }

    #[test]
    fn launch_failure_stops_engine_thread() {
        let farm = RecordingFarm::with_work(easy_work());
        let mut dev = CpuDevice::new(0, 1 << 24);
        dev.faults.launch_error = true;
        let stats = dev.stats();
        let (engine, _signals) = engine(farm.clone(), dev, false);
        let handle = std::thread::spawn(move || engine.run());
        handle.join().unwrap();
        // One reset while loading the dataset, one after the failure.
        assert_eq!(crate::cpu::CpuStats::get(&stats.resets), 2);
        assert!(farm.proofs.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_exits_the_loop() {
        let farm = RecordingFarm::with_work(easy_work());
        let (engine, signals) = engine(farm.clone(), CpuDevice::new(0, 1 << 24), false);
        let handle = std::thread::spawn(move || engine.run());
        for _ in 0..100 {
            if farm.hashes.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        signals.stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(farm.hashes.load(Ordering::SeqCst) > 0);
    }
}
