//! Current work distribution and solution collection across engines.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dag::DagCoordinator;
use crate::device::ComputeDevice;
use crate::epoch::EpochCache;
use crate::error_handling::{DeviceError, FatalPolicy};
use crate::metrics::MetricsCollector;
use crate::miner::{EngineSettings, MAX_MINERS, SearchEngine};
use crate::types::{Solution, WorkPackage};

/// What a search engine sees of the farm.
pub trait FarmFace: Send + Sync {
    fn work(&self) -> Arc<WorkPackage>;

    /// Generation of the most recently published work.
    fn generation(&self) -> u64;

    fn submit_proof(&self, solution: Solution);

    fn failed_solution(&self, ordinal: usize);

    fn add_hash_count(&self, ordinal: usize, hashes: u64);
}

/// Flags shared between the farm and one engine thread.
#[derive(Debug, Default)]
pub struct MinerSignals {
    pub new_work: AtomicBool,
    pub stop: AtomicBool,
    pub restart: AtomicBool,
}

struct MinerHandle {
    ordinal: usize,
    signals: Arc<MinerSignals>,
    thread: Option<JoinHandle<()>>,
}

pub struct Farm {
    work: RwLock<Arc<WorkPackage>>,
    generation: AtomicU64,
    miners: Mutex<Vec<MinerHandle>>,
    solutions: mpsc::UnboundedSender<Solution>,
    metrics: Arc<MetricsCollector>,
    policy: FatalPolicy,
}

impl Farm {
    pub fn new(
        metrics: Arc<MetricsCollector>,
        policy: FatalPolicy,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Solution>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let farm = Arc::new(Self {
            work: RwLock::new(Arc::new(WorkPackage::default())),
            generation: AtomicU64::new(0),
            miners: Mutex::new(Vec::new()),
            solutions: tx,
            metrics,
            policy,
        });
        (farm, rx)
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Publish new work and kick every engine.
    pub fn set_work(&self, mut work: WorkPackage) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        work.generation = generation;
        match self.work.write() {
            Ok(mut current) => *current = Arc::new(work),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(work),
        }
        self.kick();
    }

    /// Engines idle until the next `set_work`.
    pub fn clear_work(&self) {
        self.set_work(WorkPackage::default());
    }

    fn kick(&self) {
        if let Ok(miners) = self.miners.lock() {
            for m in miners.iter() {
                m.signals.new_work.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Spawn one engine thread per device.
    pub fn start(
        self: &Arc<Self>,
        devices: Vec<Box<dyn ComputeDevice>>,
        settings: EngineSettings,
        coordinator: Arc<DagCoordinator>,
        epochs: Arc<dyn EpochCache>,
    ) -> Result<(), DeviceError> {
        if devices.len() > MAX_MINERS {
            return Err(DeviceError::TooManyDevices { count: devices.len(), max: MAX_MINERS });
        }
        let mut miners = self
            .miners
            .lock()
            .map_err(|_| DeviceError::runtime(0, "start", "miner list poisoned"))?;
        for (index, device) in devices.into_iter().enumerate() {
            let ordinal = device.info().ordinal;
            self.metrics.register_device(ordinal, &device.info().name);
            let signals = Arc::new(MinerSignals::default());
            let engine = SearchEngine::new(
                index,
                device,
                self.clone(),
                signals.clone(),
                settings.clone(),
                coordinator.clone(),
                epochs.clone(),
                self.policy.clone(),
                self.metrics.clone(),
            );
            let thread = std::thread::Builder::new()
                .name(format!("miner-{ordinal}"))
                .spawn(move || engine.run())
                .map_err(|e| DeviceError::runtime(ordinal, "spawn engine", e))?;
            miners.push(MinerHandle { ordinal, signals, thread: Some(thread) });
        }
        info!(engines = miners.len(), "farm started");
        Ok(())
    }

    /// Stop every engine and wait for the threads to exit.
    pub fn stop(&self) {
        let handles: Vec<_> = match self.miners.lock() {
            Ok(mut miners) => miners
                .iter_mut()
                .map(|m| {
                    m.signals.stop.store(true, Ordering::SeqCst);
                    m.signals.new_work.store(true, Ordering::SeqCst);
                    (m.ordinal, m.thread.take())
                })
                .collect(),
            Err(_) => return,
        };
        for (ordinal, thread) in handles {
            if let Some(t) = thread {
                if t.join().is_err() {
                    warn!(ordinal, "engine thread panicked");
                }
            }
        }
        if let Ok(mut miners) = self.miners.lock() {
            miners.clear();
        }
        info!("farm stopped");
    }

    /// Rebuild datasets and kernels on every engine.
    pub fn restart(&self) {
        if let Ok(miners) = self.miners.lock() {
            for m in miners.iter() {
                m.signals.restart.store(true, Ordering::SeqCst);
                m.signals.new_work.store(true, Ordering::SeqCst);
            }
        }
        info!("farm restart requested");
    }

    pub fn is_mining(&self) -> bool {
        self.miners.lock().map(|m| !m.is_empty()).unwrap_or(false)
    }

    pub fn engine_count(&self) -> usize {
        self.miners.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn hashrate(&self) -> f64 {
        self.metrics.hashrate()
    }
}

impl FarmFace for Farm {
    fn work(&self) -> Arc<WorkPackage> {
        match self.work.read() {
            Ok(w) => w.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn submit_proof(&self, solution: Solution) {
        if self.solutions.send(solution).is_err() {
            warn!("solution dropped, no pool session is listening");
        }
    }

    fn failed_solution(&self, ordinal: usize) {
        self.metrics.record_failed(ordinal);
    }

    fn add_hash_count(&self, ordinal: usize, hashes: u64) {
        self.metrics.add_hashes(ordinal, hashes);
    }
}
