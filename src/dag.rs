//! Per-device dataset lifecycle.
//!
//! Devices either generate their own dataset or, in single mode, receive a
//! copy that one builder device generated and staged in host memory. In
//! sequential mode devices take turns in participant order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::ComputeDevice;
use crate::epoch::EpochCache;
use crate::error_handling::DeviceError;

const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DagLoadMode {
    Parallel,
    Sequential,
    Single,
}

impl FromStr for DagLoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "parallel" => Ok(DagLoadMode::Parallel),
            "1" | "sequential" => Ok(DagLoadMode::Sequential),
            "2" | "single" => Ok(DagLoadMode::Single),
            other => Err(format!("unknown dag load mode {other}")),
        }
    }
}

impl fmt::Display for DagLoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DagLoadMode::Parallel => write!(f, "parallel"),
            DagLoadMode::Sequential => write!(f, "sequential"),
            DagLoadMode::Single => write!(f, "single"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagRole {
    Independent,
    Builder,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetOutcome {
    AlreadyResident,
    Generated,
    CopiedFromHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MirrorStatus {
    Empty,
    Ready,
    Abandoned,
    Retired,
}

struct MirrorState {
    /// Bumped by every publish or abandon.
    round: u64,
    epoch: Option<u32>,
    data: Option<Arc<Vec<u32>>>,
    status: MirrorStatus,
    /// Last round each consumer consumed or declined.
    settled: HashMap<usize, u64>,
    /// Consumers that gave up before the next round was published.
    skip_next: HashSet<usize>,
    populations: u64,
    frees: u64,
}

impl MirrorState {
    fn settled(&self, ordinal: usize) -> u64 {
        self.settled.get(&ordinal).copied().unwrap_or(0)
    }

    fn settle(&mut self, ordinal: usize, consumers: usize) {
        self.settled.insert(ordinal, self.round);
        let done = self.settled.values().filter(|&&r| r == self.round).count();
        if self.status == MirrorStatus::Ready && done >= consumers {
            self.data = None;
            self.status = MirrorStatus::Retired;
            self.frees += 1;
            info!(epoch = self.epoch, round = self.round, "freed host dataset");
        }
    }

    fn next_round(&mut self, epoch: u32, status: MirrorStatus, consumers: usize) {
        self.round += 1;
        self.epoch = Some(epoch);
        self.status = status;
        for ordinal in std::mem::take(&mut self.skip_next) {
            self.settle(ordinal, consumers);
        }
    }
}

pub enum MirrorWait {
    Ready { round: u64, data: Arc<Vec<u32>> },
    Unavailable,
}

/// Host copy of the dataset, handed from the builder to every consumer once
/// per build round. Each consumer settles every round exactly once, by
/// consuming or declining it, and the copy is freed when the last one does.
pub struct HostMirror {
    consumers: usize,
    state: Mutex<MirrorState>,
    cv: Condvar,
}

impl HostMirror {
    pub fn new(consumers: usize) -> Self {
        Self {
            consumers,
            state: Mutex::new(MirrorState {
                round: 0,
                epoch: None,
                data: None,
                status: MirrorStatus::Empty,
                settled: HashMap::new(),
                skip_next: HashSet::new(),
                populations: 0,
                frees: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }

    /// Stage a new round and return its number.
    pub fn publish(&self, epoch: u32, data: Vec<u32>) -> u64 {
        let mut st = self.lock();
        st.data = Some(Arc::new(data));
        st.populations += 1;
        st.next_round(epoch, MirrorStatus::Ready, self.consumers);
        info!(epoch, round = st.round, consumers = self.consumers, "dataset staged in host memory");
        self.cv.notify_all();
        st.round
    }

    /// The builder failed; waiting consumers fall back to local generation.
    pub fn abandon(&self, epoch: u32) {
        let mut st = self.lock();
        st.data = None;
        st.next_round(epoch, MirrorStatus::Abandoned, self.consumers);
        warn!(epoch, round = st.round, "host dataset abandoned by builder");
        self.cv.notify_all();
    }

    /// Wait for a round `ordinal` has not settled yet. A round for another
    /// epoch or an abandoned round is declined and reported unavailable. On
    /// stop or timeout the next round is declined in advance.
    pub fn wait(&self, ordinal: usize, epoch: u32, stop: &AtomicBool, timeout: Option<Duration>) -> MirrorWait {
        let started = Instant::now();
        let mut st = self.lock();
        loop {
            if st.round > st.settled(ordinal) {
                match st.status {
                    MirrorStatus::Ready if st.epoch == Some(epoch) => {
                        if let Some(data) = &st.data {
                            return MirrorWait::Ready { round: st.round, data: data.clone() };
                        }
                    }
                    MirrorStatus::Ready | MirrorStatus::Abandoned => {
                        debug!(ordinal, epoch, staged = st.epoch, "declining host dataset round");
                        st.settle(ordinal, self.consumers);
                        return MirrorWait::Unavailable;
                    }
                    MirrorStatus::Empty | MirrorStatus::Retired => {}
                }
            }
            if stop.load(Ordering::Relaxed) {
                st.skip_next.insert(ordinal);
                return MirrorWait::Unavailable;
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                warn!(ordinal, epoch, "timed out waiting for host dataset");
                st.skip_next.insert(ordinal);
                return MirrorWait::Unavailable;
            }
            st = match self.cv.wait_timeout(st, POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Idempotent per ordinal.
    pub fn release(&self, round: u64, ordinal: usize) {
        let mut st = self.lock();
        if st.round == round && st.settled(ordinal) < round {
            st.settle(ordinal, self.consumers);
        }
    }

    /// A consumer that will not wait for its round: settle the pending
    /// round, or the next one if none is pending.
    pub fn decline(&self, ordinal: usize) {
        let mut st = self.lock();
        let pending = matches!(st.status, MirrorStatus::Ready | MirrorStatus::Abandoned);
        if pending && st.round > st.settled(ordinal) {
            st.settle(ordinal, self.consumers);
        } else {
            st.skip_next.insert(ordinal);
        }
        debug!(ordinal, round = st.round, "declined host dataset");
    }

    pub fn populations(&self) -> u64 {
        self.lock().populations
    }

    pub fn frees(&self) -> u64 {
        self.lock().frees
    }

    pub fn is_resident(&self) -> bool {
        self.lock().data.is_some()
    }
}

/// Shared by every device engine of one farm.
pub struct DagCoordinator {
    mode: DagLoadMode,
    builder: usize,
    participants: Vec<usize>,
    initialized: AtomicUsize,
    turn_timeout: Option<Duration>,
    mirror: HostMirror,
}

impl DagCoordinator {
    pub fn new(
        mode: DagLoadMode,
        builder: usize,
        participants: Vec<usize>,
        turn_timeout: Option<Duration>,
    ) -> Self {
        let consumers = if mode == DagLoadMode::Single && participants.contains(&builder) {
            participants.len() - 1
        } else {
            0
        };
        Self {
            mode,
            builder,
            participants,
            initialized: AtomicUsize::new(0),
            turn_timeout,
            mirror: HostMirror::new(consumers),
        }
    }

    pub fn mode(&self) -> DagLoadMode {
        self.mode
    }

    pub fn mirror(&self) -> &HostMirror {
        &self.mirror
    }

    pub fn role(&self, ordinal: usize) -> DagRole {
        if self.mode != DagLoadMode::Single || !self.participants.contains(&self.builder) {
            return DagRole::Independent;
        }
        if ordinal == self.builder {
            DagRole::Builder
        } else {
            DagRole::Consumer
        }
    }

    fn position(&self, ordinal: usize) -> usize {
        self.participants.iter().position(|&o| o == ordinal).unwrap_or(0)
    }

    /// Waits until every device ahead of `ordinal` finished its turn for
    /// round `round`. Other modes return immediately. `None` when `stop` was
    /// raised while waiting.
    pub fn take_turn(&self, ordinal: usize, round: usize, stop: &AtomicBool) -> Option<SequentialTurn<'_>> {
        if self.mode != DagLoadMode::Sequential {
            return Some(SequentialTurn { counter: None });
        }
        let target = round * self.participants.len() + self.position(ordinal);
        let started = Instant::now();
        while self.initialized.load(Ordering::SeqCst) < target {
            if stop.load(Ordering::Relaxed) {
                debug!(ordinal, round, "dataset turn interrupted");
                return None;
            }
            if self.turn_timeout.is_some_and(|t| started.elapsed() >= t) {
                warn!(ordinal, "sequential dataset turn timed out, proceeding");
                break;
            }
            std::thread::sleep(POLL);
        }
        debug!(ordinal, round, "dataset turn acquired");
        Some(SequentialTurn { counter: Some(&self.initialized) })
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }
}

/// Releases the sequential turn on drop, on success and on failure alike.
pub struct SequentialTurn<'a> {
    counter: Option<&'a AtomicUsize>,
}

impl Drop for SequentialTurn<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct AbandonGuard<'a> {
    mirror: &'a HostMirror,
    epoch: u32,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mirror.abandon(self.epoch);
        }
    }
}

/// Declines the consumer's round unless it was settled through `wait`.
struct DeclineGuard<'a> {
    mirror: &'a HostMirror,
    ordinal: usize,
    armed: bool,
}

impl Drop for DeclineGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mirror.decline(self.ordinal);
        }
    }
}

pub struct DatasetManager {
    ordinal: usize,
    coordinator: Arc<DagCoordinator>,
    epochs: Arc<dyn EpochCache>,
    grid: u32,
    block: u32,
    streams: usize,
    resident: Option<(u32, u32)>,
    rounds: usize,
}

impl DatasetManager {
    pub fn new(
        ordinal: usize,
        coordinator: Arc<DagCoordinator>,
        epochs: Arc<dyn EpochCache>,
        grid: u32,
        block: u32,
        streams: usize,
    ) -> Self {
        Self { ordinal, coordinator, epochs, grid, block, streams, resident: None, rounds: 0 }
    }

    pub fn resident_epoch(&self) -> Option<u32> {
        self.resident.map(|(epoch, _)| epoch)
    }

    /// Forces the next `ensure_dataset` to rebuild.
    pub fn invalidate(&mut self) {
        self.resident = None;
    }

    pub fn ensure_dataset(
        &mut self,
        device: &mut dyn ComputeDevice,
        epoch: u32,
        stop: &AtomicBool,
    ) -> Result<DatasetOutcome, DeviceError> {
        let elements = self.epochs.dataset_elements(epoch);
        if self.resident == Some((epoch, elements)) {
            return Ok(DatasetOutcome::AlreadyResident);
        }

        let coordinator = self.coordinator.clone();
        let role = coordinator.role(self.ordinal);
        let mut abandon = AbandonGuard {
            mirror: coordinator.mirror(),
            epoch,
            armed: role == DagRole::Builder && coordinator.mirror().consumers() > 0,
        };
        let mut decline = DeclineGuard {
            mirror: coordinator.mirror(),
            ordinal: self.ordinal,
            armed: role == DagRole::Consumer,
        };

        let Some(_turn) = coordinator.take_turn(self.ordinal, self.rounds, stop) else {
            return Err(DeviceError::runtime(self.ordinal, "load dataset", "interrupted"));
        };
        self.rounds += 1;

        let started = Instant::now();
        let light = self.epochs.light(epoch)?;
        let bytes = self.epochs.dataset_bytes(epoch);
        let required = bytes + light.bytes();
        let available = device.info().total_memory;
        if required > available {
            return Err(DeviceError::InsufficientMemory { device: self.ordinal, required, available });
        }

        self.resident = None;
        device.reset()?;
        device.load_light_cache(&light.words)?;
        device.allocate_dataset(bytes)?;
        device.create_streams(self.streams)?;

        let outcome = match role {
            DagRole::Independent => {
                device.generate_dataset(self.grid, self.block)?;
                DatasetOutcome::Generated
            }
            DagRole::Builder => {
                device.generate_dataset(self.grid, self.block)?;
                if abandon.armed {
                    let data = device.read_dataset()?;
                    coordinator.mirror().publish(epoch, data);
                    abandon.armed = false;
                }
                DatasetOutcome::Generated
            }
            DagRole::Consumer => {
                let waited = coordinator.mirror().wait(self.ordinal, epoch, stop, coordinator.turn_timeout);
                decline.armed = false;
                match waited {
                    MirrorWait::Ready { round, data } => {
                        let copied = self.upload_mirror(device, &data);
                        coordinator.mirror().release(round, self.ordinal);
                        copied?;
                        DatasetOutcome::CopiedFromHost
                    }
                    MirrorWait::Unavailable => {
                        if stop.load(Ordering::Relaxed) {
                            return Err(DeviceError::runtime(self.ordinal, "load dataset", "interrupted"));
                        }
                        info!(device = self.ordinal, epoch, "host dataset unavailable, generating locally");
                        device.generate_dataset(self.grid, self.block)?;
                        DatasetOutcome::Generated
                    }
                }
            }
        };

        self.resident = Some((epoch, elements));
        info!(
            device = self.ordinal,
            epoch,
            bytes,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dataset ready"
        );
        Ok(outcome)
    }

    fn upload_mirror(&self, device: &mut dyn ComputeDevice, data: &[u32]) -> Result<(), DeviceError> {
        debug!(device = self.ordinal, words = data.len(), "copying host dataset to device");
        device.write_dataset(data)
    }
}
