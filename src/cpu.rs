//! Host compute device. Runs the reference hash on the calling thread and
//! mimics device memory limits, streams and result buffers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::device::{ComputeDevice, DeviceInfo, SearchHit, SearchParams};
use crate::error_handling::DeviceError;
use crate::kernels::{KernelDialect, KernelHeader, KernelSource};
use crate::progpow::{self, SEARCH_RESULTS};

/// Operation counters, shared so tests can observe a device owned by an engine.
#[derive(Debug, Default)]
pub struct CpuStats {
    pub resets: AtomicU64,
    pub light_uploads: AtomicU64,
    pub generations: AtomicU64,
    pub dataset_writes: AtomicU64,
    pub compiles: AtomicU64,
    pub launches: AtomicU64,
}

impl CpuStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub compile_error: Option<String>,
    pub bogus_hits: bool,
    pub launch_error: bool,
}

pub struct CpuDevice {
    info: DeviceInfo,
    light: Option<Vec<u32>>,
    dataset: Option<Vec<u32>>,
    dataset_bytes: u64,
    program: Option<KernelHeader>,
    streams: Vec<Vec<SearchHit>>,
    stats: Arc<CpuStats>,
    #[cfg(test)]
    pub faults: Faults,
}

impl CpuDevice {
    pub fn new(ordinal: usize, total_memory: u64) -> Self {
        Self {
            info: DeviceInfo {
                ordinal,
                name: format!("host-{ordinal}"),
                total_memory,
                compute_capability: None,
            },
            light: None,
            dataset: None,
            dataset_bytes: 0,
            program: None,
            streams: Vec::new(),
            stats: Arc::new(CpuStats::default()),
            #[cfg(test)]
            faults: Faults::default(),
        }
    }

    pub fn stats(&self) -> Arc<CpuStats> {
        self.stats.clone()
    }

    fn dataset(&self, operation: &'static str) -> Result<&Vec<u32>, DeviceError> {
        self.dataset
            .as_ref()
            .ok_or_else(|| DeviceError::runtime(self.info.ordinal, operation, "dataset not allocated"))
    }
}

impl ComputeDevice for CpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn dialect(&self) -> KernelDialect {
        KernelDialect::Host
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.light = None;
        self.dataset = None;
        self.dataset_bytes = 0;
        self.program = None;
        self.streams.clear();
        self.stats.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_light_cache(&mut self, words: &[u32]) -> Result<(), DeviceError> {
        self.light = Some(words.to_vec());
        self.stats.light_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allocate_dataset(&mut self, bytes: u64) -> Result<(), DeviceError> {
        let light_bytes = self.light.as_ref().map(|l| l.len() as u64 * 4).unwrap_or(0);
        if bytes + light_bytes > self.info.total_memory {
            return Err(DeviceError::InsufficientMemory {
                device: self.info.ordinal,
                required: bytes + light_bytes,
                available: self.info.total_memory,
            });
        }
        self.dataset = Some(vec![0u32; (bytes / 4) as usize]);
        self.dataset_bytes = bytes;
        Ok(())
    }

    fn generate_dataset(&mut self, _grid: u32, _block: u32) -> Result<(), DeviceError> {
        let light = self
            .light
            .as_ref()
            .ok_or_else(|| DeviceError::runtime(self.info.ordinal, "generate", "light cache not loaded"))?;
        self.dataset("generate")?;
        let words = progpow::build_dataset(light, self.dataset_bytes);
        if let Some(dataset) = self.dataset.as_mut() {
            dataset[..words.len()].copy_from_slice(&words);
        }
        self.stats.generations.fetch_add(1, Ordering::SeqCst);
        debug!(device = self.info.ordinal, bytes = self.dataset_bytes, "generated dataset");
        Ok(())
    }

    fn read_dataset(&mut self) -> Result<Vec<u32>, DeviceError> {
        Ok(self.dataset("read dataset")?.clone())
    }

    fn write_dataset(&mut self, words: &[u32]) -> Result<(), DeviceError> {
        let ordinal = self.info.ordinal;
        let dataset = self
            .dataset
            .as_mut()
            .ok_or_else(|| DeviceError::runtime(ordinal, "write dataset", "dataset not allocated"))?;
        if words.len() != dataset.len() {
            return Err(DeviceError::runtime(
                ordinal,
                "write dataset",
                format!("size mismatch: {} words into {}", words.len(), dataset.len()),
            ));
        }
        dataset.copy_from_slice(words);
        self.stats.dataset_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_streams(&mut self, count: usize) -> Result<(), DeviceError> {
        self.streams = vec![Vec::new(); count];
        Ok(())
    }

    fn compile_search(&mut self, source: &KernelSource) -> Result<(), DeviceError> {
        #[cfg(test)]
        if let Some(log) = &self.faults.compile_error {
            return Err(DeviceError::Compile { device: self.info.ordinal, log: log.clone() });
        }
        self.program = Some(source.header);
        self.stats.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn launch_search(
        &mut self,
        stream: usize,
        params: &SearchParams,
        grid: u32,
        block: u32,
    ) -> Result<(), DeviceError> {
        let ordinal = self.info.ordinal;
        #[cfg(test)]
        if self.faults.launch_error {
            return Err(DeviceError::runtime(ordinal, "launch", "injected failure"));
        }
        let header = self
            .program
            .ok_or_else(|| DeviceError::runtime(ordinal, "launch", "no search program"))?;
        if stream >= self.streams.len() {
            return Err(DeviceError::runtime(ordinal, "launch", format!("no stream {stream}")));
        }

        let dataset = self.dataset("launch")?;
        let mut dag: &[u32] = dataset;
        let words = params.header.to_words();
        let mut hits = Vec::new();
        for gid in 0..grid.saturating_mul(block) {
            let nonce = params.start_nonce.wrapping_add(gid as u64);
            let r = progpow::search_hash(&mut dag, header.dag_elements, &words, nonce, &header.period);
            if r.value.upper_u64() <= params.target && hits.len() < SEARCH_RESULTS {
                hits.push(SearchHit { gid, mix: r.mix });
            }
        }

        #[cfg(test)]
        if self.faults.bogus_hits {
            hits = vec![SearchHit { gid: 0, mix: crate::types::H256([0x5a; 32]) }];
        }

        self.streams[stream] = hits;
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn collect(&mut self, stream: usize) -> Result<Vec<SearchHit>, DeviceError> {
        let ordinal = self.info.ordinal;
        let slot = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| DeviceError::runtime(ordinal, "collect", format!("no stream {stream}")))?;
        Ok(std::mem::take(slot))
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}
