//! Compute device abstraction shared by the host, OpenCL and CUDA backends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error_handling::DeviceError;
use crate::kernels::{KernelDialect, KernelSource};
use crate::types::H256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ordinal: usize,
    pub name: String,
    pub total_memory: u64,
    pub compute_capability: Option<(u32, u32)>,
}

/// Arguments of one search launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    pub header: H256,
    /// Upper 64 bits of the boundary.
    pub target: u64,
    pub start_nonce: u64,
}

/// One candidate reported by a search launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchHit {
    /// Thread index; the nonce is `start_nonce + gid`.
    pub gid: u32,
    pub mix: H256,
}

pub trait ComputeDevice: Send {
    fn info(&self) -> &DeviceInfo;

    fn dialect(&self) -> KernelDialect;

    /// Drop all device allocations, streams and the compiled program.
    fn reset(&mut self) -> Result<(), DeviceError>;

    fn load_light_cache(&mut self, words: &[u32]) -> Result<(), DeviceError>;

    fn allocate_dataset(&mut self, bytes: u64) -> Result<(), DeviceError>;

    /// Fill the allocated dataset from the loaded light cache.
    fn generate_dataset(&mut self, grid: u32, block: u32) -> Result<(), DeviceError>;

    fn read_dataset(&mut self) -> Result<Vec<u32>, DeviceError>;

    fn write_dataset(&mut self, words: &[u32]) -> Result<(), DeviceError>;

    fn create_streams(&mut self, count: usize) -> Result<(), DeviceError>;

    fn compile_search(&mut self, source: &KernelSource) -> Result<(), DeviceError>;

    fn launch_search(
        &mut self,
        stream: usize,
        params: &SearchParams,
        grid: u32,
        block: u32,
    ) -> Result<(), DeviceError>;

    /// Wait for the stream, return its hits in slot order and clear its
    /// result buffer.
    fn collect(&mut self, stream: usize) -> Result<Vec<SearchHit>, DeviceError>;

    fn synchronize(&mut self) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    Cpu,
    OpenCl,
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::OpenCl => write!(f, "opencl"),
            Backend::Cuda => write!(f, "cuda"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "host" => Ok(Backend::Cpu),
            "opencl" | "cl" => Ok(Backend::OpenCl),
            "cuda" => Ok(Backend::Cuda),
            other => Err(format!("unknown backend {other}")),
        }
    }
}

/// Decode a result buffer: count word followed by gid + mix slots.
pub(crate) fn decode_results(buf: &[u32]) -> Vec<SearchHit> {
    use crate::kernels::RESULT_SLOT_WORDS;
    use crate::progpow::SEARCH_RESULTS;

    let count = (buf.first().copied().unwrap_or(0) as usize).min(SEARCH_RESULTS);
    (0..count)
        .filter_map(|slot| {
            let base = 1 + slot * RESULT_SLOT_WORDS;
            let words = buf.get(base..base + RESULT_SLOT_WORDS)?;
            let mut mix = [0u32; 8];
            mix.copy_from_slice(&words[1..]);
            Some(SearchHit { gid: words[0], mix: H256::from_words(&mix) })
        })
        .collect()
}

/// Enumerate devices for `backend`. `selection` lists ordinals to keep; an
/// empty selection keeps every device.
pub fn open_devices(
    backend: Backend,
    selection: &[usize],
    cpu_memory: u64,
) -> Result<Vec<Box<dyn ComputeDevice>>, DeviceError> {
    let devices: Vec<Box<dyn ComputeDevice>> = match backend {
        Backend::Cpu => {
            let count = selection.iter().max().map(|m| m + 1).unwrap_or(1);
            (0..count)
                .map(|i| Box::new(crate::cpu::CpuDevice::new(i, cpu_memory)) as Box<dyn ComputeDevice>)
                .collect()
        }
        #[cfg(feature = "opencl")]
        Backend::OpenCl => crate::gpu::OpenClDevice::enumerate()?
            .into_iter()
            .map(|d| Box::new(d) as Box<dyn ComputeDevice>)
            .collect(),
        #[cfg(feature = "cuda")]
        Backend::Cuda => crate::gpu_cuda::CudaGpu::enumerate()?
            .into_iter()
            .map(|d| Box::new(d) as Box<dyn ComputeDevice>)
            .collect(),
        #[allow(unreachable_patterns)]
        other => {
            return Err(DeviceError::BackendUnavailable { backend: other.to_string() });
        }
    };

    let selected: Vec<_> = devices
        .into_iter()
        .filter(|d| selection.is_empty() || selection.contains(&d.info().ordinal))
        .collect();
    if selected.is_empty() {
        return Err(DeviceError::NoDevices);
    }
    Ok(selected)
}
