#![cfg(feature = "cuda")]
use std::sync::Arc;

use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, DriverError, LaunchConfig, PushKernelArg,
};
use cudarc::nvrtc::{CompileError, CompileOptions, compile_ptx_with_opts};
use tracing::{debug, info};

use crate::device::{ComputeDevice, DeviceInfo, SearchHit, SearchParams, decode_results};
use crate::error_handling::DeviceError;
use crate::kernels::{self, DAG_ENTRY, KernelDialect, KernelSource, RESULT_WORDS};
use crate::progpow::NODE_WORDS;

struct CudaStreamSlot {
    stream: Arc<CudaStream>,
    header: CudaSlice<u32>,
    results: CudaSlice<u32>,
}

/// NVIDIA device driven through NVRTC and the driver API.
pub struct CudaGpu {
    info: DeviceInfo,
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    light: Option<(CudaSlice<u32>, u32)>,
    dataset: Option<(CudaSlice<u32>, u32)>,
    dag_fn: Option<CudaFunction>,
    search_fn: Option<CudaFunction>,
    streams: Vec<CudaStreamSlot>,
}

fn cuda_err(device: usize, operation: &'static str) -> impl Fn(DriverError) -> DeviceError {
    move |e| DeviceError::runtime(device, operation, format!("{e:?}"))
}

impl CudaGpu {
    pub fn enumerate() -> Result<Vec<Self>, DeviceError> {
        let count = CudaContext::device_count().map_err(cuda_err(0, "enumerate"))?;
        (0..count as usize).map(Self::open).collect()
    }

    fn open(ordinal: usize) -> Result<Self, DeviceError> {
        let err = cuda_err(ordinal, "open");
        let ctx = CudaContext::new(ordinal).map_err(&err)?;
        let name = ctx.name().map_err(&err)?;
        let (major, minor) = ctx.compute_capability().map_err(&err)?;
        let (_, total_memory) = cudarc::driver::result::mem_get_info().map_err(&err)?;
        info!(ordinal, %name, major, minor, total_memory, "opened CUDA device");
        Ok(Self {
            info: DeviceInfo {
                ordinal,
                name,
                total_memory: total_memory as u64,
                compute_capability: Some((major as u32, minor as u32)),
            },
            stream: ctx.default_stream(),
            ctx,
            light: None,
            dataset: None,
            dag_fn: None,
            search_fn: None,
            streams: Vec::new(),
        })
    }

    /// NVRTC compile plus module load; returns the named entry point.
    fn build(&self, text: &str, entry: &str) -> Result<CudaFunction, DeviceError> {
        let ordinal = self.info.ordinal;
        let mut options = vec!["-lineinfo".to_string()];
        if let Some((major, minor)) = self.info.compute_capability {
            options.push(format!("--gpu-architecture=compute_{major}{minor}"));
        }
        let ptx = compile_ptx_with_opts(text, CompileOptions { options, ..Default::default() })
            .map_err(|e| {
                let log = match e {
                    CompileError::CompileError { log, .. } => log.to_string_lossy().into_owned(),
                    other => format!("{other:?}"),
                };
                DeviceError::Compile { device: ordinal, log }
            })?;
        let module = self.ctx.load_module(ptx).map_err(cuda_err(ordinal, "load module"))?;
        module.load_function(entry).map_err(cuda_err(ordinal, "load function"))
    }
}

impl ComputeDevice for CudaGpu {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn dialect(&self) -> KernelDialect {
        KernelDialect::Cuda
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.ctx.synchronize().map_err(cuda_err(self.info.ordinal, "reset"))?;
        self.streams.clear();
        self.search_fn = None;
        self.dataset = None;
        self.light = None;
        Ok(())
    }

    fn load_light_cache(&mut self, words: &[u32]) -> Result<(), DeviceError> {
        let buf = self
            .stream
            .memcpy_stod(words)
            .map_err(cuda_err(self.info.ordinal, "upload light cache"))?;
        self.light = Some((buf, (words.len() / NODE_WORDS) as u32));
        Ok(())
    }

    fn allocate_dataset(&mut self, bytes: u64) -> Result<(), DeviceError> {
        let buf = self
            .stream
            .alloc_zeros::<u32>((bytes / 4) as usize)
            .map_err(cuda_err(self.info.ordinal, "allocate dataset"))?;
        self.dataset = Some((buf, (bytes / (NODE_WORDS as u64 * 4)) as u32));
        Ok(())
    }

    fn generate_dataset(&mut self, grid: u32, block: u32) -> Result<(), DeviceError> {
        let ordinal = self.info.ordinal;
        if self.dag_fn.is_none() {
            self.dag_fn = Some(self.build(&kernels::dag_source(KernelDialect::Cuda), DAG_ENTRY)?);
        }
        let (Some(func), Some((light, light_nodes)), Some((dataset, dag_nodes))) =
            (&self.dag_fn, &self.light, &mut self.dataset)
        else {
            return Err(DeviceError::runtime(ordinal, "generate", "light cache or dataset missing"));
        };

        let cfg = LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (block, 1, 1),
            shared_mem_bytes: 0,
        };
        let chunk = grid.saturating_mul(block);
        let mut start = 0u32;
        while start < *dag_nodes {
            unsafe {
                let mut launch = self.stream.launch_builder(func);
                launch
                    .arg(&start)
                    .arg(&*light)
                    .arg(light_nodes)
                    .arg(&mut *dataset)
                    .arg(&*dag_nodes);
                launch.launch(cfg).map_err(cuda_err(ordinal, "generate"))?;
            }
            start = start.saturating_add(chunk);
        }
        self.stream.synchronize().map_err(cuda_err(ordinal, "generate"))
    }

    fn read_dataset(&mut self) -> Result<Vec<u32>, DeviceError> {
        let ordinal = self.info.ordinal;
        let (dataset, _) = self
            .dataset
            .as_ref()
            .ok_or_else(|| DeviceError::runtime(ordinal, "read dataset", "dataset not allocated"))?;
        self.stream.memcpy_dtov(dataset).map_err(cuda_err(ordinal, "read dataset"))
    }

    fn write_dataset(&mut self, words: &[u32]) -> Result<(), DeviceError> {
        let ordinal = self.info.ordinal;
        let (dataset, _) = self
            .dataset
            .as_mut()
            .ok_or_else(|| DeviceError::runtime(ordinal, "write dataset", "dataset not allocated"))?;
        self.stream.memcpy_htod(words, dataset).map_err(cuda_err(ordinal, "write dataset"))?;
        self.stream.synchronize().map_err(cuda_err(ordinal, "write dataset"))
    }

    fn create_streams(&mut self, count: usize) -> Result<(), DeviceError> {
        let err = cuda_err(self.info.ordinal, "create streams");
        self.streams.clear();
        for _ in 0..count {
            let stream = self.ctx.new_stream().map_err(&err)?;
            let header = stream.alloc_zeros::<u32>(8).map_err(&err)?;
            let results = stream.alloc_zeros::<u32>(RESULT_WORDS).map_err(&err)?;
            self.streams.push(CudaStreamSlot { stream, header, results });
        }
        Ok(())
    }

    fn compile_search(&mut self, source: &KernelSource) -> Result<(), DeviceError> {
        self.search_fn = Some(self.build(&source.text, source.entry)?);
        debug!(device = self.info.ordinal, "search module loaded");
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
        let err = cuda_err(ordinal, "launch");
        let (Some(func), Some((dataset, _)), Some(slot)) =
            (&self.search_fn, &self.dataset, self.streams.get_mut(stream))
        else {
            return Err(DeviceError::runtime(ordinal, "launch", "search program or stream missing"));
        };

        slot.stream
            .memcpy_htod(&params.header.to_words()[..], &mut slot.header)
            .map_err(&err)?;
        let cfg = LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (block, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            let mut launch = slot.stream.launch_builder(func);
            launch
                .arg(&params.start_nonce)
                .arg(&params.target)
                .arg(&slot.header)
                .arg(dataset)
                .arg(&mut slot.results);
            launch.launch(cfg).map_err(&err)?;
        }
        Ok(())
    }

    fn collect(&mut self, stream: usize) -> Result<Vec<SearchHit>, DeviceError> {
        let ordinal = self.info.ordinal;
        let err = cuda_err(ordinal, "collect");
        let slot = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| DeviceError::runtime(ordinal, "collect", format!("no stream {stream}")))?;
        slot.stream.synchronize().map_err(&err)?;
        let buf = slot.stream.memcpy_dtov(&slot.results).map_err(&err)?;
        if buf.first().copied().unwrap_or(0) != 0 {
            slot.stream.memset_zeros(&mut slot.results).map_err(&err)?;
        }
        Ok(decode_results(&buf))
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        self.ctx.synchronize().map_err(cuda_err(self.info.ordinal, "synchronize"))
    }
}
