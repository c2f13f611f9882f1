use ocl::enums::{DeviceInfo as ClDeviceInfo, DeviceInfoResult};
use ocl::{Buffer, Context, Device, Kernel, Platform, Program, Queue};
use tracing::{debug, info};

use crate::device::{ComputeDevice, DeviceInfo, SearchHit, SearchParams, decode_results};
use crate::error_handling::DeviceError;
use crate::kernels::{self, DAG_ENTRY, KernelDialect, KernelSource, RESULT_WORDS};
use crate::progpow::NODE_WORDS;

struct ClStream {
    queue: Queue,
    header: Buffer<u32>,
    results: Buffer<u32>,
    kernel: Option<Kernel>,
}

/// OpenCL device with one command queue per pipeline slot.
pub struct OpenClDevice {
    info: DeviceInfo,
    device: Device,
    ctx: Context,
    queue: Queue,
    light: Option<(Buffer<u32>, u32)>,
    dataset: Option<(Buffer<u32>, u32)>,
    dag_program: Option<Program>,
    search_program: Option<Program>,
    streams: Vec<ClStream>,
}

fn cl_err(device: usize, operation: &'static str) -> impl Fn(ocl::Error) -> DeviceError {
    move |e| DeviceError::runtime(device, operation, e)
}

impl OpenClDevice {
    /// Every GPU on every platform, numbered in discovery order.
    pub fn enumerate() -> Result<Vec<Self>, DeviceError> {
        let mut out = Vec::new();
        for platform in Platform::list() {
            let devices = match Device::list(platform, Some(ocl::flags::DEVICE_TYPE_GPU)) {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "skipping OpenCL platform");
                    continue;
                }
            };
            for device in devices {
                out.push(Self::open(out.len(), platform, device)?);
            }
        }
        Ok(out)
    }

    fn open(ordinal: usize, platform: Platform, device: Device) -> Result<Self, DeviceError> {
        let err = cl_err(ordinal, "open");
        let name = device.name().map_err(&err)?;
        let total_memory = match device.info(ClDeviceInfo::GlobalMemSize).map_err(&err)? {
            DeviceInfoResult::GlobalMemSize(bytes) => bytes,
            _ => 0,
        };
        let ctx = Context::builder().platform(platform).devices(device).build().map_err(&err)?;
        let queue = Queue::new(&ctx, device, None).map_err(&err)?;
        info!(ordinal, %name, total_memory, "opened OpenCL device");
        Ok(Self {
            info: DeviceInfo { ordinal, name, total_memory, compute_capability: None },
            device,
            ctx,
            queue,
            light: None,
            dataset: None,
            dag_program: None,
            search_program: None,
            streams: Vec::new(),
        })
    }

    fn build_program(&self, text: &str) -> Result<Program, DeviceError> {
        Program::builder()
            .src(text)
            .devices(self.device)
            .build(&self.ctx)
            .map_err(|e| DeviceError::Compile { device: self.info.ordinal, log: e.to_string() })
    }

    fn build_search_kernel(&self, program: &Program, stream: &ClStream) -> Result<Kernel, DeviceError> {
        let (dataset, _) = self
            .dataset
            .as_ref()
            .ok_or_else(|| DeviceError::runtime(self.info.ordinal, "build kernel", "dataset not allocated"))?;
        Kernel::builder()
            .program(program)
            .name(kernels::SEARCH_ENTRY)
            .queue(stream.queue.clone())
            .arg(&0u64)
            .arg(&0u64)
            .arg(&stream.header)
            .arg(dataset)
            .arg(&stream.results)
            .build()
            .map_err(cl_err(self.info.ordinal, "build kernel"))
    }
}

impl ComputeDevice for OpenClDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn dialect(&self) -> KernelDialect {
        KernelDialect::OpenCl
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.queue.finish().map_err(cl_err(self.info.ordinal, "reset"))?;
        self.streams.clear();
        self.search_program = None;
        self.dataset = None;
        self.light = None;
        Ok(())
    }

    fn load_light_cache(&mut self, words: &[u32]) -> Result<(), DeviceError> {
        let buf = Buffer::<u32>::builder()
            .queue(self.queue.clone())
            .len(words.len())
            .copy_host_slice(words)
            .build()
            .map_err(cl_err(self.info.ordinal, "upload light cache"))?;
        self.light = Some((buf, (words.len() / NODE_WORDS) as u32));
        Ok(())
    }

    fn allocate_dataset(&mut self, bytes: u64) -> Result<(), DeviceError> {
        let buf = Buffer::<u32>::builder()
            .queue(self.queue.clone())
            .len((bytes / 4) as usize)
            .build()
            .map_err(cl_err(self.info.ordinal, "allocate dataset"))?;
        self.dataset = Some((buf, (bytes / (NODE_WORDS as u64 * 4)) as u32));
        Ok(())
    }

    fn generate_dataset(&mut self, grid: u32, block: u32) -> Result<(), DeviceError> {
        let ordinal = self.info.ordinal;
        if self.dag_program.is_none() {
            self.dag_program = Some(self.build_program(&kernels::dag_source(KernelDialect::OpenCl))?);
        }
        let (Some(program), Some((light, light_nodes)), Some((dataset, dag_nodes))) =
            (&self.dag_program, &self.light, &self.dataset)
        else {
            return Err(DeviceError::runtime(ordinal, "generate", "light cache or dataset missing"));
        };

        let chunk = (grid as usize) * (block as usize);
        let kernel = Kernel::builder()
            .program(program)
            .name(DAG_ENTRY)
            .queue(self.queue.clone())
            .global_work_size(chunk)
            .local_work_size(block as usize)
            .arg(&0u32)
            .arg(light)
            .arg(light_nodes)
            .arg(dataset)
            .arg(dag_nodes)
            .build()
            .map_err(cl_err(ordinal, "generate"))?;

        let mut start = 0u32;
        while start < *dag_nodes {
            kernel.set_arg(0, &start).map_err(cl_err(ordinal, "generate"))?;
            unsafe {
                kernel.enq().map_err(cl_err(ordinal, "generate"))?;
            }
            start = start.saturating_add(chunk as u32);
        }
        self.queue.finish().map_err(cl_err(ordinal, "generate"))?;
        Ok(())
    }

    fn read_dataset(&mut self) -> Result<Vec<u32>, DeviceError> {
        let ordinal = self.info.ordinal;
        let (dataset, _) = self
            .dataset
            .as_ref()
            .ok_or_else(|| DeviceError::runtime(ordinal, "read dataset", "dataset not allocated"))?;
        let mut out = vec![0u32; dataset.len()];
        dataset.read(&mut out).queue(&self.queue).enq().map_err(cl_err(ordinal, "read dataset"))?;
        Ok(out)
    }

    fn write_dataset(&mut self, words: &[u32]) -> Result<(), DeviceError> {
        let ordinal = self.info.ordinal;
        let (dataset, _) = self
            .dataset
            .as_ref()
            .ok_or_else(|| DeviceError::runtime(ordinal, "write dataset", "dataset not allocated"))?;
        dataset.write(words).queue(&self.queue).enq().map_err(cl_err(ordinal, "write dataset"))?;
        self.queue.finish().map_err(cl_err(ordinal, "write dataset"))
    }

    fn create_streams(&mut self, count: usize) -> Result<(), DeviceError> {
        let err = cl_err(self.info.ordinal, "create streams");
        self.streams.clear();
        for _ in 0..count {
            let queue = Queue::new(&self.ctx, self.device, None).map_err(&err)?;
            let header = Buffer::<u32>::builder().queue(queue.clone()).len(8).build().map_err(&err)?;
            let results = Buffer::<u32>::builder()
                .queue(queue.clone())
                .len(RESULT_WORDS)
                .fill_val(0u32)
                .build()
                .map_err(&err)?;
            self.streams.push(ClStream { queue, header, results, kernel: None });
        }
        Ok(())
    }

    fn compile_search(&mut self, source: &KernelSource) -> Result<(), DeviceError> {
        let program = self.build_program(&source.text)?;
        let mut kernels = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            kernels.push(self.build_search_kernel(&program, stream)?);
        }
        for (stream, kernel) in self.streams.iter_mut().zip(kernels) {
            stream.kernel = Some(kernel);
        }
        self.search_program = Some(program);
        debug!(device = self.info.ordinal, "search program built");
        Ok(())
    }

    fn launch_search(
        &mut self,
        stream: usize,
        params: &SearchParams,
        grid: u32,
        block: u32,
    ) -> Result<(), DeviceError> {
        let err = cl_err(self.info.ordinal, "launch");
        let slot = self
            .streams
            .get(stream)
            .ok_or_else(|| DeviceError::runtime(self.info.ordinal, "launch", format!("no stream {stream}")))?;
        let kernel = slot
            .kernel
            .as_ref()
            .ok_or_else(|| DeviceError::runtime(self.info.ordinal, "launch", "no search program"))?;

        slot.header.write(&params.header.to_words()[..]).queue(&slot.queue).enq().map_err(&err)?;
        kernel.set_arg(0, &params.start_nonce).map_err(&err)?;
        kernel.set_arg(1, &params.target).map_err(&err)?;
        unsafe {
            kernel
                .cmd()
                .queue(&slot.queue)
                .global_work_size(grid as usize * block as usize)
                .local_work_size(block as usize)
                .enq()
                .map_err(&err)?;
        }
        Ok(())
    }

    fn collect(&mut self, stream: usize) -> Result<Vec<SearchHit>, DeviceError> {
        let err = cl_err(self.info.ordinal, "collect");
        let slot = self
            .streams
            .get(stream)
            .ok_or_else(|| DeviceError::runtime(self.info.ordinal, "collect", format!("no stream {stream}")))?;
        slot.queue.finish().map_err(&err)?;
        let mut buf = vec![0u32; RESULT_WORDS];
        slot.results.read(&mut buf).queue(&slot.queue).enq().map_err(&err)?;
        if buf[0] != 0 {
            let zero = [0u32; 1];
            slot.results.write(&zero[..]).queue(&slot.queue).enq().map_err(&err)?;
        }
        Ok(decode_results(&buf))
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        let err = cl_err(self.info.ordinal, "synchronize");
        for stream in &self.streams {
            stream.queue.finish().map_err(&err)?;
        }
        self.queue.finish().map_err(&err)
    }
}
