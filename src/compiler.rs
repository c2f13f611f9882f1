use tracing::{debug, info};

use crate::device::ComputeDevice;
use crate::error_handling::DeviceError;
use crate::kernels::{self, KernelHeader};
use crate::progpow::{PERIOD, PeriodConstants};

/// Keeps a device's search program in step with the work's period and
/// dataset size.
#[derive(Debug, Default)]
pub struct KernelCompiler {
    current: Option<(u64, u32)>,
    compiles: u64,
}

impl KernelCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when a new program was built.
    pub fn ensure(
        &mut self,
        device: &mut dyn ComputeDevice,
        height: u64,
        dag_elements: u32,
    ) -> Result<bool, DeviceError> {
        let period = height / PERIOD;
        if self.current == Some((period, dag_elements)) {
            return Ok(false);
        }

        let header = KernelHeader {
            dag_elements,
            period: PeriodConstants::for_period(period),
            compute_capability: device.info().compute_capability,
        };
        let source = kernels::search_source(device.dialect(), header);
        debug!(device = device.info().ordinal, bytes = source.text.len(), "compiling search kernel");

        // A failed build leaves no program; the next call retries.
        self.current = None;
        device.compile_search(&source)?;
        self.current = Some((period, dag_elements));
        self.compiles += 1;
        info!(device = device.info().ordinal, period, dag_elements, "search kernel ready");
        Ok(true)
    }

    /// Forget the program, e.g. after a device reset.
    pub fn invalidate(&mut self) {
        self.current = None;
    }

    pub fn compiles(&self) -> u64 {
        self.compiles
    }
}
