pub mod types;
pub mod progpow;
pub mod epoch;
pub mod kernels;
pub mod compiler;
pub mod device;
pub mod cpu;
#[cfg(feature = "opencl")]
pub mod gpu;
#[cfg(feature = "cuda")]
pub mod gpu_cuda;
pub mod dag;
pub mod miner;
pub mod farm;
pub mod pool;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod prometheus_metrics;
pub mod error_handling;
pub mod health;
pub mod server;
#[cfg(test)]
mod testing;
