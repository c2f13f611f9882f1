//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::epoch::{self, EpochCache, LightCache};
use crate::error_handling::DeviceError;
use crate::progpow::NODE_WORDS;
use crate::types::{H256, WorkPackage, difficulty_to_boundary};

pub const TINY_LIGHT_NODES: u64 = 64;

/// Small epochs: a 64 node light cache and a dataset of 64 KiB plus 4 KiB
/// per epoch.
#[derive(Default)]
pub struct TinyEpochs {
    pub light_calls: AtomicUsize,
}

impl EpochCache for TinyEpochs {
    fn light(&self, epoch: u32) -> Result<Arc<LightCache>, DeviceError> {
        self.light_calls.fetch_add(1, Ordering::SeqCst);
        let words = epoch::make_cache(TINY_LIGHT_NODES * NODE_WORDS as u64 * 4, &epoch::seed_hash(epoch));
        Ok(Arc::new(LightCache { epoch, block_number: epoch as u64 * epoch::EPOCH_LENGTH, words }))
    }

    fn dataset_bytes(&self, epoch: u32) -> u64 {
        (64 << 10) + (epoch as u64) * (4 << 10)
    }
}

/// A valid work package at `height` with an easy boundary.
pub fn work(header_byte: u8, epoch: u32, height: u64) -> WorkPackage {
    WorkPackage {
        header: H256([header_byte; 32]),
        seed: epoch::seed_hash(epoch),
        epoch,
        boundary: difficulty_to_boundary(1.0),
        height,
        job: format!("job{header_byte}"),
        ..Default::default()
    }
}
