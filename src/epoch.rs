//! Epoch sizing, seed hashes and light caches.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sha3::{Digest, Keccak256, Keccak512};
use tracing::{debug, info};

use crate::error_handling::DeviceError;
use crate::progpow::{DAG_ELEMENT_BYTES, NODE_WORDS};
use crate::types::H256;

pub const EPOCH_LENGTH: u64 = 30_000;
/// Seed lookups beyond this many epochs are rejected.
pub const MAX_EPOCHS: u32 = 2048;

const CACHE_BYTES_INIT: u64 = 1 << 24;
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
const DATASET_BYTES_INIT: u64 = 1 << 30;
const DATASET_BYTES_GROWTH: u64 = 1 << 23;
const HASH_BYTES: u64 = 64;
const MIX_BYTES: u64 = 128;
const CACHE_ROUNDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightCache {
    pub epoch: u32,
    pub block_number: u64,
    /// Little-endian words, `NODE_WORDS` per node.
    pub words: Vec<u32>,
}

impl LightCache {
    pub fn nodes(&self) -> usize {
        self.words.len() / NODE_WORDS
    }

    pub fn bytes(&self) -> u64 {
        self.words.len() as u64 * 4
    }
}

/// Provider of per-epoch light caches and dataset sizes.
pub trait EpochCache: Send + Sync {
    fn light(&self, epoch: u32) -> Result<Arc<LightCache>, DeviceError>;

    fn dataset_bytes(&self, epoch: u32) -> u64;

    fn dataset_elements(&self, epoch: u32) -> u32 {
        (self.dataset_bytes(epoch) / DAG_ELEMENT_BYTES) as u32
    }

    fn dataset_elements_for_height(&self, height: u64) -> u32 {
        self.dataset_elements((height / EPOCH_LENGTH) as u32)
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut i = 3;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

pub fn cache_bytes(epoch: u32) -> u64 {
    let mut sz = CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * epoch as u64 - HASH_BYTES;
    while !is_prime(sz / HASH_BYTES) {
        sz -= 2 * HASH_BYTES;
    }
    sz
}

pub fn dataset_bytes(epoch: u32) -> u64 {
    let mut sz = DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * epoch as u64 - MIX_BYTES;
    while !is_prime(sz / MIX_BYTES) {
        sz -= 2 * MIX_BYTES;
    }
    sz
}

pub fn seed_hash(epoch: u32) -> H256 {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = Keccak256::digest(seed).into();
    }
    H256(seed)
}

/// Keccak-512 sequential fill followed by RandMemoHash rounds.
pub fn make_cache(bytes: u64, seed: &H256) -> Vec<u32> {
    let n = (bytes / HASH_BYTES) as usize;
    let mut items: Vec<[u8; 64]> = Vec::with_capacity(n);
    items.push(Keccak512::digest(seed.0).into());
    for i in 1..n {
        let next: [u8; 64] = Keccak512::digest(items[i - 1]).into();
        items.push(next);
    }

    for _ in 0..CACHE_ROUNDS {
        for i in 0..n {
            let v = u32::from_le_bytes([items[i][0], items[i][1], items[i][2], items[i][3]]) as usize % n;
            let prev = items[(i + n - 1) % n];
            let mut mixed = [0u8; 64];
            for k in 0..64 {
                mixed[k] = prev[k] ^ items[v][k];
            }
            items[i] = Keccak512::digest(mixed).into();
        }
    }

    items
        .iter()
        .flat_map(|item| {
            item.chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Ethash-sized epochs with the two most recent light caches kept in memory.
pub struct EthashEpochs {
    recent: Mutex<VecDeque<Arc<LightCache>>>,
}

impl Default for EthashEpochs {
    fn default() -> Self {
        Self::new()
    }
}

impl EthashEpochs {
    pub fn new() -> Self {
        Self { recent: Mutex::new(VecDeque::with_capacity(2)) }
    }
}

impl EpochCache for EthashEpochs {
    fn light(&self, epoch: u32) -> Result<Arc<LightCache>, DeviceError> {
        if epoch >= MAX_EPOCHS {
            return Err(DeviceError::EpochCache { epoch, message: "epoch out of range".into() });
        }
        let mut recent = self.recent.lock().map_err(|_| DeviceError::EpochCache {
            epoch,
            message: "light cache lock poisoned".into(),
        })?;
        if let Some(hit) = recent.iter().find(|c| c.epoch == epoch) {
            return Ok(hit.clone());
        }

        let bytes = cache_bytes(epoch);
        info!(epoch, bytes, "building light cache");
        let cache = Arc::new(LightCache {
            epoch,
            block_number: epoch as u64 * EPOCH_LENGTH,
            words: make_cache(bytes, &seed_hash(epoch)),
        });
        if recent.len() == 2 {
            recent.pop_front();
        }
        recent.push_back(cache.clone());
        Ok(cache)
    }

    fn dataset_bytes(&self, epoch: u32) -> u64 {
        dataset_bytes(epoch)
    }
}

/// Maps seed hashes back to epochs by walking the seed chain.
#[derive(Default)]
pub struct SeedResolver {
    chain: Mutex<Vec<H256>>,
}

impl SeedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch_of(&self, seed: &H256) -> Option<u32> {
        let mut chain = self.chain.lock().ok()?;
        if chain.is_empty() {
            chain.push(H256::zero());
        }
        if let Some(pos) = chain.iter().position(|s| s == seed) {
            return Some(pos as u32);
        }
        while chain.len() < MAX_EPOCHS as usize {
            let last = chain[chain.len() - 1];
            let next = H256(Keccak256::digest(last.0).into());
            chain.push(next);
            if next == *seed {
                debug!(epoch = chain.len() - 1, "resolved seed hash");
                return Some(chain.len() as u32 - 1);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_zero_sizes_match_ethash() {
        assert_eq!(cache_bytes(0), 16_776_896);
        assert_eq!(dataset_bytes(0), 1_073_739_904);
        assert!(dataset_bytes(1) > dataset_bytes(0));
    }

    #[test]
    fn seed_chain_resolves_both_ways() {
        let resolver = SeedResolver::new();
        assert_eq!(resolver.epoch_of(&H256::zero()), Some(0));
        let s5 = seed_hash(5);
        assert_eq!(resolver.epoch_of(&s5), Some(5));
        assert_eq!(resolver.epoch_of(&seed_hash(2)), Some(2));
        assert_eq!(resolver.epoch_of(&H256([0xab; 32])), None);
    }

    #[test]
    fn cache_is_deterministic_and_seed_dependent() {
        let a = make_cache(64 * 31, &seed_hash(0));
        let b = make_cache(64 * 31, &seed_hash(0));
        let c = make_cache(64 * 31, &seed_hash(1));
        assert_eq!(a.len(), 31 * NODE_WORDS);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn elements_follow_height() {
        let epochs = EthashEpochs::new();
        assert_eq!(
            epochs.dataset_elements_for_height(29_999),
            epochs.dataset_elements(0)
        );
        assert_eq!(
            epochs.dataset_elements_for_height(30_000),
            epochs.dataset_elements(1)
        );
    }
}
