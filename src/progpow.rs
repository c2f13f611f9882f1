//! Host reference of the search hash.
//!
//! Every function here has a line-for-line counterpart in the device kernels
//! (`kernels.rs`). The host side is used to verify device results and by the
//! host compute device.

use std::collections::HashMap;
use std::sync::Arc;

use crate::epoch::{EpochCache, LightCache};
use crate::error_handling::DeviceError;
use crate::types::{H256, WorkPackage};

pub const LANES: usize = 16;
pub const DAG_LOADS: usize = 4;
pub const CNT_DAG: usize = 64;
/// Words per dataset/cache node (64 bytes).
pub const NODE_WORDS: usize = 16;
pub const DATASET_PARENTS: u32 = 64;
/// Bytes per DAG element addressed by the search loop.
pub const DAG_ELEMENT_BYTES: u64 = (LANES * DAG_LOADS * 4) as u64;
/// Blocks per period; kernels are regenerated when `height / PERIOD` changes.
pub const PERIOD: u64 = 10;
/// Result slots per stream.
pub const SEARCH_RESULTS: usize = 4;

pub const FNV_PRIME: u32 = 0x0100_0193;
pub const FNV_OFFSET: u32 = 0x811c_9dc5;

pub const KECCAK_ROUND_CONSTANTS: [u32; 22] = [
    0x0000_0001, 0x0000_8082, 0x0000_808a, 0x8000_8000, 0x0000_808b, 0x8000_0001,
    0x8000_8081, 0x0000_8009, 0x0000_008a, 0x0000_0088, 0x8000_8009, 0x8000_000a,
    0x8000_808b, 0x0000_008b, 0x0000_8089, 0x0000_8003, 0x0000_8002, 0x0000_0080,
    0x0000_800a, 0x8000_000a, 0x8000_8081, 0x0000_8080,
];

const ROTC: [u32; 24] = [
    1, 3, 6, 10, 15, 21, 28, 36, 45, 55, 2, 14, 27, 41, 56, 8, 25, 43, 62, 18, 39, 61, 20, 44,
];

const PILN: [usize; 24] = [
    10, 7, 11, 17, 18, 3, 5, 16, 8, 21, 24, 4, 15, 23, 19, 13, 12, 2, 20, 14, 22, 9, 6, 1,
];

#[inline]
pub fn fnv1a(h: u32, d: u32) -> u32 {
    (h ^ d).wrapping_mul(FNV_PRIME)
}

/// Keccak-f[800] permutation, 22 rounds.
pub fn keccak_f800(st: &mut [u32; 25]) {
    for rc in KECCAK_ROUND_CONSTANTS {
        let mut bc = [0u32; 5];
        for i in 0..5 {
            bc[i] = st[i] ^ st[i + 5] ^ st[i + 10] ^ st[i + 15] ^ st[i + 20];
        }
        for i in 0..5 {
            let t = bc[(i + 4) % 5] ^ bc[(i + 1) % 5].rotate_left(1);
            for j in (0..25).step_by(5) {
                st[j + i] ^= t;
            }
        }

        let mut t = st[1];
        for i in 0..24 {
            let j = PILN[i];
            let tmp = st[j];
            st[j] = t.rotate_left(ROTC[i] % 32);
            t = tmp;
        }

        for j in (0..25).step_by(5) {
            for i in 0..5 {
                bc[i] = st[j + i];
            }
            for i in 0..5 {
                st[j + i] ^= !bc[(i + 1) % 5] & bc[(i + 2) % 5];
            }
        }

        st[0] ^= rc;
    }
}

/// Constants baked into a kernel for one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodConstants {
    pub seed: u64,
    pub rot: u32,
    pub xor: u32,
}

impl PeriodConstants {
    pub fn for_height(height: u64) -> Self {
        Self::for_period(height / PERIOD)
    }

    pub fn for_period(seed: u64) -> Self {
        let mut st = [0u32; 25];
        st[0] = seed as u32;
        st[1] = (seed >> 32) as u32;
        keccak_f800(&mut st);
        Self { seed, rot: st[0] % 31 + 1, xor: st[1] }
    }
}

/// Derive one 64-byte dataset node from the light cache.
pub fn dataset_node(light: &[u32], index: u32) -> [u32; NODE_WORDS] {
    let light_nodes = (light.len() / NODE_WORDS) as u32;
    let base = (index % light_nodes) as usize * NODE_WORDS;

    let mut st = [0u32; 25];
    st[..NODE_WORDS].copy_from_slice(&light[base..base + NODE_WORDS]);
    st[0] ^= index;
    keccak_f800(&mut st);

    let mut mix = [0u32; NODE_WORDS];
    mix.copy_from_slice(&st[..NODE_WORDS]);
    for p in 0..DATASET_PARENTS {
        let parent = (fnv1a(index ^ p, mix[p as usize % NODE_WORDS]) % light_nodes) as usize;
        let parent_words = &light[parent * NODE_WORDS..parent * NODE_WORDS + NODE_WORDS];
        for k in 0..NODE_WORDS {
            mix[k] = fnv1a(mix[k], parent_words[k]);
        }
    }

    let mut st = [0u32; 25];
    st[..NODE_WORDS].copy_from_slice(&mix);
    keccak_f800(&mut st);
    let mut out = [0u32; NODE_WORDS];
    out.copy_from_slice(&st[..NODE_WORDS]);
    out
}

/// Build a complete dataset of `bytes` bytes on the host.
pub fn build_dataset(light: &[u32], bytes: u64) -> Vec<u32> {
    let nodes = (bytes / (NODE_WORDS as u64 * 4)) as u32;
    let mut out = Vec::with_capacity(nodes as usize * NODE_WORDS);
    for i in 0..nodes {
        out.extend_from_slice(&dataset_node(light, i));
    }
    out
}

/// Word-addressed view of a dataset.
pub trait DagSource {
    fn word(&mut self, index: usize) -> u32;
}

impl DagSource for &[u32] {
    fn word(&mut self, index: usize) -> u32 {
        self[index]
    }
}

/// Evaluates dataset words on demand from a light cache.
pub struct LightDag<'a> {
    light: &'a [u32],
    nodes: HashMap<u32, [u32; NODE_WORDS]>,
}

impl<'a> LightDag<'a> {
    pub fn new(light: &'a [u32]) -> Self {
        Self { light, nodes: HashMap::new() }
    }
}

impl DagSource for LightDag<'_> {
    fn word(&mut self, index: usize) -> u32 {
        let node = (index / NODE_WORDS) as u32;
        let light = self.light;
        let words = self.nodes.entry(node).or_insert_with(|| dataset_node(light, node));
        words[index % NODE_WORDS]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashResult {
    pub mix: H256,
    pub value: H256,
}

pub fn search_hash<D: DagSource>(
    dag: &mut D,
    dag_elements: u32,
    header: &[u32; 8],
    nonce: u64,
    period: &PeriodConstants,
) -> HashResult {
    let mut st = [0u32; 25];
    st[..8].copy_from_slice(header);
    st[8] = nonce as u32;
    st[9] = (nonce >> 32) as u32;
    keccak_f800(&mut st);
    let (seed_lo, seed_hi) = (st[0], st[1]);

    let mut mix = [0u32; LANES];
    for (l, m) in mix.iter_mut().enumerate() {
        *m = fnv1a(fnv1a(FNV_OFFSET ^ period.xor, seed_lo ^ l as u32), seed_hi);
    }

    for i in 0..CNT_DAG {
        let offset = ((mix[i % LANES] ^ period.xor) % dag_elements) as usize;
        for l in 0..LANES {
            let src = (l ^ (i % LANES)) % LANES;
            for j in 0..DAG_LOADS {
                let word = dag.word((offset * LANES + src) * DAG_LOADS + j);
                mix[l] = fnv1a(mix[l], word).rotate_left(period.rot);
            }
        }
    }

    let mut digest = [0u32; 8];
    for (k, d) in digest.iter_mut().enumerate() {
        *d = fnv1a(fnv1a(FNV_OFFSET, mix[2 * k]), mix[2 * k + 1]);
    }

    let mut st = [0u32; 25];
    st[..8].copy_from_slice(header);
    st[8] = seed_lo;
    st[9] = seed_hi;
    st[10..18].copy_from_slice(&digest);
    keccak_f800(&mut st);
    let mut value = [0u32; 8];
    value.copy_from_slice(&st[..8]);

    HashResult { mix: H256::from_words(&digest), value: H256::from_words(&value) }
}

/// Host-side re-evaluation of device results.
pub struct Verifier {
    epochs: Arc<dyn EpochCache>,
    light: Option<Arc<LightCache>>,
}

impl Verifier {
    pub fn new(epochs: Arc<dyn EpochCache>) -> Self {
        Self { epochs, light: None }
    }

    pub fn eval(&mut self, work: &WorkPackage, nonce: u64) -> Result<HashResult, DeviceError> {
        let light = match &self.light {
            Some(l) if l.epoch == work.epoch => l.clone(),
            _ => {
                let l = self.epochs.light(work.epoch)?;
                self.light = Some(l.clone());
                l
            }
        };
        let elements = self.epochs.dataset_elements(work.epoch);
        let mut dag = LightDag::new(&light.words);
        Ok(search_hash(
            &mut dag,
            elements,
            &work.header.to_words(),
            nonce,
            &PeriodConstants::for_height(work.height),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TinyEpochs;

    #[test]
    fn keccak_f800_permutes_zero_state() {
        let mut st = [0u32; 25];
        keccak_f800(&mut st);
        assert!(st.iter().any(|&w| w != 0));
        let first = st;
        keccak_f800(&mut st);
        assert_ne!(st, first);
    }

    #[test]
    fn period_constants_are_stable_within_a_period() {
        assert_eq!(PeriodConstants::for_height(120), PeriodConstants::for_height(129));
        assert_ne!(PeriodConstants::for_height(129), PeriodConstants::for_height(130));
        let c = PeriodConstants::for_height(0);
        assert!((1..=31).contains(&c.rot));
    }

    #[test]
    fn light_evaluation_matches_full_dataset() {
        let epochs = TinyEpochs::default();
        let light = epochs.light(0).unwrap();
        let bytes = epochs.dataset_bytes(0);
        let full = build_dataset(&light.words, bytes);
        let elements = epochs.dataset_elements(0);
        let header = H256([7u8; 32]).to_words();
        let period = PeriodConstants::for_height(3);

        for nonce in [0u64, 1, 0xdead_beef_0000_0001] {
            let mut slice: &[u32] = &full;
            let a = search_hash(&mut slice, elements, &header, nonce, &period);
            let mut light_dag = LightDag::new(&light.words);
            let b = search_hash(&mut light_dag, elements, &header, nonce, &period);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn nonce_changes_hash() {
        let epochs = TinyEpochs::default();
        let light = epochs.light(0).unwrap();
        let elements = epochs.dataset_elements(0);
        let header = H256([1u8; 32]).to_words();
        let period = PeriodConstants::for_height(0);
        let mut dag = LightDag::new(&light.words);
        let a = search_hash(&mut dag, elements, &header, 1, &period);
        let b = search_hash(&mut dag, elements, &header, 2, &period);
        assert_ne!(a.value, b.value);
        assert_ne!(a.mix, b.mix);
    }
}
