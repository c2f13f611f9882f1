use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use primitive_types::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::progpow::PERIOD;

/// Difficulties at or below this value are clamped to it.
pub const MIN_DIFFICULTY: f64 = 0.0001;

/// 256-bit value stored big-endian, so byte order is numeric order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct H256(pub [u8; 32]);

impl H256 {
    pub const MAX: H256 = H256([0xff; 32]);

    pub fn zero() -> Self {
        H256([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse 64 hex digits, with or without a `0x` prefix. Shorter input is
    /// left-padded with zeros.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.len() > 64 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let padded = format!("{:0>64}", digits);
        let mut out = [0u8; 32];
        hex::decode_to_slice(padded, &mut out)?;
        Ok(H256(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Eight big-endian words, the layout the search kernels consume.
    pub fn to_words(&self) -> [u32; 8] {
        let mut words = [0u32; 8];
        for (i, chunk) in self.0.chunks_exact(4).enumerate() {
            words[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }

    pub fn from_words(words: &[u32; 8]) -> Self {
        let mut out = [0u8; 32];
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
        }
        H256(out)
    }

    /// Most significant 64 bits; the device-side target comparison.
    pub fn upper_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(b)
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl FromStr for H256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        H256::from_hex(s)
    }
}

impl Serialize for H256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        H256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One job as handed from the pool session to the engines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkPackage {
    pub header: H256,
    pub seed: H256,
    pub epoch: u32,
    pub boundary: H256,
    pub height: u64,
    /// Job id as received; padded to 64 hex digits under the extended dialect.
    pub job: String,
    /// Number of significant hex digits in `job` for the extended dialect.
    pub job_len: usize,
    pub start_nonce: u64,
    /// Extranonce width in bits, when the pool assigned one.
    pub ex_size_bits: Option<u32>,
    /// Stamped by the farm on publication.
    pub generation: u64,
}

impl WorkPackage {
    pub fn is_valid(&self) -> bool {
        !self.header.is_zero()
    }

    pub fn period(&self) -> u64 {
        self.height / PERIOD
    }

    /// True when `other` can continue on the same dataset, kernel and header.
    pub fn same_work(&self, other: &WorkPackage) -> bool {
        self.header == other.header && self.epoch == other.epoch && self.period() == other.period()
    }
}

/// A candidate nonce found by an engine.
#[derive(Debug, Clone)]
pub struct Solution {
    pub nonce: u64,
    pub mix_hash: H256,
    pub work: Arc<WorkPackage>,
    pub stale: bool,
    /// Generation of the work the producing launch was started with.
    pub generation: u64,
}

/// Convert a pool difficulty to a boundary: `0xFFFF0000 * 2^224 / d`.
pub fn difficulty_to_boundary(difficulty: f64) -> H256 {
    let d = if difficulty.is_finite() && difficulty > MIN_DIFFICULTY {
        difficulty
    } else {
        MIN_DIFFICULTY
    };

    const TWO_32: f64 = 4294967296.0;
    // The quotient divided by 2^224.
    let q = 4294901760.0 / d;
    if q >= TWO_32 {
        return H256::MAX;
    }

    // Keep at least 32 significant bits: value = floor(x) * 2^shift.
    let mut x = q * TWO_32;
    let mut shift: usize = 192;
    while x < TWO_32 && shift >= 32 {
        x *= TWO_32;
        shift -= 32;
    }

    let value = U256::from(x as u64) << shift;
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    H256(out)
}
