//! Device kernel sources.
//!
//! A search program is a backend prelude, a generated header block that fixes
//! the per-period constants, and a body shared by CUDA and OpenCL. The body
//! mirrors `progpow::search_hash` and `progpow::dataset_node` step for step.

use std::fmt::Write as _;

use crate::progpow::{
    CNT_DAG, DAG_LOADS, FNV_OFFSET, FNV_PRIME, KECCAK_ROUND_CONSTANTS, LANES, NODE_WORDS,
    PeriodConstants, SEARCH_RESULTS,
};

/// Name of the search entry point in every dialect.
pub const SEARCH_ENTRY: &str = "progpow_search";
pub const DAG_ENTRY: &str = "ethash_calculate_dag";

/// Words per result slot: gid followed by the eight mix words.
pub const RESULT_SLOT_WORDS: usize = 9;
/// Result buffer length: count word plus the slots.
pub const RESULT_WORDS: usize = 1 + SEARCH_RESULTS * RESULT_SLOT_WORDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelDialect {
    Cuda,
    OpenCl,
    /// Evaluated in-process by the host device; the text is informational.
    Host,
}

/// Values substituted into the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHeader {
    pub dag_elements: u32,
    pub period: PeriodConstants,
    pub compute_capability: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct KernelSource {
    pub dialect: KernelDialect,
    pub header: KernelHeader,
    pub entry: &'static str,
    pub text: String,
}

const CUDA_PRELUDE: &str = r#"
typedef unsigned int uint;
typedef unsigned long long ulong;
#define KERNEL_ENTRY extern "C" __global__
#define GLOBAL
#define CONSTANT __constant__
#define DEVICE __device__ __forceinline__
#define GID (blockIdx.x * blockDim.x + threadIdx.x)
#define ATOMIC_INC(p) atomicInc((uint*)&(p), 0xffffffffu)
"#;

const OPENCL_PRELUDE: &str = r#"
#define KERNEL_ENTRY __kernel
#define GLOBAL __global
#define CONSTANT __constant
#define DEVICE inline
#define GID ((uint)get_global_id(0))
#define ATOMIC_INC(p) atomic_inc(&(p))
"#;

const COMMON: &str = r#"
CONSTANT uint keccakf_rotc[24] = {
    1, 3, 6, 10, 15, 21, 28, 36, 45, 55, 2, 14, 27, 41, 56, 8, 25, 43, 62, 18, 39, 61, 20, 44
};
CONSTANT uint keccakf_piln[24] = {
    10, 7, 11, 17, 18, 3, 5, 16, 8, 21, 24, 4, 15, 23, 19, 13, 12, 2, 20, 14, 22, 9, 6, 1
};

DEVICE uint rotl32(uint x, uint n)
{
    return (x << (n & 31)) | (x >> ((32 - n) & 31));
}

DEVICE uint fnv1a(uint h, uint d)
{
    return (h ^ d) * FNV_PRIME;
}

DEVICE void keccak_f800(uint* st)
{
    uint bc[5];
    for (int r = 0; r < 22; r++) {
        for (int i = 0; i < 5; i++)
            bc[i] = st[i] ^ st[i + 5] ^ st[i + 10] ^ st[i + 15] ^ st[i + 20];
        for (int i = 0; i < 5; i++) {
            uint t = bc[(i + 4) % 5] ^ rotl32(bc[(i + 1) % 5], 1);
            for (int j = 0; j < 25; j += 5)
                st[j + i] ^= t;
        }
        uint t = st[1];
        for (int i = 0; i < 24; i++) {
            uint j = keccakf_piln[i];
            uint tmp = st[j];
            st[j] = rotl32(t, keccakf_rotc[i] % 32);
            t = tmp;
        }
        for (int j = 0; j < 25; j += 5) {
            for (int i = 0; i < 5; i++)
                bc[i] = st[j + i];
            for (int i = 0; i < 5; i++)
                st[j + i] ^= (~bc[(i + 1) % 5]) & bc[(i + 2) % 5];
        }
        st[0] ^= keccakf_rndc[r];
    }
}
"#;

const SEARCH_BODY: &str = r#"
KERNEL_ENTRY void progpow_search(
    ulong start_nonce,
    ulong target,
    GLOBAL const uint* header,
    GLOBAL const uint* dag,
    GLOBAL uint* results)
{
    uint gid = GID;
    ulong nonce = start_nonce + gid;

    uint st[25];
    for (int i = 0; i < 25; i++)
        st[i] = 0;
    for (int i = 0; i < 8; i++)
        st[i] = header[i];
    st[8] = (uint)nonce;
    st[9] = (uint)(nonce >> 32);
    keccak_f800(st);
    uint seed_lo = st[0];
    uint seed_hi = st[1];

    uint mix[LANES];
    for (uint l = 0; l < LANES; l++)
        mix[l] = fnv1a(fnv1a(FNV_OFFSET ^ PROGPOW_MIX_XOR, seed_lo ^ l), seed_hi);

    for (uint i = 0; i < CNT_DAG; i++) {
        uint offset = (mix[i % LANES] ^ PROGPOW_MIX_XOR) % PROGPOW_DAG_ELEMENTS;
        for (uint l = 0; l < LANES; l++) {
            uint src = (l ^ (i % LANES)) % LANES;
            for (uint j = 0; j < DAG_LOADS; j++) {
                uint w = dag[((ulong)offset * LANES + src) * DAG_LOADS + j];
                mix[l] = rotl32(fnv1a(mix[l], w), PROGPOW_MIX_ROT);
            }
        }
    }

    uint digest[8];
    for (int k = 0; k < 8; k++)
        digest[k] = fnv1a(fnv1a(FNV_OFFSET, mix[2 * k]), mix[2 * k + 1]);

    for (int i = 0; i < 25; i++)
        st[i] = 0;
    for (int i = 0; i < 8; i++)
        st[i] = header[i];
    st[8] = seed_lo;
    st[9] = seed_hi;
    for (int k = 0; k < 8; k++)
        st[10 + k] = digest[k];
    keccak_f800(st);

    ulong upper = ((ulong)st[0] << 32) | (ulong)st[1];
    if (upper > target)
        return;
    uint slot = ATOMIC_INC(results[0]);
    if (slot >= SEARCH_RESULTS)
        return;
    results[1 + slot * 9] = gid;
    for (int k = 0; k < 8; k++)
        results[2 + slot * 9 + k] = digest[k];
}
"#;

const DAG_BODY: &str = r#"
KERNEL_ENTRY void ethash_calculate_dag(
    uint start,
    GLOBAL const uint* light,
    uint light_nodes,
    GLOBAL uint* dag,
    uint dag_nodes)
{
    uint index = start + GID;
    if (index >= dag_nodes)
        return;

    uint st[25];
    uint base = (index % light_nodes) * NODE_WORDS;
    for (int i = 0; i < 25; i++)
        st[i] = 0;
    for (int i = 0; i < NODE_WORDS; i++)
        st[i] = light[base + i];
    st[0] ^= index;
    keccak_f800(st);

    uint mix[NODE_WORDS];
    for (int i = 0; i < NODE_WORDS; i++)
        mix[i] = st[i];
    for (uint p = 0; p < DATASET_PARENTS; p++) {
        uint parent = fnv1a(index ^ p, mix[p % NODE_WORDS]) % light_nodes;
        for (int k = 0; k < NODE_WORDS; k++)
            mix[k] = fnv1a(mix[k], light[parent * NODE_WORDS + k]);
    }

    for (int i = 0; i < 25; i++)
        st[i] = 0;
    for (int i = 0; i < NODE_WORDS; i++)
        st[i] = mix[i];
    keccak_f800(st);
    for (int i = 0; i < NODE_WORDS; i++)
        dag[(ulong)index * NODE_WORDS + i] = st[i];
}
"#;

fn prelude(dialect: KernelDialect) -> &'static str {
    match dialect {
        KernelDialect::Cuda => CUDA_PRELUDE,
        KernelDialect::OpenCl | KernelDialect::Host => OPENCL_PRELUDE,
    }
}

/// Constants shared by both kernels.
fn constants_block() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#define FNV_PRIME 0x{FNV_PRIME:08x}u");
    let _ = writeln!(out, "#define FNV_OFFSET 0x{FNV_OFFSET:08x}u");
    let _ = writeln!(out, "#define LANES {LANES}");
    let _ = writeln!(out, "#define DAG_LOADS {DAG_LOADS}");
    let _ = writeln!(out, "#define CNT_DAG {CNT_DAG}");
    let _ = writeln!(out, "#define NODE_WORDS {NODE_WORDS}");
    let _ = writeln!(out, "#define DATASET_PARENTS {}", crate::progpow::DATASET_PARENTS);
    let _ = writeln!(out, "#define SEARCH_RESULTS {SEARCH_RESULTS}");
    let rc: Vec<String> = KECCAK_ROUND_CONSTANTS.iter().map(|c| format!("0x{c:08x}u")).collect();
    let _ = writeln!(out, "CONSTANT uint keccakf_rndc[22] = {{ {} }};", rc.join(", "));
    out
}

/// The generated per-period header block.
pub fn header_block(header: &KernelHeader) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#define PROGPOW_DAG_ELEMENTS {}u", header.dag_elements);
    let _ = writeln!(out, "#define PROGPOW_PERIOD_SEED {}ull", header.period.seed);
    let _ = writeln!(out, "#define PROGPOW_MIX_ROT {}u", header.period.rot);
    let _ = writeln!(out, "#define PROGPOW_MIX_XOR 0x{:08x}u", header.period.xor);
    let cc = header.compute_capability.map(|(major, minor)| major * 10 + minor).unwrap_or(0);
    let _ = writeln!(out, "#define COMPUTE_CAPABILITY {cc}");
    out
}

pub fn search_source(dialect: KernelDialect, header: KernelHeader) -> KernelSource {
    let mut text = String::from(prelude(dialect));
    text.push_str(&constants_block());
    text.push_str(&header_block(&header));
    text.push_str(COMMON);
    text.push_str(SEARCH_BODY);
    KernelSource { dialect, header, entry: SEARCH_ENTRY, text }
}

/// Dataset generation program; independent of the period.
pub fn dag_source(dialect: KernelDialect) -> String {
    let mut text = String::from(prelude(dialect));
    text.push_str(&constants_block());
    text.push_str(COMMON);
    text.push_str(DAG_BODY);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> KernelHeader {
        KernelHeader {
            dag_elements: 4096,
            period: PeriodConstants::for_height(1234),
            compute_capability: Some((8, 6)),
        }
    }

    #[test]
    fn search_source_carries_header_values() {
        let src = search_source(KernelDialect::Cuda, header());
        assert_eq!(src.entry, "progpow_search");
        assert!(src.text.contains("#define PROGPOW_DAG_ELEMENTS 4096u"));
        assert!(src.text.contains("#define PROGPOW_PERIOD_SEED 123ull"));
        assert!(src.text.contains("#define COMPUTE_CAPABILITY 86"));
        assert!(src.text.contains("extern \"C\" __global__"));
        assert!(src.text.contains("KERNEL_ENTRY void progpow_search("));
    }

    #[test]
    fn opencl_prelude_has_no_cuda_qualifiers() {
        let src = search_source(KernelDialect::OpenCl, header());
        assert!(!src.text.contains("__global__"));
        assert!(src.text.contains("#define KERNEL_ENTRY __kernel"));
    }

    #[test]
    fn dag_source_has_no_period_constants() {
        let text = dag_source(KernelDialect::OpenCl);
        assert!(text.contains(DAG_ENTRY));
        assert!(!text.contains("PROGPOW_MIX_ROT "));
        assert!(text.contains("#define DATASET_PARENTS 64"));
    }
}
