//! Bloom filter for skipping SSTables that cannot contain a key.
//!
//! A bloom filter answers "definitely not present" with certainty and
//! "possibly present" with a tunable false-positive rate. Every SSTable
//! embeds one built over its keys at publication; point lookups consult it
//! before touching the index or any data block.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// Upper bound on the serialized bit array, to reject garbage lengths
/// before allocating.
const MAX_FILTER_BYTES: usize = 128 * 1024 * 1024;

/// A bloom filter backed by a bit vector and `k` seeded FNV-1a probes.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    /// Number of bits (m).
    num_bits: u64,
    /// Number of hash probes (k).
    num_hashes: u32,
    /// Target false-positive rate the filter was sized for.
    fpr: f64,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_items` keys at the given target
    /// false-positive rate: `m = ceil(-n ln p / (ln 2)^2)` bits and
    /// `k = max(1, round(m ln 2 / n))` probes.
    pub fn new(expected_items: usize, fpr: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fpr.clamp(1e-9, 0.999);

        let m = (-n * p.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(8);
        let k = ((m as f64 * std::f64::consts::LN_2 / n).round() as u32).max(1);

        let byte_len = m.div_ceil(8) as usize;
        Self {
            bits: vec![0u8; byte_len],
            num_bits: m,
            num_hashes: k,
            fpr: p,
        }
    }

    /// Inserts a key.
    pub fn insert(&mut self, key: &[u8]) {
        for seed in 0..self.num_hashes {
            let idx = fnv1a_seeded(key, seed) % self.num_bits;
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// Returns true if the key might be present, false if it definitely is
    /// not. Never returns false for an inserted key.
    pub fn contains(&self, key: &[u8]) -> bool {
        for seed in 0..self.num_hashes {
            let idx = fnv1a_seeded(key, seed) % self.num_bits;
            if self.bits[(idx / 8) as usize] & (1 << (idx % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Serialized size in bytes: `m(u64) + k(u32) + p(f64) + len(u32) + bits`.
    pub fn encoded_len(&self) -> usize {
        8 + 4 + 8 + 4 + self.bits.len()
    }

    /// Appends the wire form to `buf`, little-endian:
    ///
    /// ```text
    /// [m: u64][k: u32][p: f64][byte_length: u32][bits]
    /// ```
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<LittleEndian>(self.num_bits).expect("vec write");
        buf.write_u32::<LittleEndian>(self.num_hashes).expect("vec write");
        buf.write_f64::<LittleEndian>(self.fpr).expect("vec write");
        buf.write_u32::<LittleEndian>(self.bits.len() as u32)
            .expect("vec write");
        buf.extend_from_slice(&self.bits);
    }

    /// Decodes a filter, validating that the bit array length matches the
    /// declared geometry.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let num_bits = data.read_u64::<LittleEndian>()?;
        let num_hashes = data.read_u32::<LittleEndian>()?;
        let fpr = data.read_f64::<LittleEndian>()?;
        let byte_len = data.read_u32::<LittleEndian>()? as usize;

        if byte_len > MAX_FILTER_BYTES {
            return Err(Error::InvalidData(format!(
                "bloom filter too large: {byte_len} bytes"
            )));
        }
        if byte_len as u64 != num_bits.div_ceil(8) {
            return Err(Error::InvalidData(format!(
                "bloom filter geometry mismatch: {num_bits} bits in {byte_len} bytes"
            )));
        }
        if num_hashes == 0 || num_bits == 0 {
            return Err(Error::InvalidData(
                "bloom filter with zero bits or hashes".to_string(),
            ));
        }
        if data.len() < byte_len {
            return Err(Error::InvalidData(
                "bloom filter bit array truncated".to_string(),
            ));
        }

        Ok(Self {
            bits: data[..byte_len].to_vec(),
            num_bits,
            num_hashes,
            fpr,
        })
    }
}

/// 32-bit FNV-1a with the offset basis XOR'd by the probe seed, so each of
/// the `k` probes behaves as an independent hash.
fn fnv1a_seeded(data: &[u8], seed: u32) -> u64 {
    let mut hash = FNV_OFFSET ^ seed;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as u64
}
