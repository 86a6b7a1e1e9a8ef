use byteorder::{ByteOrder, LittleEndian};
use xxhash_rust::xxh3::xxh3_128;

/// Builds and probes the per-table filter chunk. Injected at open; the
/// policy name is stored next to the filter so a reader never probes a
/// filter built by a different policy.
pub trait FilterPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serialize a filter covering `keys`.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// False means the key is definitely absent; true means probably
    /// present.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter over user keys using xxh3 double hashing:
/// `h_i(key) = h1 + i * h2 (mod num_bits)` with h1/h2 taken from the two
/// halves of a 128-bit hash.
///
/// Serialized form: `[num_hashes: u32][num_bits: u32][bit words ...]`,
/// little-endian, words packed as u64.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    num_hashes: u32,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // num_hashes = bits_per_key * ln(2), bounded to sane values
        let num_hashes = ((bits_per_key as f64) * 0.69).ceil() as u32;
        Self {
            bits_per_key,
            num_hashes: num_hashes.clamp(1, 30),
        }
    }

    fn hash_halves(key: &[u8]) -> (u64, u64) {
        let h = xxh3_128(key);
        (h as u64, (h >> 64) as u64)
    }

    fn position(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "dlsm.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let num_bits = (keys.len() * self.bits_per_key).max(64) as u64;
        let num_words = num_bits.div_ceil(64) as usize;
        let mut words = vec![0u64; num_words];

        for key in keys {
            let (h1, h2) = Self::hash_halves(key);
            for i in 0..self.num_hashes {
                let pos = Self::position(h1, h2, i, num_bits);
                words[(pos / 64) as usize] |= 1 << (pos % 64);
            }
        }

        let mut buf = Vec::with_capacity(8 + num_words * 8);
        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[..4], self.num_hashes);
        LittleEndian::write_u32(&mut header[4..], num_bits as u32);
        buf.extend_from_slice(&header);
        for word in words {
            let mut w = [0u8; 8];
            LittleEndian::write_u64(&mut w, word);
            buf.extend_from_slice(&w);
        }
        buf
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 8 {
            // Malformed filter: answer conservatively.
            return true;
        }
        let num_hashes = LittleEndian::read_u32(&filter[..4]);
        let num_bits = LittleEndian::read_u32(&filter[4..8]) as u64;
        let words = &filter[8..];
        if num_bits == 0 || (words.len() as u64) * 64 < num_bits {
            return true;
        }

        let (h1, h2) = Self::hash_halves(key);
        for i in 0..num_hashes {
            let pos = Self::position(h1, h2, i, num_bits);
            let word = LittleEndian::read_u64(&words[(pos / 64) as usize * 8..][..8]);
            if word >> (pos % 64) & 1 == 0 {
                return false;
            }
        }
        true
    }
}
