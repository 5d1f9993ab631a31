use super::{seal, verify, PAGE_PREFIX_SIZE};
use crate::error::Result;
use crate::hasher;

/// Upper bound on the bloom page size.
pub const MAX_BLOOM_PAGE_SIZE: usize = 256 * 1024;

/// Probes per key. With 0.6 bytes per key this gives roughly a 10% false
/// positive rate before rounding up the page size.
pub const NUM_HASHES: u64 = 3;

/// Bloom page size for `num_keys`: 0.6 bytes per key rounded up to a power
/// of two KiB, at least one page granularity and at most 256 KiB.
pub fn bloom_page_size(num_keys: u64, granularity: usize) -> usize {
    let bytes = (num_keys as f64 * 0.6).ceil() as usize;
    let size = bytes.div_ceil(1024).next_power_of_two() * 1024;
    size.min(MAX_BLOOM_PAGE_SIZE).max(granularity)
}

/// Bloom filter page. The buffer includes the page prefix, the bit array is
/// everything after it.
#[derive(Debug, Clone)]
pub struct BloomPage {
    buf: Vec<u8>,
}

impl BloomPage {
    pub fn with_size(page_size: usize) -> Self {
        Self {
            buf: vec![0u8; page_size.max(PAGE_PREFIX_SIZE + 1)],
        }
    }

    fn num_bits(&self) -> u64 {
        ((self.buf.len() - PAGE_PREFIX_SIZE) * 8) as u64
    }

    fn probes(&self, key: &[u8]) -> impl Iterator<Item = usize> {
        let (h1, h2) = hasher::key_hashes(key);
        let m = self.num_bits();
        (0..NUM_HASHES).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    pub fn add(&mut self, key: &[u8]) {
        let probes: Vec<usize> = self.probes(key).collect();
        for bit in probes {
            self.buf[PAGE_PREFIX_SIZE + bit / 8] |= 1 << (bit % 8);
        }
    }

    /// False means the key is definitely absent.
    pub fn check(&self, key: &[u8]) -> bool {
        self.probes(key)
            .all(|bit| self.buf[PAGE_PREFIX_SIZE + bit / 8] & (1 << (bit % 8)) != 0)
    }

    pub fn memory_size(&self) -> usize {
        self.buf.len()
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    /// Seals the page for writing.
    pub fn finish(self) -> Result<Vec<u8>> {
        let len = self.buf.len();
        seal(self.buf, len)
    }

    pub fn decode(mut buf: Vec<u8>) -> Result<Self> {
        let size = verify(&buf, "bloom page")?;
        buf.truncate(size);
        Ok(Self { buf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_page_size() {
        assert_eq!(bloom_page_size(0, 4096), 4096);
        assert_eq!(bloom_page_size(1000, 4096), 4096);
        // 0.6 * 10_000 = 6000 bytes -> 8 KiB
        assert_eq!(bloom_page_size(10_000, 4096), 8192);
        assert_eq!(bloom_page_size(10_000_000, 4096), MAX_BLOOM_PAGE_SIZE);
        assert_eq!(bloom_page_size(100, 512), 1024);
    }

    #[test]
    fn test_no_false_negatives() -> Result<()> {
        let num_keys = 5_000u64;
        let mut bloom = BloomPage::with_size(bloom_page_size(num_keys, 512));
        for i in 0..num_keys {
            bloom.add(format!("key-{:08}", i).as_bytes());
        }
        let decoded = BloomPage::decode(bloom.finish()?)?;
        for i in 0..num_keys {
            assert!(decoded.check(format!("key-{:08}", i).as_bytes()));
        }
        Ok(())
    }

    #[test]
    fn test_false_positive_rate() {
        // 3 KiB worth of keys lands exactly on the power of two, the worst case
        let num_keys = (4096.0 / 0.6) as u64;
        let mut bloom = BloomPage::with_size(bloom_page_size(num_keys, 512));
        for i in 0..num_keys {
            bloom.add(format!("member-{}", i).as_bytes());
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let trials = 20_000;
        let false_positives = (0..trials)
            .filter(|_| {
                let probe: u64 = rng.gen();
                bloom.check(format!("other-{}", probe).as_bytes())
            })
            .count();
        let rate = false_positives as f64 / trials as f64;
        assert!(rate < 0.15, "false positive rate {} too high", rate);
    }

    #[test]
    fn test_corrupt_bloom_page() -> Result<()> {
        let mut bloom = BloomPage::with_size(512);
        bloom.add(b"x");
        let mut buf = bloom.finish()?;
        buf[100] ^= 0x01;
        assert!(BloomPage::decode(buf).is_err());
        Ok(())
    }
}
