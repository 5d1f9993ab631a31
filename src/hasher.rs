use crc::{Crc, CRC_32_ISCSI, CRC_64_ECMA_182};

/// Checksum used by pages, log sections and the TOC.
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Second, independent hash used for bloom filter double hashing.
pub static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Returns the two base hashes for Kirsch-Mitzenmacker double hashing.
/// The second hash is forced odd so probe sequences never collapse.
pub fn key_hashes(key: &[u8]) -> (u64, u64) {
    let h1 = mix(CRC64.checksum(key));
    let h2 = mix(u64::from(CRC32.checksum(key)) ^ 0x9e37_79b9_7f4a_7c15) | 1;
    (h1, h2)
}

/// splitmix64 finalizer; CRCs are linear so similar keys need extra diffusion.
fn mix(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}
