use std::collections::HashMap;
use std::default::Default;
use std::hash::{BuildHasherDefault, Hasher};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use fnv::FnvHasher;

/// Secret triplet mixed into every rapidhash round.
pub const SECRET: [u64; 3] = [
    0x9E37_79B9_7F4A_7C15,
    0xD6E8_FEB8_6659_FD93,
    0xCA9B_0C7E_BA1D_A115,
];

const DEFAULT_SEED: u64 = 0xbdd8_9aa9_8270_4029;

#[derive(Debug, Clone)]
pub struct RapidHasher(u64);
impl Default for RapidHasher {
    #[inline]
    fn default() -> RapidHasher {
        RapidHasher(DEFAULT_SEED)
    }
}

impl RapidHasher {
    /// Create a hasher whose state starts at `seed`.
    #[inline]
    pub fn with_seed(seed: u64) -> RapidHasher {
        RapidHasher(seed)
    }
}

impl Hasher for RapidHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }

    #[inline(always)]
    fn write(&mut self, bytes: &[u8]) {
        self.0 = rapidhash(bytes, self.0);
    }

    #[inline]
    fn write_u32(&mut self, i: u32) {
        self.0 = hash_fixed(u64::from(i), self.0);
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        self.0 = hash_fixed(i, self.0);
    }

    #[inline]
    fn write_usize(&mut self, i: usize) {
        self.0 = hash_fixed(i as u64, self.0);
    }
}

/// A builder for default rapidhash hashers.
pub type RapidBuildHasher = BuildHasherDefault<RapidHasher>;

/// A `HashMap` using a default rapidhash hasher.
pub type RapidHashMap<K, V> = HashMap<K, V, RapidBuildHasher>;

/// 64-bit avalanche finalizer (murmur3 fmix64).
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

/// Hash for keys of at most 8 bytes, packed little endian into a `u64`.
#[inline]
pub fn hash_fixed(key: u64, seed: u64) -> u64 {
    mix64(key ^ seed)
}

/// Hash for variable length keys.
#[inline]
pub fn hash_bytes(bytes: &[u8], seed: u64) -> u64 {
    rapidhash(bytes, seed)
}

/// Seed for a new map: wall clock, pid and a process-local counter folded through FNV.
pub fn generate_seed() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0);
    let mut hasher = FnvHasher::default();
    hasher.write_u64(nanos);
    hasher.write_u32(process::id());
    hasher.write_u64(COUNTER.fetch_add(1, Ordering::Relaxed));
    mix64(hasher.finish())
}

#[inline]
fn rapid_mum(a: u64, b: u64) -> (u64, u64) {
    let r = u128::from(a) * u128::from(b);
    (r as u64, (r >> 64) as u64)
}

#[inline]
fn rapid_mix(a: u64, b: u64) -> u64 {
    let (lo, hi) = rapid_mum(a, b);
    lo ^ hi
}

#[inline]
fn read64(p: &[u8]) -> u64 {
    LittleEndian::read_u64(p)
}

#[inline]
fn read32(p: &[u8]) -> u64 {
    u64::from(LittleEndian::read_u32(p))
}

/// Combines three bytes of a 1..=3 byte input, touching every position at least once.
#[inline]
fn read_small(p: &[u8]) -> u64 {
    let k = p.len();
    (u64::from(p[0]) << 56) | (u64::from(p[k >> 1]) << 32) | u64::from(p[k - 1])
}

#[inline(always)]
pub fn rapidhash(bytes: &[u8], seed: u64) -> u64 {
    rapidhash_with_secret(bytes, seed, &SECRET)
}

/// rapidhash (wyhash family) over `bytes`, producing a 64-bit digest.
pub fn rapidhash_with_secret(bytes: &[u8], seed: u64, secret: &[u64; 3]) -> u64 {
    let len = bytes.len();
    let mut seed = seed ^ rapid_mix(seed ^ secret[0], secret[1]) ^ len as u64;
    let mut a: u64;
    let mut b: u64;
    if len <= 16 {
        if len >= 4 {
            let last = len - 4;
            a = (read32(bytes) << 32) | read32(&bytes[last..]);
            let delta = (len & 24) >> (len >> 3);
            b = (read32(&bytes[delta..]) << 32) | read32(&bytes[last - delta..]);
        } else if len > 0 {
            a = read_small(bytes);
            b = 0;
        } else {
            a = 0;
            b = 0;
        }
    } else {
        let mut p = bytes;
        if p.len() > 48 {
            let mut see1 = seed;
            let mut see2 = seed;
            while p.len() >= 96 {
                unroll! {
                    for lane in 0..2 {
                        let q = &p[lane * 48..];
                        seed = rapid_mix(read64(q) ^ secret[0], read64(&q[8..]) ^ seed);
                        see1 = rapid_mix(read64(&q[16..]) ^ secret[1], read64(&q[24..]) ^ see1);
                        see2 = rapid_mix(read64(&q[32..]) ^ secret[2], read64(&q[40..]) ^ see2);
                    }
                }
                p = &p[96..];
            }
            if p.len() >= 48 {
                seed = rapid_mix(read64(p) ^ secret[0], read64(&p[8..]) ^ seed);
                see1 = rapid_mix(read64(&p[16..]) ^ secret[1], read64(&p[24..]) ^ see1);
                see2 = rapid_mix(read64(&p[32..]) ^ secret[2], read64(&p[40..]) ^ see2);
                p = &p[48..];
            }
            seed ^= see1 ^ see2;
        }
        if p.len() > 16 {
            seed = rapid_mix(read64(p) ^ secret[2], read64(&p[8..]) ^ seed ^ secret[1]);
            if p.len() > 32 {
                seed = rapid_mix(read64(&p[16..]) ^ secret[2], read64(&p[24..]) ^ seed);
            }
        }
        // the tail may overlap bytes already consumed by the bulk rounds
        a = read64(&bytes[len - 16..]);
        b = read64(&bytes[len - 8..]);
    }
    a ^= secret[1];
    b ^= seed;
    let (lo, hi) = rapid_mum(a, b);
    a = lo;
    b = hi;
    rapid_mix(a ^ secret[0] ^ len as u64, b ^ secret[1])
}
