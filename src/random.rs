//! Random Number Generation
//!
//! RC4-based pseudo-random number generator. The first use seeds it with 256
//! bytes from the default backend's randomness probe; temp file names and
//! tests draw from it.

use parking_lot::Mutex;

use crate::os::vfs::vfs_find;

// ============================================================================
// PRNG State
// ============================================================================

/// Pseudo-random number generator state (RC4-based)
pub struct Prng {
    s: [u8; 256],
    i: u8,
    j: u8,
    is_init: bool,
}

impl Default for Prng {
    fn default() -> Self {
        Self::new()
    }
}

impl Prng {
    /// Create new uninitialized PRNG
    pub const fn new() -> Self {
        Self {
            s: [0; 256],
            i: 0,
            j: 0,
            is_init: false,
        }
    }

    /// Seed with the given key; an empty key falls back to [`Prng::auto_seed`]
    pub fn seed(&mut self, key: &[u8]) {
        if key.is_empty() {
            self.auto_seed();
            return;
        }

        for i in 0..256 {
            self.s[i] = i as u8;
        }

        // Key scheduling algorithm (KSA)
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(self.s[i]).wrapping_add(key[i % key.len()]);
            self.s.swap(i, j as usize);
        }

        self.i = 0;
        self.j = 0;
        self.is_init = true;

        // Drop the first 256 bytes of keystream
        let mut discard = [0u8; 256];
        self.fill_internal(&mut discard);
    }

    /// Seed from the default backend, or from the clock when none is registered
    pub fn auto_seed(&mut self) {
        let mut key = [0u8; 256];

        let got = match vfs_find(None) {
            Some(vfs) => vfs.randomness(&mut key),
            None => 0,
        };

        if got < key.len() {
            let now = chrono::Utc::now();
            let nanos = now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes();
            for (i, &b) in nanos.iter().enumerate() {
                key[i] ^= b;
            }

            let pid = std::process::id().to_le_bytes();
            for (i, &b) in pid.iter().enumerate() {
                key[128 + i] ^= b;
            }

            let thread_id = format!("{:?}", std::thread::current().id());
            for (i, b) in thread_id.bytes().take(100).enumerate() {
                key[140 + i] ^= b;
            }
        }

        self.seed(&key);
    }

    /// Pseudo-random generation algorithm (PRGA)
    fn fill_internal(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k =
                self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *byte = k;
        }
    }

    /// Generate random bytes
    pub fn fill(&mut self, buf: &mut [u8]) {
        if !self.is_init {
            self.auto_seed();
        }
        self.fill_internal(buf);
    }

    /// Generate a random i64
    pub fn next_i64(&mut self) -> i64 {
        let mut buf = [0u8; 8];
        self.fill(&mut buf);
        i64::from_le_bytes(buf)
    }

    /// Check if initialized
    pub fn is_initialized(&self) -> bool {
        self.is_init
    }

    /// Forget the key; the next draw reseeds
    pub fn reset(&mut self) {
        self.is_init = false;
    }
}

// ============================================================================
// Global PRNG Instance
// ============================================================================

lazy_static::lazy_static! {
    static ref GLOBAL_PRNG: Mutex<Prng> = Mutex::new(Prng::new());
}

/// Fill `buf` from the process-wide generator
pub fn randomness(buf: &mut [u8]) -> usize {
    GLOBAL_PRNG.lock().fill(buf);
    buf.len()
}

/// Draw one i64 from the process-wide generator
pub fn random_i64() -> i64 {
    GLOBAL_PRNG.lock().next_i64()
}

/// Reseed the process-wide generator with a fixed key
pub fn seed(key: &[u8]) {
    GLOBAL_PRNG.lock().seed(key);
}

/// Make the process-wide generator reseed itself on next use
pub fn reset() {
    GLOBAL_PRNG.lock().reset();
}

/// `prefix` + 32 hex digits + `suffix`
pub fn temp_filename(prefix: &str, suffix: &str) -> String {
    let mut random_part = [0u8; 16];
    randomness(&mut random_part);
    format!("{}{}{}", prefix, hex::encode(random_part), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prng_new() {
        let prng = Prng::new();
        assert!(!prng.is_initialized());
    }

    #[test]
    fn test_prng_fill_auto_seeds() {
        let mut prng = Prng::new();
        let mut buf = [0u8; 32];
        prng.fill(&mut buf);
        assert!(prng.is_initialized());
    }

    #[test]
    fn test_prng_reproducible() {
        let key = b"fixed key";

        let mut a = Prng::new();
        a.seed(key);
        let mut b = Prng::new();
        b.seed(key);

        assert_eq!(a.next_i64(), b.next_i64());
        assert_eq!(a.next_i64(), b.next_i64());
    }

    #[test]
    fn test_prng_different_keys() {
        let mut a = Prng::new();
        a.seed(b"key one");
        let mut b = Prng::new();
        b.seed(b"key two");
        assert_ne!(a.next_i64(), b.next_i64());
    }

    #[test]
    fn test_prng_reset_reseeds() {
        let mut prng = Prng::new();
        prng.seed(b"k");
        prng.reset();
        assert!(!prng.is_initialized());
        prng.next_i64();
        assert!(prng.is_initialized());
    }

    #[test]
    fn test_global_randomness() {
        let mut buf = [0u8; 50];
        assert_eq!(randomness(&mut buf), 50);
        assert!(buf.iter().any(|&b| b != 0));
        assert_ne!(random_i64(), random_i64());
    }

    #[test]
    fn test_temp_filename_shape() {
        let name = temp_filename("tinyvfs_", ".tmp");
        assert!(name.starts_with("tinyvfs_"));
        assert!(name.ends_with(".tmp"));
        assert_eq!(name.len(), "tinyvfs_".len() + 32 + ".tmp".len());
        assert_ne!(name, temp_filename("tinyvfs_", ".tmp"));
    }
}
