//! Random value generation backed by the OS entropy source.

use ring::rand::{SecureRandom, SystemRandom};

/// A thin wrapper around [`ring::rand::SystemRandom`], our sole entropy
/// source. Construction is cheap; ring lazily initializes shared state.
#[derive(Clone, Debug)]
pub struct SysRng(SystemRandom);

impl SysRng {
    pub fn new() -> Self {
        Self(SystemRandom::new())
    }

    /// Fill a fixed-size array with random bytes.
    pub fn gen_bytes<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        self.0
            .fill(&mut out)
            .expect("ring SystemRandom failed to fill");
        out
    }

    /// Generate `N` random bytes and hex-encode them, e.g. for OAuth CSRF
    /// state values.
    pub fn gen_hex<const N: usize>(&self) -> String {
        hex::encode(self.gen_bytes::<N>())
    }
}

impl Default for SysRng {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gen_hex_length_and_charset() {
        let rng = SysRng::new();
        let state = rng.gen_hex::<32>();
        assert_eq!(state.len(), 64);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn gen_bytes_not_constant() {
        let rng = SysRng::new();
        let a: [u8; 32] = rng.gen_bytes();
        let b: [u8; 32] = rng.gen_bytes();
        assert_ne!(a, b);
    }
}
