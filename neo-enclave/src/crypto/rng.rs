//! Enclave-internal deterministic random bit generator

use crate::error::{TeeError, TeeResult};
use crate::platform::Platform;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use zeroize::Zeroizing;

/// ChaCha20 DRBG seeded once from platform entropy.
///
/// Host-side randomness is never consulted after seeding.
pub struct EnclaveRng {
    inner: Mutex<ChaCha20Rng>,
}

impl EnclaveRng {
    pub fn from_platform(platform: &dyn Platform) -> TeeResult<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        platform.fill_entropy(&mut seed[..])?;
        Ok(Self::from_seed(*seed))
    }

    pub(crate) fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            inner: Mutex::new(ChaCha20Rng::from_seed(seed)),
        }
    }

    pub fn fill(&self, dest: &mut [u8]) {
        self.inner.lock().fill_bytes(dest);
    }

    pub fn array<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        self.fill(&mut out);
        out
    }

    /// `len` fresh bytes. Zero length is rejected; allocation failure is
    /// reported rather than aborting.
    pub fn random_bytes(&self, len: usize) -> TeeResult<Vec<u8>> {
        if len == 0 {
            return Err(TeeError::InvalidParameter(
                "random length must be non-zero".to_string(),
            ));
        }

        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|e| {
            TeeError::OutOfMemory(format!("cannot allocate {} random bytes: {}", len, e))
        })?;
        out.resize(len, 0);
        self.fill(&mut out);
        Ok(out)
    }

    /// Run `f` with exclusive access to the generator
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha20Rng) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
