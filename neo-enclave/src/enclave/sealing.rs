//! Sealing of data to the enclave signer identity
//!
//! Sealed blob layout (little-endian):
//!
//! ```text
//! version:u8 | policy:u8 | key_version:u16 | key_id:[u8;32] | nonce:[u8;12]
//! | aad_len:u32 | ciphertext_len:u32 | aad | ciphertext | tag:[u8;16]
//! ```
//!
//! Each blob gets a fresh `key_id`, so every blob is encrypted under its own
//! AES-256-GCM key derived by the platform from the signer identity. The
//! header and the caller AAD are both authenticated.

use crate::config::SealingConfig;
use crate::crypto::EnclaveRng;
use crate::error::{TeeError, TeeResult};
use crate::platform::{KeyRequest, Platform};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::{Zeroize, Zeroizing};

/// Current sealed blob format version
pub const SEAL_FORMAT_VERSION: u8 = 1;

/// Key policy: bound to the signer identity
pub const SEAL_POLICY_SIGNER: u8 = 1;

/// Size of the fixed blob header
pub const SEALED_HEADER_SIZE: usize = 1 + 1 + 2 + 32 + NONCE_SIZE + 4 + 4;

/// Bytes a sealed blob adds on top of plaintext and AAD
pub const SEALED_OVERHEAD: usize = SEALED_HEADER_SIZE + TAG_SIZE;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Exact size `seal` produces for the given input lengths
pub const fn calc_sealed_size(plaintext_len: usize, aad_len: usize) -> usize {
    SEALED_OVERHEAD
        .saturating_add(plaintext_len)
        .saturating_add(aad_len)
}

/// Plaintext length of a sealed blob, read from its header
pub fn unsealed_len(sealed: &[u8]) -> TeeResult<usize> {
    SealedHeader::parse(sealed).map(|header| header.ciphertext_len)
}

#[derive(Debug, Clone, Copy)]
struct SealedHeader {
    key_version: u16,
    key_id: [u8; 32],
    nonce: [u8; NONCE_SIZE],
    aad_len: usize,
    ciphertext_len: usize,
}

impl SealedHeader {
    fn encode(&self) -> [u8; SEALED_HEADER_SIZE] {
        let mut out = [0u8; SEALED_HEADER_SIZE];
        out[0] = SEAL_FORMAT_VERSION;
        out[1] = SEAL_POLICY_SIGNER;
        out[2..4].copy_from_slice(&self.key_version.to_le_bytes());
        out[4..36].copy_from_slice(&self.key_id);
        out[36..48].copy_from_slice(&self.nonce);
        // lengths are checked against u32::MAX before a header is built
        out[48..52].copy_from_slice(&(self.aad_len as u32).to_le_bytes());
        out[52..56].copy_from_slice(&(self.ciphertext_len as u32).to_le_bytes());
        out
    }

    fn parse(sealed: &[u8]) -> TeeResult<Self> {
        if sealed.len() < SEALED_OVERHEAD {
            return Err(TeeError::MalformedSealedData(format!(
                "sealed blob is {} bytes, minimum is {}",
                sealed.len(),
                SEALED_OVERHEAD
            )));
        }
        if sealed[0] != SEAL_FORMAT_VERSION {
            return Err(TeeError::MalformedSealedData(format!(
                "unsupported format version {}",
                sealed[0]
            )));
        }
        if sealed[1] != SEAL_POLICY_SIGNER {
            return Err(TeeError::MalformedSealedData(format!(
                "unsupported key policy {}",
                sealed[1]
            )));
        }

        let key_version = u16::from_le_bytes([sealed[2], sealed[3]]);
        if key_version == 0 {
            return Err(TeeError::MalformedSealedData(
                "key version 0 is invalid".to_string(),
            ));
        }

        let mut key_id = [0u8; 32];
        key_id.copy_from_slice(&sealed[4..36]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&sealed[36..48]);
        let aad_len = read_u32(&sealed[48..52]) as usize;
        let ciphertext_len = read_u32(&sealed[52..56]) as usize;

        let expected = SEALED_OVERHEAD
            .checked_add(aad_len)
            .and_then(|n| n.checked_add(ciphertext_len));
        if expected != Some(sealed.len()) {
            return Err(TeeError::MalformedSealedData(format!(
                "length fields (aad {}, ciphertext {}) do not match blob size {}",
                aad_len,
                ciphertext_len,
                sealed.len()
            )));
        }

        Ok(Self {
            key_version,
            key_id,
            nonce,
            aad_len,
            ciphertext_len,
        })
    }

    fn request(&self) -> KeyRequest {
        KeyRequest {
            key_id: self.key_id,
            key_version: self.key_version,
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Result of unsealing
pub struct UnsealedData {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub aad: Vec<u8>,
}

impl std::fmt::Debug for UnsealedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsealedData")
            .field("plaintext_len", &self.plaintext.len())
            .field("aad_len", &self.aad.len())
            .finish()
    }
}

/// Seals and unseals data under keys bound to the enclave signer identity
pub struct SealingService {
    platform: Arc<dyn Platform>,
    rng: Arc<EnclaveRng>,
    key_version: u16,
}

impl SealingService {
    pub fn new(platform: Arc<dyn Platform>, rng: Arc<EnclaveRng>, config: &SealingConfig) -> Self {
        Self {
            platform,
            rng,
            key_version: config.key_version,
        }
    }

    /// Seal `plaintext`, binding `aad` as authenticated context
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> TeeResult<Vec<u8>> {
        let mut out = vec![0u8; calc_sealed_size(plaintext.len(), aad.len())];
        let written = self.seal_into(plaintext, aad, &mut out)?;
        out.truncate(written);
        Ok(out)
    }

    /// Seal into a caller buffer, returning the bytes written.
    ///
    /// A short buffer fails with `BufferTooSmall` before any work is done.
    #[instrument(skip_all, fields(plaintext_len = plaintext.len(), aad_len = aad.len()))]
    pub fn seal_into(&self, plaintext: &[u8], aad: &[u8], out: &mut [u8]) -> TeeResult<usize> {
        if u32::try_from(plaintext.len()).is_err() || u32::try_from(aad.len()).is_err() {
            return Err(TeeError::InvalidParameter(
                "plaintext and aad must each fit in 32 bits".to_string(),
            ));
        }

        let required = calc_sealed_size(plaintext.len(), aad.len());
        if out.len() < required {
            return Err(TeeError::buffer_too_small(required, out.len()));
        }

        let header = SealedHeader {
            key_version: self.key_version,
            key_id: self.rng.array(),
            nonce: self.rng.array(),
            aad_len: aad.len(),
            ciphertext_len: plaintext.len(),
        };
        let key = self
            .platform
            .seal_key(&header.request())
            .map_err(|e| e.or_fail_with(TeeError::SealingFailed))?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| TeeError::SealingFailed(format!("cipher init: {}", e)))?;

        let out = &mut out[..required];
        let body_start = SEALED_HEADER_SIZE + aad.len();
        let tag_start = body_start + plaintext.len();
        out[..SEALED_HEADER_SIZE].copy_from_slice(&header.encode());
        out[SEALED_HEADER_SIZE..body_start].copy_from_slice(aad);
        out[body_start..tag_start].copy_from_slice(plaintext);

        let (authenticated, rest) = out.split_at_mut(body_start);
        let (body, tag_out) = rest.split_at_mut(plaintext.len());
        match cipher.encrypt_in_place_detached(Nonce::from_slice(&header.nonce), authenticated, body)
        {
            Ok(tag) => tag_out.copy_from_slice(&tag),
            Err(_) => {
                out.zeroize();
                return Err(TeeError::SealingFailed("encryption failed".to_string()));
            }
        }

        debug!(sealed_len = required, "data sealed");
        Ok(required)
    }

    /// Unseal a blob, returning plaintext and the bound AAD
    #[instrument(skip_all, fields(sealed_len = sealed.len()))]
    pub fn unseal(&self, sealed: &[u8]) -> TeeResult<UnsealedData> {
        let header = SealedHeader::parse(sealed)?;
        let mut plaintext = Zeroizing::new(vec![0u8; header.ciphertext_len]);
        self.open(&header, sealed, &mut plaintext)?;

        let aad_start = SEALED_HEADER_SIZE;
        Ok(UnsealedData {
            plaintext,
            aad: sealed[aad_start..aad_start + header.aad_len].to_vec(),
        })
    }

    /// Unseal and require the bound AAD to equal `expected_aad`
    pub fn unseal_with_aad(
        &self,
        sealed: &[u8],
        expected_aad: &[u8],
    ) -> TeeResult<Zeroizing<Vec<u8>>> {
        let unsealed = self.unseal(sealed)?;
        let matches = unsealed.aad.len() == expected_aad.len()
            && bool::from(unsealed.aad.as_slice().ct_eq(expected_aad));
        if !matches {
            return Err(TeeError::UnsealingFailed(
                "additional authenticated data mismatch".to_string(),
            ));
        }
        Ok(unsealed.plaintext)
    }

    /// Unseal into a caller buffer, returning the plaintext length.
    ///
    /// On failure nothing readable is left in `out`.
    #[instrument(skip_all, fields(sealed_len = sealed.len(), out_len = out.len()))]
    pub fn unseal_into(&self, sealed: &[u8], out: &mut [u8]) -> TeeResult<usize> {
        let header = SealedHeader::parse(sealed)?;
        if out.len() < header.ciphertext_len {
            return Err(TeeError::buffer_too_small(
                header.ciphertext_len,
                out.len(),
            ));
        }

        let out = &mut out[..header.ciphertext_len];
        self.open(&header, sealed, out)?;
        Ok(header.ciphertext_len)
    }

    /// Authenticate and decrypt into `dest`, which must be exactly the
    /// ciphertext length. `dest` is wiped on failure.
    fn open(&self, header: &SealedHeader, sealed: &[u8], dest: &mut [u8]) -> TeeResult<()> {
        let body_start = SEALED_HEADER_SIZE + header.aad_len;
        let tag_start = body_start + header.ciphertext_len;

        let key = self
            .platform
            .seal_key(&header.request())
            .map_err(|e| e.or_fail_with(TeeError::UnsealingFailed))?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| TeeError::UnsealingFailed(format!("cipher init: {}", e)))?;

        dest.copy_from_slice(&sealed[body_start..tag_start]);
        let result = cipher.decrypt_in_place_detached(
            Nonce::from_slice(&header.nonce),
            &sealed[..body_start],
            dest,
            Tag::from_slice(&sealed[tag_start..]),
        );
        if result.is_err() {
            dest.zeroize();
            return Err(TeeError::UnsealingFailed(
                "authentication failed".to_string(),
            ));
        }

        debug!(plaintext_len = header.ciphertext_len, "data unsealed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::platform::SimulatedPlatform;

    fn service(signer: &str, key_version: u16) -> SealingService {
        let platform = SimulatedPlatform::new(
            &PlatformConfig {
                signer_identity: signer.to_string(),
                ..Default::default()
            },
            &SealingConfig { key_version },
        )
        .unwrap();
        platform.load(b"test enclave image", false).unwrap();
        let platform: Arc<dyn Platform> = Arc::new(platform);
        let rng = Arc::new(EnclaveRng::from_platform(platform.as_ref()).unwrap());
        SealingService::new(platform, rng, &SealingConfig { key_version })
    }

    #[test]
    fn test_seal_unseal() {
        let sealing = service("signer", 1);
        let sealed = sealing.seal(b"Hello, TEE world!", b"context").unwrap();
        assert_eq!(sealed.len(), calc_sealed_size(17, 7));

        let unsealed = sealing.unseal(&sealed).unwrap();
        assert_eq!(unsealed.plaintext.as_slice(), b"Hello, TEE world!");
        assert_eq!(unsealed.aad, b"context");

        let plaintext = sealing.unseal_with_aad(&sealed, b"context").unwrap();
        assert_eq!(plaintext.as_slice(), b"Hello, TEE world!");
    }

    #[test]
    fn test_empty_seal_is_minimum_overhead() {
        let sealing = service("signer", 1);
        let sealed = sealing.seal(&[], &[]).unwrap();
        assert_eq!(sealed.len(), SEALED_OVERHEAD);
        assert_eq!(SEALED_OVERHEAD, 72);

        let unsealed = sealing.unseal(&sealed).unwrap();
        assert!(unsealed.plaintext.is_empty());
        assert!(unsealed.aad.is_empty());
    }

    #[test]
    fn test_blobs_are_randomized() {
        let sealing = service("signer", 1);
        let a = sealing.seal(b"same", b"").unwrap();
        let b = sealing.seal(b"same", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detection() {
        let sealing = service("signer", 1);
        let sealed = sealing.seal(b"important data", b"aad").unwrap();

        // every region after the length fields is authenticated
        for index in [4, 40, SEALED_HEADER_SIZE, SEALED_HEADER_SIZE + 4, sealed.len() - 1] {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0x01;
            assert!(
                matches!(sealing.unseal(&tampered), Err(TeeError::UnsealingFailed(_))),
                "byte {} not authenticated",
                index
            );
        }
    }

    #[test]
    fn test_malformed_blobs() {
        let sealing = service("signer", 1);
        let sealed = sealing.seal(b"data", b"aad").unwrap();

        let short = &sealed[..SEALED_OVERHEAD - 1];
        assert!(matches!(
            sealing.unseal(short),
            Err(TeeError::MalformedSealedData(_))
        ));

        let mut bad_version = sealed.clone();
        bad_version[0] = 2;
        assert!(matches!(
            sealing.unseal(&bad_version),
            Err(TeeError::MalformedSealedData(_))
        ));

        let mut bad_length = sealed.clone();
        bad_length[48] ^= 0x01;
        assert!(matches!(
            sealing.unseal(&bad_length),
            Err(TeeError::MalformedSealedData(_))
        ));

        let mut truncated = sealed.clone();
        truncated.pop();
        assert!(matches!(
            unsealed_len(&truncated),
            Err(TeeError::MalformedSealedData(_))
        ));
    }

    #[test]
    fn test_wrong_signer_cannot_unseal() {
        let sealed = service("signer-a", 1).seal(b"secret", b"").unwrap();
        assert!(matches!(
            service("signer-b", 1).unseal(&sealed),
            Err(TeeError::UnsealingFailed(_))
        ));
    }

    #[test]
    fn test_future_key_version_rejected() {
        let sealed = service("signer", 2).seal(b"secret", b"").unwrap();
        assert!(matches!(
            service("signer", 1).unseal(&sealed),
            Err(TeeError::UnsealingFailed(_))
        ));
    }

    #[test]
    fn test_aad_mismatch() {
        let sealing = service("signer", 1);
        let sealed = sealing.seal(b"secret", b"expected").unwrap();
        assert!(matches!(
            sealing.unseal_with_aad(&sealed, b"other"),
            Err(TeeError::UnsealingFailed(_))
        ));
        assert!(matches!(
            sealing.unseal_with_aad(&sealed, b"expecte"),
            Err(TeeError::UnsealingFailed(_))
        ));
    }

    #[test]
    fn test_two_step_buffers() {
        let sealing = service("signer", 1);
        let plaintext = b"negotiated";

        let mut small = [0u8; 10];
        match sealing.seal_into(plaintext, b"", &mut small) {
            Err(TeeError::BufferTooSmall { required, provided }) => {
                assert_eq!(required, calc_sealed_size(plaintext.len(), 0));
                assert_eq!(provided, 10);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(small, [0u8; 10]);

        let mut sealed = vec![0u8; calc_sealed_size(plaintext.len(), 0) + 8];
        let written = sealing.seal_into(plaintext, b"", &mut sealed).unwrap();
        sealed.truncate(written);

        assert_eq!(unsealed_len(&sealed).unwrap(), plaintext.len());
        let mut out = [0u8; 4];
        assert!(matches!(
            sealing.unseal_into(&sealed, &mut out),
            Err(TeeError::BufferTooSmall { required: 10, .. })
        ));

        let mut out = [0u8; 16];
        let len = sealing.unseal_into(&sealed, &mut out).unwrap();
        assert_eq!(&out[..len], plaintext);
    }

    #[test]
    fn test_failed_unseal_into_leaves_no_plaintext() {
        let sealing = service("signer", 1);
        let mut sealed = sealing.seal(b"top secret", b"").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        let mut out = [0xaau8; 10];
        assert!(sealing.unseal_into(&sealed, &mut out).is_err());
        assert_eq!(out, [0u8; 10]);
    }
}
