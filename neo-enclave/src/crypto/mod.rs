//! Cryptographic services executed inside the enclave
//!
//! Signing keys are generated from the enclave DRBG and kept in a
//! [`KeyStore`]; only public keys cross the boundary. The only way a private
//! key leaves is [`CryptoService::export_sealed_key`], which seals it to the
//! enclave signer identity.

pub mod aead;
pub mod ecdsa;
mod keystore;
mod rng;

pub use aead::{AEAD_IV_SIZE, AEAD_KEY_SIZE, AEAD_TAG_SIZE};
pub use ecdsa::{ECC256_PUBLIC_KEY_SIZE, ECC256_SIGN_SIZE};
pub use keystore::{KeyInfo, KeyStore, MAX_KEY_ID_LEN};
pub use rng::EnclaveRng;

use crate::enclave::SealingService;
use crate::error::{TeeError, TeeResult};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

/// SHA-256 digest size
pub const HASH_SIZE: usize = 32;

const KEY_EXPORT_DOMAIN: &[u8] = b"neo-enclave/key-export";

/// SHA-256
pub fn hash(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(data).into()
}

/// AAD binding an exported key blob to its id and public key
fn key_export_aad(key_id: &str, public_key: &[u8; ECC256_PUBLIC_KEY_SIZE]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(KEY_EXPORT_DOMAIN.len() + 4 + key_id.len() + public_key.len());
    aad.extend_from_slice(KEY_EXPORT_DOMAIN);
    aad.extend_from_slice(&(key_id.len() as u32).to_le_bytes());
    aad.extend_from_slice(key_id.as_bytes());
    aad.extend_from_slice(public_key);
    aad
}

/// Key management, signatures, hashing, AEAD and randomness
pub struct CryptoService {
    keys: KeyStore,
    rng: Arc<EnclaveRng>,
    sealing: Arc<SealingService>,
}

impl CryptoService {
    pub fn new(rng: Arc<EnclaveRng>, sealing: Arc<SealingService>) -> Self {
        Self {
            keys: KeyStore::new(),
            rng,
            sealing,
        }
    }

    /// Generate a P-256 key pair under `key_id` and return its public key.
    /// An existing id is never overwritten.
    #[instrument(skip(self))]
    pub fn generate_keypair(&self, key_id: &str) -> TeeResult<[u8; ECC256_PUBLIC_KEY_SIZE]> {
        keystore::validate_key_id(key_id)?;
        if self.keys.contains(key_id) {
            return Err(TeeError::KeyAlreadyExists(key_id.to_string()));
        }

        let signing_key = ecdsa::generate_signing_key(&self.rng);
        let public_key = self.keys.insert(key_id, signing_key)?;
        info!(key_id, "key pair generated");
        Ok(public_key)
    }

    /// Deterministic ECDSA P-256 signature over SHA-256(data)
    #[instrument(skip(self, data), fields(data_len = data.len()))]
    pub fn sign(&self, key_id: &str, data: &[u8]) -> TeeResult<[u8; ECC256_SIGN_SIZE]> {
        self.keys
            .with_signing_key(key_id, |key| ecdsa::sign(key, data))?
    }

    pub fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> TeeResult<bool> {
        ecdsa::verify(public_key, data, signature)
    }

    pub fn hash(&self, data: &[u8]) -> [u8; HASH_SIZE] {
        hash(data)
    }

    /// AES-256-GCM encryption; IV uniqueness per key is the caller's hazard
    pub fn aead_encrypt(
        &self,
        key: &[u8; AEAD_KEY_SIZE],
        iv: &[u8; AEAD_IV_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> TeeResult<(Vec<u8>, [u8; AEAD_TAG_SIZE])> {
        aead::aead_encrypt(key, iv, plaintext, aad)
    }

    pub fn aead_decrypt(
        &self,
        key: &[u8; AEAD_KEY_SIZE],
        iv: &[u8; AEAD_IV_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
        tag: &[u8; AEAD_TAG_SIZE],
    ) -> TeeResult<Zeroizing<Vec<u8>>> {
        aead::aead_decrypt(key, iv, ciphertext, aad, tag)
    }

    /// Bytes from the enclave DRBG
    pub fn random_bytes(&self, len: usize) -> TeeResult<Vec<u8>> {
        self.rng.random_bytes(len)
    }

    pub fn fill_random(&self, dest: &mut [u8]) -> TeeResult<()> {
        if dest.is_empty() {
            return Err(TeeError::InvalidParameter(
                "random length must be non-zero".to_string(),
            ));
        }
        self.rng.fill(dest);
        Ok(())
    }

    pub fn public_key(&self, key_id: &str) -> TeeResult<[u8; ECC256_PUBLIC_KEY_SIZE]> {
        self.keys.public_key(key_id)
    }

    pub fn list_keys(&self) -> Vec<KeyInfo> {
        self.keys.list()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    #[instrument(skip(self))]
    pub fn delete_key(&self, key_id: &str) -> TeeResult<()> {
        self.keys.remove(key_id)?;
        info!(key_id, "key deleted");
        Ok(())
    }

    /// Seal the private key of `key_id` for storage outside the enclave
    #[instrument(skip(self))]
    pub fn export_sealed_key(&self, key_id: &str) -> TeeResult<Vec<u8>> {
        let (private_key, public_key) = self.keys.with_signing_key(key_id, |key| {
            (ecdsa::private_key_bytes(key), ecdsa::public_key_bytes(key))
        })?;

        let aad = key_export_aad(key_id, &public_key);
        let sealed = self.sealing.seal(&private_key[..], &aad)?;
        debug!(key_id, sealed_len = sealed.len(), "key exported");
        Ok(sealed)
    }

    /// Restore a key exported by [`export_sealed_key`](Self::export_sealed_key)
    /// under the same `key_id`
    #[instrument(skip(self, sealed), fields(sealed_len = sealed.len()))]
    pub fn import_sealed_key(
        &self,
        key_id: &str,
        sealed: &[u8],
    ) -> TeeResult<[u8; ECC256_PUBLIC_KEY_SIZE]> {
        keystore::validate_key_id(key_id)?;
        if self.keys.contains(key_id) {
            return Err(TeeError::KeyAlreadyExists(key_id.to_string()));
        }

        let unsealed = self.sealing.unseal(sealed)?;
        let signing_key = ecdsa::signing_key_from_bytes(&unsealed.plaintext)
            .map_err(|_| TeeError::UnsealingFailed("sealed blob is not a key".to_string()))?;

        let expected_aad = key_export_aad(key_id, &ecdsa::public_key_bytes(&signing_key));
        let bound = unsealed.aad.len() == expected_aad.len()
            && bool::from(unsealed.aad.as_slice().ct_eq(&expected_aad));
        if !bound {
            return Err(TeeError::UnsealingFailed(
                "sealed key is bound to a different key id".to_string(),
            ));
        }

        let public_key = self.keys.insert(key_id, signing_key)?;
        info!(key_id, "key imported");
        Ok(public_key)
    }

    /// Drop every key
    pub(crate) fn clear(&self) {
        self.keys.clear();
    }
}
