//! Property-based tests for neo-enclave
//!
//! These tests use proptest to verify:
//! - Seal/unseal round trips and exact sealed sizes
//! - Sign then verify, and single-bit signature corruption
//! - AEAD round trips and tamper rejection

use neo_enclave::crypto::aead::{aead_decrypt, aead_encrypt};
use neo_enclave::{calc_sealed_size, Enclave, EnclaveConfig, TeeError};
use proptest::prelude::*;
use std::io::Write;
use std::sync::OnceLock;
use tempfile::NamedTempFile;

fn enclave() -> &'static Enclave {
    static ENCLAVE: OnceLock<(Enclave, NamedTempFile)> = OnceLock::new();
    &ENCLAVE
        .get_or_init(|| {
            let mut image = NamedTempFile::new().unwrap();
            image.write_all(b"property image").unwrap();
            let enclave = Enclave::new(EnclaveConfig::default()).unwrap();
            enclave.init(image.path(), false).unwrap();
            enclave.generate_keypair("prop").unwrap();
            (enclave, image)
        })
        .0
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // =========================================================================
    // Sealing
    // =========================================================================

    /// Unsealing a sealed blob returns the plaintext and AAD
    #[test]
    fn test_seal_round_trip(
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        aad in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        let sealed = enclave().seal(&plaintext, &aad).unwrap();
        prop_assert_eq!(sealed.len(), calc_sealed_size(plaintext.len(), aad.len()));

        let unsealed = enclave().unseal(&sealed).unwrap();
        prop_assert_eq!(&unsealed.plaintext[..], &plaintext[..]);
        prop_assert_eq!(unsealed.aad, aad);
    }

    /// Any single flipped bit is rejected
    #[test]
    fn test_seal_bit_flip(
        plaintext in prop::collection::vec(any::<u8>(), 1..64),
        bit in any::<prop::sample::Index>(),
    ) {
        let mut sealed = enclave().seal(&plaintext, b"ctx").unwrap();
        let bit = bit.index(sealed.len() * 8);
        sealed[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(enclave().unseal(&sealed).is_err());
    }

    // =========================================================================
    // Signatures
    // =========================================================================

    /// Signatures verify under the generating key
    #[test]
    fn test_sign_verify(message in any::<Vec<u8>>()) {
        let public_key = enclave().public_key("prop").unwrap();
        let signature = enclave().sign("prop", &message).unwrap();
        prop_assert!(enclave().verify(&public_key, &message, &signature).unwrap());
    }

    /// Flipping one signature bit makes verification fail
    #[test]
    fn test_signature_bit_flip(message in any::<Vec<u8>>(), bit in 0usize..512) {
        let public_key = enclave().public_key("prop").unwrap();
        let mut signature = enclave().sign("prop", &message).unwrap();
        signature[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(!enclave().verify(&public_key, &message, &signature).unwrap());
    }

    /// Signing is deterministic
    #[test]
    fn test_signing_deterministic(message in any::<Vec<u8>>()) {
        let first = enclave().sign("prop", &message).unwrap();
        let second = enclave().sign("prop", &message).unwrap();
        prop_assert_eq!(first, second);
    }

    // =========================================================================
    // AEAD
    // =========================================================================

    /// Decrypt inverts encrypt
    #[test]
    fn test_aead_round_trip(
        key in any::<[u8; 32]>(),
        iv in any::<[u8; 12]>(),
        plaintext in any::<Vec<u8>>(),
        aad in any::<Vec<u8>>(),
    ) {
        let (ciphertext, tag) = aead_encrypt(&key, &iv, &plaintext, &aad).unwrap();
        prop_assert_eq!(ciphertext.len(), plaintext.len());
        let decrypted = aead_decrypt(&key, &iv, &ciphertext, &aad, &tag).unwrap();
        prop_assert_eq!(&decrypted[..], &plaintext[..]);
    }

    /// Tampered tag, ciphertext or AAD fails with a crypto error
    #[test]
    fn test_aead_tamper(
        key in any::<[u8; 32]>(),
        iv in any::<[u8; 12]>(),
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        aad in any::<Vec<u8>>(),
        which in 0u8..3,
    ) {
        let (mut ciphertext, mut tag) = aead_encrypt(&key, &iv, &plaintext, &aad).unwrap();
        let mut aad = aad;
        match which {
            0 => tag[0] ^= 1,
            1 => ciphertext[0] ^= 1,
            _ => aad.push(0),
        }
        let result = aead_decrypt(&key, &iv, &ciphertext, &aad, &tag);
        prop_assert!(matches!(result, Err(TeeError::CryptoFailed(_))));
    }

    // =========================================================================
    // Hashing
    // =========================================================================

    /// The enclave hash matches the library hash
    #[test]
    fn test_hash_consistency(data in any::<Vec<u8>>()) {
        prop_assert_eq!(enclave().hash(&data).unwrap(), neo_enclave::crypto::hash(&data));
    }
}
