//! ECDSA over secp256r1 with SHA-256

use crate::crypto::EnclaveRng;
use crate::error::{TeeError, TeeResult};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use zeroize::Zeroizing;

/// r || s, big endian
pub const ECC256_SIGN_SIZE: usize = 32 * 2;

/// 0x04 || x || y
pub const ECC256_PUBLIC_KEY_SIZE: usize = 1 + 32 * 2;

pub const ECC256_PRIVATE_KEY_SIZE: usize = 32;

pub fn generate_signing_key(rng: &EnclaveRng) -> SigningKey {
    rng.with_rng(|rng| SigningKey::random(rng))
}

pub fn public_key_bytes(key: &SigningKey) -> [u8; ECC256_PUBLIC_KEY_SIZE] {
    let point = key.verifying_key().to_encoded_point(false);
    let mut out = [0u8; ECC256_PUBLIC_KEY_SIZE];
    out.copy_from_slice(point.as_bytes());
    out
}

pub fn private_key_bytes(key: &SigningKey) -> Zeroizing<[u8; ECC256_PRIVATE_KEY_SIZE]> {
    let mut out = Zeroizing::new([0u8; ECC256_PRIVATE_KEY_SIZE]);
    out.copy_from_slice(&key.to_bytes());
    out
}

pub fn signing_key_from_bytes(bytes: &[u8]) -> TeeResult<SigningKey> {
    if bytes.len() != ECC256_PRIVATE_KEY_SIZE {
        return Err(TeeError::InvalidParameter(format!(
            "private key must be {} bytes, got {}",
            ECC256_PRIVATE_KEY_SIZE,
            bytes.len()
        )));
    }
    SigningKey::from_slice(bytes)
        .map_err(|_err| TeeError::InvalidParameter("ecdsa: invalid private key".to_string()))
}

/// Deterministic (RFC 6979) signature over SHA-256(message)
pub fn sign(key: &SigningKey, message: &[u8]) -> TeeResult<[u8; ECC256_SIGN_SIZE]> {
    let sign: Signature = key
        .try_sign(message)
        .map_err(|_err| TeeError::CryptoFailed("ecdsa: signing failed".to_string()))?;

    let mut out = [0u8; ECC256_SIGN_SIZE];
    out.copy_from_slice(&sign.to_bytes()); // big endian
    Ok(out)
}

/// Verify `signature` over `message`.
///
/// Malformed lengths and public keys not on the curve are errors; a
/// well-formed signature that does not verify is `Ok(false)`.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> TeeResult<bool> {
    if public_key.len() != ECC256_PUBLIC_KEY_SIZE || public_key[0] != 0x04 {
        return Err(TeeError::InvalidParameter(format!(
            "ecdsa: public key must be {} byte uncompressed point",
            ECC256_PUBLIC_KEY_SIZE
        )));
    }
    if signature.len() != ECC256_SIGN_SIZE {
        return Err(TeeError::InvalidParameter(format!(
            "ecdsa: signature must be {} bytes, got {}",
            ECC256_SIGN_SIZE,
            signature.len()
        )));
    }

    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_err| TeeError::InvalidParameter("ecdsa: invalid public key".to_string()))?;

    // r or s out of range: well-formed length, just not a valid signature
    let Ok(sign) = Signature::from_slice(signature) else {
        return Ok(false);
    };

    Ok(key.verify(message, &sign).is_ok())
}
