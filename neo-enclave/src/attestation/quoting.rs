//! Quoting collaborator interface and a simulated quoting enclave
//!
//! Quote layout (little-endian):
//!
//! ```text
//! version:u16 | key_type:u16 | report body | attestation key:[u8;65] | signature:[u8;64]
//! ```
//!
//! The signature is ECDSA P-256 over everything before it.

use crate::crypto::ecdsa::{self, ECC256_PUBLIC_KEY_SIZE, ECC256_SIGN_SIZE};
use crate::error::{TeeError, TeeResult};
use crate::platform::{LocalReport, Platform, ReportBody};
use p256::ecdsa::SigningKey;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Converts a local report into remotely verifiable evidence
pub trait QuoteProvider: Send + Sync {
    fn quote(&self, report: &LocalReport) -> TeeResult<Vec<u8>>;
}

/// Attestation key type: ECDSA P-256
pub const ATTESTATION_KEY_ECDSA_P256: u16 = 2;

/// A quote as produced by [`SimulatedQuoteProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub version: u16,
    pub key_type: u16,
    pub body: ReportBody,
    pub attestation_key: [u8; ECC256_PUBLIC_KEY_SIZE],
    pub signature: [u8; ECC256_SIGN_SIZE],
}

impl Quote {
    pub const VERSION: u16 = 3;

    const SIGNED_SIZE: usize = 2 + 2 + ReportBody::SIZE + ECC256_PUBLIC_KEY_SIZE;

    /// Encoded size
    pub const SIZE: usize = Self::SIGNED_SIZE + ECC256_SIGN_SIZE;

    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.key_type.to_le_bytes());
        out.extend_from_slice(&self.body.to_bytes());
        out.extend_from_slice(&self.attestation_key);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(data: &[u8]) -> TeeResult<Self> {
        if data.len() != Self::SIZE {
            return Err(TeeError::InvalidParameter(format!(
                "quote must be {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }

        let version = u16::from_le_bytes([data[0], data[1]]);
        if version != Self::VERSION {
            return Err(TeeError::InvalidParameter(format!(
                "unsupported quote version {}",
                version
            )));
        }
        let key_type = u16::from_le_bytes([data[2], data[3]]);
        if key_type != ATTESTATION_KEY_ECDSA_P256 {
            return Err(TeeError::InvalidParameter(format!(
                "unsupported attestation key type {}",
                key_type
            )));
        }

        let body_end = 4 + ReportBody::SIZE;
        let key_end = body_end + ECC256_PUBLIC_KEY_SIZE;
        let body = ReportBody::from_bytes(&data[4..body_end])?;

        let mut attestation_key = [0u8; ECC256_PUBLIC_KEY_SIZE];
        attestation_key.copy_from_slice(&data[body_end..key_end]);
        let mut signature = [0u8; ECC256_SIGN_SIZE];
        signature.copy_from_slice(&data[key_end..]);

        Ok(Self {
            version,
            key_type,
            body,
            attestation_key,
            signature,
        })
    }

    /// Check the signature against the embedded attestation key.
    ///
    /// Says nothing about whether that key or the measurements are trusted.
    pub fn verify_signature(&self) -> bool {
        ecdsa::verify(&self.attestation_key, &self.signed_bytes(), &self.signature)
            .unwrap_or(false)
    }
}

/// Software quoting enclave: checks the local report MAC through the
/// platform, then signs the report body with its attestation key.
pub struct SimulatedQuoteProvider {
    platform: Arc<dyn Platform>,
    attestation_key: SigningKey,
}

impl SimulatedQuoteProvider {
    /// New provider with an attestation key drawn from platform entropy
    pub fn new(platform: Arc<dyn Platform>) -> TeeResult<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        platform.fill_entropy(&mut seed[..])?;
        let attestation_key = SigningKey::random(&mut ChaCha20Rng::from_seed(*seed));
        Ok(Self::with_key(platform, attestation_key))
    }

    pub fn with_key(platform: Arc<dyn Platform>, attestation_key: SigningKey) -> Self {
        Self {
            platform,
            attestation_key,
        }
    }

    pub fn attestation_public_key(&self) -> [u8; ECC256_PUBLIC_KEY_SIZE] {
        ecdsa::public_key_bytes(&self.attestation_key)
    }
}

impl QuoteProvider for SimulatedQuoteProvider {
    fn quote(&self, report: &LocalReport) -> TeeResult<Vec<u8>> {
        if !self.platform.verify_report(report) {
            return Err(TeeError::AttestationFailed(
                "local report failed MAC verification".to_string(),
            ));
        }

        let mut quote = Quote {
            version: Quote::VERSION,
            key_type: ATTESTATION_KEY_ECDSA_P256,
            body: report.body,
            attestation_key: self.attestation_public_key(),
            signature: [0u8; ECC256_SIGN_SIZE],
        };
        quote.signature = ecdsa::sign(&self.attestation_key, &quote.signed_bytes())?;

        debug!(quote_len = Quote::SIZE, "simulated quote produced");
        Ok(quote.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlatformConfig, SealingConfig};
    use crate::platform::SimulatedPlatform;

    fn loaded_platform() -> Arc<dyn Platform> {
        let platform =
            SimulatedPlatform::new(&PlatformConfig::default(), &SealingConfig::default()).unwrap();
        platform.load(b"quoted image", true).unwrap();
        Arc::new(platform)
    }

    #[test]
    fn test_quote_roundtrip_and_signature() {
        let platform = loaded_platform();
        let provider = SimulatedQuoteProvider::new(platform.clone()).unwrap();
        let report = platform.create_report(&[9u8; 64]).unwrap();

        let bytes = provider.quote(&report).unwrap();
        assert_eq!(bytes.len(), Quote::SIZE);

        let quote = Quote::from_bytes(&bytes).unwrap();
        assert_eq!(quote.body, report.body);
        assert_eq!(quote.attestation_key, provider.attestation_public_key());
        assert!(quote.verify_signature());
    }

    #[test]
    fn test_tampered_quote_fails_signature() {
        let platform = loaded_platform();
        let provider = SimulatedQuoteProvider::new(platform.clone()).unwrap();
        let report = platform.create_report(&[0u8; 64]).unwrap();
        let bytes = provider.quote(&report).unwrap();

        let mut quote = Quote::from_bytes(&bytes).unwrap();
        quote.body.debug = false;
        assert!(!quote.verify_signature());
    }

    #[test]
    fn test_forged_report_rejected() {
        let platform = loaded_platform();
        let provider = SimulatedQuoteProvider::new(platform.clone()).unwrap();
        let mut report = platform.create_report(&[0u8; 64]).unwrap();
        report.body.mr_enclave = [0u8; 32];

        assert!(matches!(
            provider.quote(&report),
            Err(TeeError::AttestationFailed(_))
        ));
    }

    #[test]
    fn test_from_bytes_rejects_bad_input() {
        assert!(Quote::from_bytes(&[0u8; 10]).is_err());
        assert!(Quote::from_bytes(&vec![0u8; Quote::SIZE]).is_err());
    }
}
