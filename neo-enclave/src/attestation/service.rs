//! Attestation service for generating reports

use crate::attestation::quoting::QuoteProvider;
use crate::attestation::report::AttestationReport;
use crate::config::AttestationConfig;
use crate::crypto::ECC256_PUBLIC_KEY_SIZE;
use crate::error::{TeeError, TeeResult};
use crate::platform::{Measurements, Platform, REPORT_DATA_SIZE};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument, warn};

const KEY_ATTESTATION_DOMAIN: &[u8] = b"neo-enclave/key-attestation";

/// Digest placed in the first half of report data by
/// [`AttestationService::attest_public_key`]
pub fn key_binding_digest(public_key: &[u8; ECC256_PUBLIC_KEY_SIZE]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_ATTESTATION_DOMAIN);
    hasher.update(public_key);
    hasher.finalize().into()
}

/// Binds a report to one TLS session: report data is the session hash
/// followed by the verifier's nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub session_hash: [u8; 32],
    pub nonce: [u8; 32],
}

impl ChannelBinding {
    pub fn new(session_hash: [u8; 32], nonce: [u8; 32]) -> Self {
        Self { session_hash, nonce }
    }

    pub fn to_report_data(&self) -> [u8; REPORT_DATA_SIZE] {
        let mut report_data = [0u8; REPORT_DATA_SIZE];
        report_data[..32].copy_from_slice(&self.session_hash);
        report_data[32..].copy_from_slice(&self.nonce);
        report_data
    }

    /// Whether `report_data` carries exactly this binding
    pub fn matches(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> bool {
        bool::from(self.to_report_data().ct_eq(report_data))
    }
}

/// Service for generating attestation evidence of the running enclave
pub struct AttestationService {
    platform: Arc<dyn Platform>,
    provider: Option<Arc<dyn QuoteProvider>>,
    measurements: Measurements,
    max_quote_size: usize,
}

impl AttestationService {
    pub fn new(
        platform: Arc<dyn Platform>,
        provider: Option<Arc<dyn QuoteProvider>>,
        measurements: Measurements,
        config: &AttestationConfig,
    ) -> Self {
        Self {
            platform,
            provider,
            measurements,
            max_quote_size: config.max_quote_size,
        }
    }

    /// Measurement pair of the loaded image, without a quote
    pub fn get_measurements(&self) -> Measurements {
        self.measurements
    }

    /// Generate a report carrying up to 64 bytes of caller data.
    ///
    /// Measurements come from the platform. Without a working quoting
    /// collaborator no report is produced at all.
    #[instrument(skip_all, fields(report_data_len = report_data.len()))]
    pub fn generate_attestation(&self, report_data: &[u8]) -> TeeResult<AttestationReport> {
        if report_data.len() > REPORT_DATA_SIZE {
            return Err(TeeError::InvalidParameter(format!(
                "report data is {} bytes, maximum is {}",
                report_data.len(),
                REPORT_DATA_SIZE
            )));
        }
        let mut padded = [0u8; REPORT_DATA_SIZE];
        padded[..report_data.len()].copy_from_slice(report_data);

        let provider = self.provider.as_ref().ok_or_else(|| {
            TeeError::AttestationFailed("no quoting provider available".to_string())
        })?;

        let local = self
            .platform
            .create_report(&padded)
            .map_err(|e| e.or_fail_with(TeeError::AttestationFailed))?;

        let quote = provider.quote(&local).map_err(|e| {
            warn!(error = %e, "quoting provider failed");
            e.or_fail_with(TeeError::AttestationFailed)
        })?;
        if quote.is_empty() || quote.len() > self.max_quote_size {
            return Err(TeeError::AttestationFailed(format!(
                "quote is {} bytes, allowed 1..={}",
                quote.len(),
                self.max_quote_size
            )));
        }

        debug!(quote_len = quote.len(), debug = local.body.debug, "attestation generated");
        Ok(AttestationReport::from_body(&local.body, quote))
    }

    /// Report binding `public_key` to this enclave: report data is the key
    /// binding digest followed by the issue time in seconds.
    pub fn attest_public_key(
        &self,
        public_key: &[u8; ECC256_PUBLIC_KEY_SIZE],
    ) -> TeeResult<AttestationReport> {
        let mut report_data = [0u8; REPORT_DATA_SIZE];
        report_data[..32].copy_from_slice(&key_binding_digest(public_key));

        let timestamp = Utc::now().timestamp().max(0) as u64;
        report_data[32..40].copy_from_slice(&timestamp.to_le_bytes());

        self.generate_attestation(&report_data)
    }

    /// Report bound to a TLS session through `binding`
    pub fn attest_channel(&self, binding: &ChannelBinding) -> TeeResult<AttestationReport> {
        self.generate_attestation(&binding.to_report_data())
    }
}
