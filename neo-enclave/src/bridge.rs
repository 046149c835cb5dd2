//! Fixed status-code boundary over an [`Enclave`]
//!
//! Every call returns a [`StatusCode`]. Fixed-size outputs go into caller
//! arrays, variable-size outputs use the query-then-fill protocol, and
//! script results stay in a boundary-owned table until released. Output
//! parameters are written only when the call succeeds, except for the
//! required length reported alongside `BufferTooSmall`.

use crate::attestation::AttestationReport;
use crate::crypto::{AEAD_IV_SIZE, AEAD_KEY_SIZE, AEAD_TAG_SIZE, ECC256_PUBLIC_KEY_SIZE, ECC256_SIGN_SIZE, HASH_SIZE};
use crate::enclave::{calc_sealed_size, Enclave};
use crate::error::{StatusCode, TeeError, TeeResult};
use crate::platform::{MEASUREMENT_SIZE, REPORT_DATA_SIZE};
use crate::sandbox::{ScriptRequest, ScriptResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};
use zeroize::Zeroize;

/// Handle to a script result held by the boundary. Zero is never issued.
pub type ScriptResultHandle = u64;

/// Fixed-size fields of an attestation report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportFields {
    pub mr_enclave: [u8; MEASUREMENT_SIZE],
    pub mr_signer: [u8; MEASUREMENT_SIZE],
    pub report_data: [u8; REPORT_DATA_SIZE],
    pub debug: bool,
}

impl Default for ReportFields {
    fn default() -> Self {
        Self {
            mr_enclave: [0u8; MEASUREMENT_SIZE],
            mr_signer: [0u8; MEASUREMENT_SIZE],
            report_data: [0u8; REPORT_DATA_SIZE],
            debug: false,
        }
    }
}

impl From<&AttestationReport> for ReportFields {
    fn from(report: &AttestationReport) -> Self {
        Self {
            mr_enclave: report.mr_enclave,
            mr_signer: report.mr_signer,
            report_data: report.report_data,
            debug: report.debug,
        }
    }
}

/// Status-code surface of one enclave
pub struct EnclaveBridge {
    enclave: Enclave,
    results: Mutex<HashMap<ScriptResultHandle, ScriptResult>>,
    next_handle: AtomicU64,
}

impl EnclaveBridge {
    pub fn new(enclave: Enclave) -> Self {
        Self {
            enclave,
            results: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn enclave(&self) -> &Enclave {
        &self.enclave
    }

    // Lifecycle

    pub fn init(&self, path: impl AsRef<Path>, debug: bool, handle_out: &mut [u8; 32]) -> StatusCode {
        complete("init", self.enclave.init(path, debug), |handle| {
            handle_out.copy_from_slice(handle.as_bytes())
        })
    }

    /// Destroys the enclave and drops every pending script result
    pub fn destroy(&self) -> StatusCode {
        let status = complete("destroy", self.enclave.destroy(), |()| ());
        if status.is_success() {
            self.results.lock().clear();
        }
        status
    }

    pub fn health_check(&self, handle_out: &mut [u8; 32]) -> StatusCode {
        complete("health_check", self.enclave.health_check(), |health| {
            handle_out.copy_from_slice(health.handle.as_bytes())
        })
    }

    pub fn is_hardware_mode(&self) -> bool {
        self.enclave.is_hardware_mode()
    }

    // Sealing

    /// Needs no enclave
    pub fn calc_sealed_size(&self, plaintext_len: usize, aad_len: usize) -> usize {
        calc_sealed_size(plaintext_len, aad_len)
    }

    /// Seal into `out`. A short buffer reports `BufferTooSmall` and writes
    /// the required size to `out_len`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8], out: &mut [u8], out_len: &mut usize) -> StatusCode {
        let result = self.enclave.seal_into(plaintext, aad, out);
        negotiated("seal", result, out_len)
    }

    /// Unseal into `out`; same size protocol as [`seal`](Self::seal)
    pub fn unseal(&self, sealed: &[u8], out: &mut [u8], out_len: &mut usize) -> StatusCode {
        let result = self.enclave.unseal_into(sealed, out);
        negotiated("unseal", result, out_len)
    }

    // Attestation

    /// Produce an attestation report. The quote goes into `quote_out` under
    /// the size protocol; the fixed fields go into `fields` on success.
    pub fn generate_attestation(
        &self,
        report_data: &[u8],
        fields: &mut ReportFields,
        quote_out: &mut [u8],
        quote_len: &mut usize,
    ) -> StatusCode {
        let result = self.enclave.generate_attestation(report_data).and_then(|report| {
            let required = report.quote.len();
            if quote_out.len() < required {
                return Err(TeeError::buffer_too_small(required, quote_out.len()));
            }
            quote_out[..required].copy_from_slice(&report.quote);
            *fields = ReportFields::from(&report);
            Ok(required)
        });
        negotiated("generate_attestation", result, quote_len)
    }

    pub fn get_measurements(
        &self,
        mr_enclave: &mut [u8; MEASUREMENT_SIZE],
        mr_signer: &mut [u8; MEASUREMENT_SIZE],
    ) -> StatusCode {
        complete("get_measurements", self.enclave.get_measurements(), |m| {
            *mr_enclave = m.mr_enclave;
            *mr_signer = m.mr_signer;
        })
    }

    // Crypto

    pub fn generate_keypair(
        &self,
        key_id: &str,
        public_key_out: &mut [u8; ECC256_PUBLIC_KEY_SIZE],
    ) -> StatusCode {
        complete("generate_keypair", self.enclave.generate_keypair(key_id), |pk| {
            *public_key_out = pk
        })
    }

    pub fn sign(&self, key_id: &str, data: &[u8], signature_out: &mut [u8; ECC256_SIGN_SIZE]) -> StatusCode {
        complete("sign", self.enclave.sign(key_id, data), |sig| *signature_out = sig)
    }

    pub fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8], valid_out: &mut bool) -> StatusCode {
        complete("verify", self.enclave.verify(public_key, data, signature), |valid| {
            *valid_out = valid
        })
    }

    pub fn hash(&self, data: &[u8], hash_out: &mut [u8; HASH_SIZE]) -> StatusCode {
        complete("hash", self.enclave.hash(data), |digest| *hash_out = digest)
    }

    /// `ciphertext_out` must hold at least `plaintext.len()` bytes
    pub fn aead_encrypt(
        &self,
        key: &[u8; AEAD_KEY_SIZE],
        iv: &[u8; AEAD_IV_SIZE],
        plaintext: &[u8],
        aad: &[u8],
        ciphertext_out: &mut [u8],
        tag_out: &mut [u8; AEAD_TAG_SIZE],
    ) -> StatusCode {
        let result = check_capacity(plaintext.len(), ciphertext_out.len())
            .and_then(|()| self.enclave.aead_encrypt(key, iv, plaintext, aad));
        complete("aead_encrypt", result, |(ciphertext, tag)| {
            ciphertext_out[..ciphertext.len()].copy_from_slice(&ciphertext);
            *tag_out = tag;
        })
    }

    /// `plaintext_out` must hold at least `ciphertext.len()` bytes
    pub fn aead_decrypt(
        &self,
        key: &[u8; AEAD_KEY_SIZE],
        iv: &[u8; AEAD_IV_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
        tag: &[u8; AEAD_TAG_SIZE],
        plaintext_out: &mut [u8],
    ) -> StatusCode {
        let result = check_capacity(ciphertext.len(), plaintext_out.len())
            .and_then(|()| self.enclave.aead_decrypt(key, iv, ciphertext, aad, tag));
        complete("aead_decrypt", result, |plaintext| {
            plaintext_out[..plaintext.len()].copy_from_slice(&plaintext)
        })
    }

    /// Fill all of `out` from the enclave DRBG; an empty buffer is rejected
    pub fn random_bytes(&self, out: &mut [u8]) -> StatusCode {
        let mut scratch = vec![0u8; out.len()];
        let result = self.enclave.fill_random(&mut scratch);
        let status = complete("random_bytes", result, |()| out.copy_from_slice(&scratch));
        scratch.zeroize();
        status
    }

    // Script sandbox

    /// Run a script and park its result under a fresh handle
    pub fn execute_script(&self, request: &ScriptRequest, handle_out: &mut ScriptResultHandle) -> StatusCode {
        complete("execute_script", self.enclave.execute_script(request), |result| {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            self.results.lock().insert(handle, result);
            *handle_out = handle;
        })
    }

    /// Borrow a parked result; `None` for unknown or released handles
    pub fn with_script_result<R>(
        &self,
        handle: ScriptResultHandle,
        f: impl FnOnce(&ScriptResult) -> R,
    ) -> Option<R> {
        self.results.lock().get(&handle).map(f)
    }

    /// Release a parked result. Releasing an unknown or already released
    /// handle is a no-op.
    pub fn free_script_result(&self, handle: ScriptResultHandle) -> StatusCode {
        match self.results.lock().remove(&handle) {
            Some(result) => {
                result.release();
                trace!(handle, "script result released");
            }
            None => debug!(handle, "script result already released"),
        }
        StatusCode::Success
    }

    /// Results not yet released
    pub fn pending_script_results(&self) -> usize {
        self.results.lock().len()
    }
}

fn check_capacity(required: usize, provided: usize) -> TeeResult<()> {
    if provided < required {
        return Err(TeeError::buffer_too_small(required, provided));
    }
    Ok(())
}

/// Map a result to its status, running `write` only on success
fn complete<T>(op: &'static str, result: TeeResult<T>, write: impl FnOnce(T)) -> StatusCode {
    match result {
        Ok(value) => {
            write(value);
            StatusCode::Success
        }
        Err(e) => {
            let status = e.status();
            if e.is_fatal() {
                error!(op, error = %e, "boundary call failed");
            } else {
                debug!(op, error = %e, status = status.as_u32(), "boundary call failed");
            }
            status
        }
    }
}

/// Like [`complete`] for length-producing calls, also reporting the
/// required length on `BufferTooSmall`
fn negotiated(op: &'static str, result: TeeResult<usize>, len_out: &mut usize) -> StatusCode {
    if let Err(TeeError::BufferTooSmall { required, .. }) = &result {
        *len_out = *required;
    }
    complete(op, result, |len| *len_out = len)
}
