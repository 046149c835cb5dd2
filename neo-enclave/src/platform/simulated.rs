//! Software isolation substrate
//!
//! Code identity is the SHA-256 of the image, signer identity the SHA-256 of
//! the configured signer string. Keys come from HKDF-SHA256 over a platform
//! fuse secret; reports are authenticated with HMAC-SHA256.

use super::{
    EnclaveMode, KeyRequest, LocalReport, Measurements, Platform, ReportBody, REPORT_DATA_SIZE,
};
use crate::config::{PlatformConfig, SealingConfig};
use crate::error::{TeeError, TeeResult};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const DEV_FUSE_SEED: &[u8] = b"neo-enclave/simulated-fuse-secret/v1";
const SIGNER_DOMAIN: &[u8] = b"neo-enclave/signer";
const SEAL_KEY_INFO: &[u8] = b"neo-enclave/seal";
const REPORT_KEY_INFO: &[u8] = b"neo-enclave/report";

#[derive(Debug, Clone, Copy)]
struct Session {
    measurements: Measurements,
    debug: bool,
}

/// Simulated isolation substrate
pub struct SimulatedPlatform {
    fuse_secret: Zeroizing<[u8; 32]>,
    mr_signer: [u8; 32],
    isv_prod_id: u16,
    isv_svn: u16,
    max_key_version: u16,
    session: RwLock<Option<Session>>,
    lost: AtomicBool,
}

impl SimulatedPlatform {
    /// Build from configuration. Without a configured secret a fixed
    /// development secret is used.
    pub fn new(platform: &PlatformConfig, sealing: &SealingConfig) -> TeeResult<Self> {
        let fuse_secret = match platform.decode_secret()? {
            Some(secret) => Zeroizing::new(secret),
            None => {
                warn!("no platform secret configured, using development fuse secret");
                Zeroizing::new(Sha256::digest(DEV_FUSE_SEED).into())
            }
        };

        Ok(Self {
            fuse_secret,
            mr_signer: signer_measurement(&platform.signer_identity),
            isv_prod_id: platform.isv_prod_id,
            isv_svn: platform.isv_svn,
            max_key_version: sealing.key_version,
            session: RwLock::new(None),
            lost: AtomicBool::new(false),
        })
    }

    /// Drop the hardware session out from under the enclave, as a power
    /// transition would.
    pub fn simulate_session_loss(&self) {
        warn!("simulated platform session lost");
        self.lost.store(true, Ordering::SeqCst);
    }

    fn current_session(&self) -> TeeResult<Session> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(TeeError::EnclaveLost);
        }
        (*self.session.read()).ok_or(TeeError::EnclaveNotInitialized)
    }

    fn report_mac(&self, body: &ReportBody) -> TeeResult<[u8; 32]> {
        let report_key = self.derive(None, &[REPORT_KEY_INFO])?;
        let mut mac = HmacSha256::new_from_slice(&report_key[..])
            .map_err(|e| TeeError::CryptoFailed(e.to_string()))?;
        mac.update(&body.to_bytes());
        Ok(mac.finalize().into_bytes().into())
    }

    fn derive(&self, salt: Option<&[u8]>, info: &[&[u8]]) -> TeeResult<Zeroizing<[u8; 32]>> {
        let hk = Hkdf::<Sha256>::new(salt, &self.fuse_secret[..]);
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand_multi_info(info, &mut okm[..])
            .map_err(|e| TeeError::CryptoFailed(format!("HKDF expansion failed: {}", e)))?;
        Ok(okm)
    }
}

/// Signer measurement for a signer identity string
pub(crate) fn signer_measurement(signer_identity: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SIGNER_DOMAIN);
    hasher.update(signer_identity.as_bytes());
    hasher.finalize().into()
}

impl Platform for SimulatedPlatform {
    fn mode(&self) -> EnclaveMode {
        EnclaveMode::Simulation
    }

    fn load(&self, image: &[u8], debug_mode: bool) -> TeeResult<Measurements> {
        if image.is_empty() {
            return Err(TeeError::InvalidEnclave("enclave image is empty".to_string()));
        }

        let measurements = Measurements {
            mr_enclave: Sha256::digest(image).into(),
            mr_signer: self.mr_signer,
        };

        *self.session.write() = Some(Session {
            measurements,
            debug: debug_mode,
        });
        self.lost.store(false, Ordering::SeqCst);

        debug!(
            mr_enclave = %hex::encode(measurements.mr_enclave),
            debug = debug_mode,
            "simulated enclave image loaded"
        );
        Ok(measurements)
    }

    fn unload(&self) {
        self.session.write().take();
    }

    fn session_alive(&self) -> bool {
        !self.lost.load(Ordering::SeqCst) && self.session.read().is_some()
    }

    fn seal_key(&self, request: &KeyRequest) -> TeeResult<Zeroizing<[u8; 32]>> {
        let session = self.current_session()?;
        if request.key_version == 0 || request.key_version > self.max_key_version {
            return Err(TeeError::InvalidParameter(format!(
                "key version {} is not provisioned",
                request.key_version
            )));
        }

        self.derive(
            Some(&session.measurements.mr_signer),
            &[
                SEAL_KEY_INFO,
                &request.key_version.to_le_bytes(),
                &request.key_id,
            ],
        )
    }

    fn create_report(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> TeeResult<LocalReport> {
        let session = self.current_session()?;
        let body = ReportBody {
            mode: self.mode(),
            mr_enclave: session.measurements.mr_enclave,
            mr_signer: session.measurements.mr_signer,
            isv_prod_id: self.isv_prod_id,
            isv_svn: self.isv_svn,
            debug: session.debug,
            report_data: *report_data,
        };
        let mac = self.report_mac(&body)?;
        Ok(LocalReport { body, mac })
    }

    fn verify_report(&self, report: &LocalReport) -> bool {
        let Ok(report_key) = self.derive(None, &[REPORT_KEY_INFO]) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&report_key[..]) else {
            return false;
        };
        mac.update(&report.body.to_bytes());
        mac.verify_slice(&report.mac).is_ok()
    }

    fn fill_entropy(&self, dest: &mut [u8]) -> TeeResult<()> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| TeeError::CryptoFailed(format!("platform entropy unavailable: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform_with(signer: &str, key_version: u16) -> SimulatedPlatform {
        let platform = PlatformConfig {
            signer_identity: signer.to_string(),
            ..Default::default()
        };
        SimulatedPlatform::new(&platform, &SealingConfig { key_version }).unwrap()
    }

    #[test]
    fn test_load_measures_image() {
        let platform = platform_with("signer-a", 1);
        assert!(!platform.session_alive());

        let m1 = platform.load(b"image-one", false).unwrap();
        let m2 = platform.load(b"image-two", false).unwrap();
        assert_ne!(m1.mr_enclave, m2.mr_enclave);
        assert_eq!(m1.mr_signer, m2.mr_signer);
        assert_eq!(m1.mr_signer, signer_measurement("signer-a"));
        assert!(platform.session_alive());

        assert!(matches!(
            platform.load(&[], false),
            Err(TeeError::InvalidEnclave(_))
        ));
    }

    #[test]
    fn test_seal_key_bound_to_signer() {
        let request = KeyRequest {
            key_id: [7u8; 32],
            key_version: 1,
        };

        let a = platform_with("signer-a", 1);
        let b = platform_with("signer-b", 1);
        a.load(b"image", false).unwrap();
        b.load(b"image", false).unwrap();

        let ka = a.seal_key(&request).unwrap();
        assert_eq!(*ka, *a.seal_key(&request).unwrap());
        assert_ne!(*ka, *b.seal_key(&request).unwrap());

        let other_id = KeyRequest {
            key_id: [8u8; 32],
            ..request
        };
        assert_ne!(*ka, *a.seal_key(&other_id).unwrap());
    }

    #[test]
    fn test_seal_key_version_bounds() {
        let platform = platform_with("signer", 2);
        platform.load(b"image", false).unwrap();

        let mut request = KeyRequest {
            key_id: [0u8; 32],
            key_version: 2,
        };
        let v2 = platform.seal_key(&request).unwrap();
        request.key_version = 1;
        assert_ne!(*v2, *platform.seal_key(&request).unwrap());

        request.key_version = 3;
        assert!(platform.seal_key(&request).is_err());
        request.key_version = 0;
        assert!(platform.seal_key(&request).is_err());
    }

    #[test]
    fn test_report_mac() {
        let platform = platform_with("signer", 1);
        assert!(platform.create_report(&[0u8; 64]).is_err());

        platform.load(b"image", true).unwrap();
        let report = platform.create_report(&[3u8; 64]).unwrap();
        assert!(report.body.debug);
        assert_eq!(report.body.report_data, [3u8; 64]);
        assert!(platform.verify_report(&report));

        let mut forged = report;
        forged.body.debug = false;
        assert!(!platform.verify_report(&forged));
    }

    #[test]
    fn test_session_loss() {
        let platform = platform_with("signer", 1);
        platform.load(b"image", false).unwrap();
        platform.simulate_session_loss();

        assert!(!platform.session_alive());
        assert!(matches!(
            platform.create_report(&[0u8; 64]),
            Err(TeeError::EnclaveLost)
        ));

        platform.load(b"image", false).unwrap();
        assert!(platform.session_alive());
    }

    #[test]
    fn test_fill_entropy() {
        let platform = platform_with("signer", 1);
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        platform.fill_entropy(&mut a).unwrap();
        platform.fill_entropy(&mut b).unwrap();
        assert_ne!(a, b);
    }
}
