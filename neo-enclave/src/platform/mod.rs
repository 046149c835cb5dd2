//! Isolation substrate abstraction
//!
//! Everything the enclave needs from the hardware lives behind [`Platform`]:
//! image measurement, identity-bound key derivation, local reports and an
//! entropy source. [`SimulatedPlatform`] implements it in software.

mod simulated;

pub use simulated::SimulatedPlatform;

use crate::error::{TeeError, TeeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Size of a measurement (code or signer identity hash)
pub const MEASUREMENT_SIZE: usize = 32;

/// Size of caller-supplied report data
pub const REPORT_DATA_SIZE: usize = 64;

/// Size of a local report MAC
pub const REPORT_MAC_SIZE: usize = 32;

/// Execution mode of the isolation substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnclaveMode {
    /// Software simulation, no hardware protection
    Simulation,
    /// Real hardware isolation
    Hardware,
}

impl EnclaveMode {
    pub fn is_hardware(self) -> bool {
        self == EnclaveMode::Hardware
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            EnclaveMode::Simulation => 0,
            EnclaveMode::Hardware => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EnclaveMode::Simulation),
            1 => Some(EnclaveMode::Hardware),
            _ => None,
        }
    }
}

impl fmt::Display for EnclaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnclaveMode::Simulation => f.write_str("simulation"),
            EnclaveMode::Hardware => f.write_str("hardware"),
        }
    }
}

/// Code and signer identity of a loaded enclave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Measurements {
    /// Hash of the enclave code
    pub mr_enclave: [u8; MEASUREMENT_SIZE],
    /// Hash of the enclave signer identity
    pub mr_signer: [u8; MEASUREMENT_SIZE],
}

/// Parameters of an identity-bound key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRequest {
    /// Per-blob diversifier
    pub key_id: [u8; 32],
    /// Version of the master secret
    pub key_version: u16,
}

/// Body of a local report, as measured by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBody {
    pub mode: EnclaveMode,
    pub mr_enclave: [u8; MEASUREMENT_SIZE],
    pub mr_signer: [u8; MEASUREMENT_SIZE],
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub debug: bool,
    pub report_data: [u8; REPORT_DATA_SIZE],
}

impl ReportBody {
    /// Encoded size: mode, debug, prod id, svn, two measurements, report data
    pub const SIZE: usize = 1 + 1 + 2 + 2 + MEASUREMENT_SIZE * 2 + REPORT_DATA_SIZE;

    /// Fixed little-endian encoding
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.mode.as_u8();
        out[1] = u8::from(self.debug);
        out[2..4].copy_from_slice(&self.isv_prod_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.isv_svn.to_le_bytes());
        out[6..38].copy_from_slice(&self.mr_enclave);
        out[38..70].copy_from_slice(&self.mr_signer);
        out[70..].copy_from_slice(&self.report_data);
        out
    }

    pub fn from_bytes(data: &[u8]) -> TeeResult<Self> {
        if data.len() != Self::SIZE {
            return Err(TeeError::InvalidParameter(format!(
                "report body must be {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }

        let mode = EnclaveMode::from_u8(data[0]).ok_or_else(|| {
            TeeError::InvalidParameter(format!("unknown enclave mode {}", data[0]))
        })?;
        let debug = match data[1] {
            0 => false,
            1 => true,
            other => {
                return Err(TeeError::InvalidParameter(format!(
                    "invalid debug flag {}",
                    other
                )))
            }
        };

        let mut body = ReportBody {
            mode,
            mr_enclave: [0u8; MEASUREMENT_SIZE],
            mr_signer: [0u8; MEASUREMENT_SIZE],
            isv_prod_id: u16::from_le_bytes([data[2], data[3]]),
            isv_svn: u16::from_le_bytes([data[4], data[5]]),
            debug,
            report_data: [0u8; REPORT_DATA_SIZE],
        };
        body.mr_enclave.copy_from_slice(&data[6..38]);
        body.mr_signer.copy_from_slice(&data[38..70]);
        body.report_data.copy_from_slice(&data[70..]);
        Ok(body)
    }

    pub fn measurements(&self) -> Measurements {
        Measurements {
            mr_enclave: self.mr_enclave,
            mr_signer: self.mr_signer,
        }
    }
}

/// Report body authenticated with the platform report key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalReport {
    pub body: ReportBody,
    pub mac: [u8; REPORT_MAC_SIZE],
}

/// Hardware isolation substrate.
///
/// Implementations hold the identity of the currently loaded image; all
/// key derivation and reporting is bound to it.
pub trait Platform: Send + Sync {
    fn mode(&self) -> EnclaveMode;

    /// Measure `image` and open a session for it
    fn load(&self, image: &[u8], debug: bool) -> TeeResult<Measurements>;

    /// Close the session, if any
    fn unload(&self);

    /// Whether the session opened by `load` is still usable
    fn session_alive(&self) -> bool;

    /// Derive a 32-byte key bound to the loaded signer identity
    fn seal_key(&self, request: &KeyRequest) -> TeeResult<Zeroizing<[u8; 32]>>;

    /// Produce a report over the loaded identity carrying `report_data`.
    ///
    /// Measurements are taken from the session, never from the caller.
    fn create_report(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> TeeResult<LocalReport>;

    /// Check a report MAC produced by this platform
    fn verify_report(&self, report: &LocalReport) -> bool;

    /// Fill `dest` from the platform entropy source
    fn fill_entropy(&self, dest: &mut [u8]) -> TeeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body() -> ReportBody {
        ReportBody {
            mode: EnclaveMode::Simulation,
            mr_enclave: [0x11; 32],
            mr_signer: [0x22; 32],
            isv_prod_id: 7,
            isv_svn: 3,
            debug: true,
            report_data: [0x5a; 64],
        }
    }

    #[test]
    fn test_report_body_layout() {
        let body = sample_body();
        let bytes = body.to_bytes();

        assert_eq!(bytes.len(), 134);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..4], &7u16.to_le_bytes());
        assert_eq!(&bytes[6..38], &[0x11; 32]);
        assert_eq!(ReportBody::from_bytes(&bytes).unwrap(), body);
    }

    #[test]
    fn test_report_body_rejects_garbage() {
        let mut bytes = sample_body().to_bytes();
        assert!(ReportBody::from_bytes(&bytes[..100]).is_err());

        bytes[1] = 2;
        assert!(ReportBody::from_bytes(&bytes).is_err());

        bytes[1] = 0;
        bytes[0] = 9;
        assert!(ReportBody::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(EnclaveMode::Simulation.to_string(), "simulation");
        assert!(EnclaveMode::Hardware.is_hardware());
        assert!(!EnclaveMode::Simulation.is_hardware());
    }
}
