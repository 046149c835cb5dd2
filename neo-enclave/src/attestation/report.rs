//! Attestation report structures

use crate::error::TeeResult;
use crate::platform::{EnclaveMode, Measurements, ReportBody, MEASUREMENT_SIZE, REPORT_DATA_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Helper module for serializing/deserializing fixed-size byte arrays as hex
mod hex_array {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S, const N: usize>(data: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HexArrayVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for HexArrayVisitor<N> {
            type Value = [u8; N];

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a hex string of {} bytes", N)
            }

            fn visit_str<E>(self, v: &str) -> Result<[u8; N], E>
            where
                E: de::Error,
            {
                let bytes = hex::decode(v).map_err(de::Error::custom)?;
                if bytes.len() != N {
                    return Err(de::Error::custom(format!(
                        "expected {} bytes, got {}",
                        N,
                        bytes.len()
                    )));
                }
                let mut arr = [0u8; N];
                arr.copy_from_slice(&bytes);
                Ok(arr)
            }
        }

        deserializer.deserialize_str(HexArrayVisitor::<N>)
    }
}

/// Helper module for serializing/deserializing byte vectors as hex
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Measured identity of the running enclave plus quote evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationReport {
    /// Report version
    pub version: u16,
    /// Isolation mode the report was produced in
    pub mode: EnclaveMode,
    /// MRENCLAVE - hash of enclave code
    #[serde(with = "hex_array")]
    pub mr_enclave: [u8; MEASUREMENT_SIZE],
    /// MRSIGNER - hash of enclave signer
    #[serde(with = "hex_array")]
    pub mr_signer: [u8; MEASUREMENT_SIZE],
    /// ISV Product ID
    pub isv_prod_id: u16,
    /// ISV Security Version Number
    pub isv_svn: u16,
    /// Report data (caller-provided data bound to report, zero padded)
    #[serde(with = "hex_array")]
    pub report_data: [u8; REPORT_DATA_SIZE],
    /// Quote from the quoting collaborator
    #[serde(with = "hex_bytes")]
    pub quote: Vec<u8>,
    /// Enclave was launched in debug mode
    pub debug: bool,
    /// When the report was generated
    pub timestamp: DateTime<Utc>,
}

impl AttestationReport {
    /// Current report version
    pub const CURRENT_VERSION: u16 = 1;

    pub(crate) fn from_body(body: &ReportBody, quote: Vec<u8>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            mode: body.mode,
            mr_enclave: body.mr_enclave,
            mr_signer: body.mr_signer,
            isv_prod_id: body.isv_prod_id,
            isv_svn: body.isv_svn,
            report_data: body.report_data,
            quote,
            debug: body.debug,
            timestamp: Utc::now(),
        }
    }

    pub fn measurements(&self) -> Measurements {
        Measurements {
            mr_enclave: self.mr_enclave,
            mr_signer: self.mr_signer,
        }
    }

    /// Only non-debug reports from real hardware count as production
    /// evidence.
    pub fn is_production(&self) -> bool {
        !self.debug && self.mode.is_hardware()
    }

    /// Serialize report to JSON bytes
    pub fn to_bytes(&self) -> TeeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize report from JSON bytes
    pub fn from_bytes(data: &[u8]) -> TeeResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(debug: bool, mode: EnclaveMode) -> AttestationReport {
        let body = ReportBody {
            mode,
            mr_enclave: [0x11; 32],
            mr_signer: [0x22; 32],
            isv_prod_id: 1,
            isv_svn: 2,
            debug,
            report_data: [0x42; 64],
        };
        AttestationReport::from_body(&body, vec![1, 2, 3])
    }

    #[test]
    fn test_report_serialization() {
        let report = sample(true, EnclaveMode::Simulation);
        let bytes = report.to_bytes().unwrap();
        let restored = AttestationReport::from_bytes(&bytes).unwrap();
        assert_eq!(restored, report);

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["mr_enclave"], hex::encode([0x11u8; 32]));
        assert_eq!(json["quote"], "010203");
        assert_eq!(json["mode"], "simulation");
    }

    #[test]
    fn test_rejects_wrong_length_fields() {
        let report = sample(false, EnclaveMode::Hardware);
        let mut json: serde_json::Value = serde_json::to_value(&report).unwrap();
        json["mr_signer"] = serde_json::Value::String("abcd".to_string());
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(AttestationReport::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_debug_reports_are_not_production() {
        assert!(sample(false, EnclaveMode::Hardware).is_production());
        assert!(!sample(true, EnclaveMode::Hardware).is_production());
        assert!(!sample(false, EnclaveMode::Simulation).is_production());
    }
}
