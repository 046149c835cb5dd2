//! Enclave configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty document is a
//! valid development configuration.

use crate::error::{TeeError, TeeResult};
use crate::telemetry::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound on quote size accepted from the quoting collaborator
pub const MAX_QUOTE_SIZE: usize = 4096;

const MIB: u64 = 1024 * 1024;

/// Top-level enclave configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Isolation substrate identity settings
    pub platform: PlatformConfig,
    /// Sealing key settings
    pub sealing: SealingConfig,
    /// Attestation settings
    pub attestation: AttestationConfig,
    /// Script sandbox limits
    pub sandbox: SandboxConfig,
    /// Logging
    pub logging: LogConfig,
}

impl EnclaveConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(document: &str) -> TeeResult<Self> {
        let config: Self = toml::from_str(document)
            .map_err(|e| TeeError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> TeeResult<Self> {
        let document = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&document)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> TeeResult<String> {
        toml::to_string_pretty(self).map_err(|e| TeeError::Serialization(e.to_string()))
    }

    /// Check internal consistency
    pub fn validate(&self) -> TeeResult<()> {
        self.platform.validate()?;

        if self.sealing.key_version == 0 {
            return Err(TeeError::Config(
                "sealing.key_version must be at least 1".to_string(),
            ));
        }

        if self.attestation.max_quote_size == 0 || self.attestation.max_quote_size > MAX_QUOTE_SIZE
        {
            return Err(TeeError::Config(format!(
                "attestation.max_quote_size must be within 1..={}",
                MAX_QUOTE_SIZE
            )));
        }

        self.sandbox.validate()
    }
}

/// Identity of the simulated isolation substrate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Identity of whoever signed the enclave image; scopes sealing keys
    pub signer_identity: String,

    /// Hex-encoded 32-byte platform fuse secret (development constant if unset)
    pub platform_secret: Option<String>,

    /// ISV product id reported in attestation
    pub isv_prod_id: u16,

    /// ISV security version reported in attestation
    pub isv_svn: u16,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            signer_identity: "neo-enclave-dev-signer".to_string(),
            platform_secret: None,
            isv_prod_id: 1,
            isv_svn: 1,
        }
    }
}

impl PlatformConfig {
    fn validate(&self) -> TeeResult<()> {
        if self.signer_identity.is_empty() {
            return Err(TeeError::Config(
                "platform.signer_identity must not be empty".to_string(),
            ));
        }
        if self.platform_secret.is_some() {
            self.decode_secret()?;
        }
        Ok(())
    }

    /// Decoded platform secret, if configured
    pub fn decode_secret(&self) -> TeeResult<Option<[u8; 32]>> {
        let Some(encoded) = self.platform_secret.as_deref() else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded)
            .map_err(|e| TeeError::Config(format!("platform.platform_secret: {}", e)))?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            TeeError::Config(format!(
                "platform.platform_secret must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Some(secret))
    }
}

/// Sealing key settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealingConfig {
    /// Master-secret version used for newly sealed blobs
    pub key_version: u16,
}

impl Default for SealingConfig {
    fn default() -> Self {
        Self { key_version: 1 }
    }
}

/// Attestation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    /// Largest quote accepted from the quoting collaborator
    pub max_quote_size: usize,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            max_quote_size: MAX_QUOTE_SIZE,
        }
    }
}

/// Script sandbox limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Memory limit applied when a request asks for 0
    #[serde(default = "default_memory_limit")]
    pub default_memory_limit: u64,

    /// Largest memory limit a request may ask for
    #[serde(default = "default_max_memory_limit")]
    pub max_memory_limit: u64,

    /// Timeout applied when a request asks for 0
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Largest timeout a request may ask for
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Epoch tick interval used for preemption
    #[serde(default = "default_epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Largest accepted script source
    #[serde(default = "default_max_script_size")]
    pub max_script_size: usize,

    /// Largest accepted JSON input
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,

    /// Largest JSON output a script may return
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,

    /// Number of compiled modules kept
    #[serde(default = "default_module_cache_capacity")]
    pub module_cache_capacity: usize,

    /// Log lines captured per execution
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// Bytes kept per captured log line
    #[serde(default = "default_max_log_line")]
    pub max_log_line: usize,
}

const fn default_memory_limit() -> u64 {
    128 * MIB
}

const fn default_max_memory_limit() -> u64 {
    512 * MIB
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_max_timeout_ms() -> u64 {
    300_000
}

const fn default_epoch_tick_ms() -> u64 {
    10
}

const fn default_max_script_size() -> usize {
    1024 * 1024
}

const fn default_max_input_size() -> usize {
    1024 * 1024
}

const fn default_max_output_size() -> usize {
    1024 * 1024
}

const fn default_module_cache_capacity() -> usize {
    32
}

const fn default_max_log_entries() -> usize {
    64
}

const fn default_max_log_line() -> usize {
    1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_memory_limit: default_memory_limit(),
            max_memory_limit: default_max_memory_limit(),
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            epoch_tick_ms: default_epoch_tick_ms(),
            max_script_size: default_max_script_size(),
            max_input_size: default_max_input_size(),
            max_output_size: default_max_output_size(),
            module_cache_capacity: default_module_cache_capacity(),
            max_log_entries: default_max_log_entries(),
            max_log_line: default_max_log_line(),
        }
    }
}

impl SandboxConfig {
    fn validate(&self) -> TeeResult<()> {
        let checks = [
            (self.default_memory_limit == 0, "sandbox.default_memory_limit"),
            (self.max_memory_limit == 0, "sandbox.max_memory_limit"),
            (self.default_timeout_ms == 0, "sandbox.default_timeout_ms"),
            (self.max_timeout_ms == 0, "sandbox.max_timeout_ms"),
            (self.epoch_tick_ms == 0, "sandbox.epoch_tick_ms"),
            (self.max_script_size == 0, "sandbox.max_script_size"),
            (self.max_output_size == 0, "sandbox.max_output_size"),
            (self.module_cache_capacity == 0, "sandbox.module_cache_capacity"),
        ];
        if let Some((_, name)) = checks.iter().find(|(zero, _)| *zero) {
            return Err(TeeError::Config(format!("{} must be non-zero", name)));
        }

        if self.default_memory_limit > self.max_memory_limit {
            return Err(TeeError::Config(
                "sandbox.default_memory_limit exceeds sandbox.max_memory_limit".to_string(),
            ));
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(TeeError::Config(
                "sandbox.default_timeout_ms exceeds sandbox.max_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }
}
