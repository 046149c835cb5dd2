//! Neo Enclave
//!
//! Enclave-side operation surface for a trusted execution environment:
//! - Lifecycle of a single enclave instance
//! - Sealing of secrets to the enclave signer identity
//! - Attestation reports and quotes over the measured enclave state
//! - Key management, signatures, hashing, AEAD and randomness inside the boundary
//! - Memory- and time-bounded execution of untrusted scripts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Untrusted Host                         │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │        EnclaveBridge (status codes, size protocol)    │  │
//! │  └──────────────────────────┬────────────────────────────┘  │
//! ├─────────────────────────────┼───────────────────────────────┤
//! │                             │      Enclave                  │
//! │  ┌──────────────────────────┴────────────────────────────┐  │
//! │  │                Enclave (lifecycle)                    │  │
//! │  │  ┌──────────┐ ┌─────────────┐ ┌────────┐ ┌─────────┐  │  │
//! │  │  │ Sealing  │ │ Attestation │ │ Crypto │ │ Sandbox │  │  │
//! │  │  └──────────┘ └─────────────┘ └────────┘ └─────────┘  │  │
//! │  └──────────────────────────┬────────────────────────────┘  │
//! │                             │                               │
//! │  ┌──────────────────────────┴────────────────────────────┐  │
//! │  │        Platform (simulated or hardware)               │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use neo_enclave::{init_logging, Enclave, EnclaveConfig};
//!
//! # fn main() -> neo_enclave::TeeResult<()> {
//! let config = EnclaveConfig::load("enclave.toml")?;
//! init_logging(&config.logging)?;
//!
//! let enclave = Enclave::new(config)?;
//! enclave.init("enclave.signed.so", false)?;
//!
//! let sealed = enclave.seal(b"secret", b"context")?;
//! let unsealed = enclave.unseal_with_aad(&sealed, b"context")?;
//! assert_eq!(&unsealed[..], b"secret");
//!
//! enclave.destroy()?;
//! # Ok(())
//! # }
//! ```

pub mod attestation;
pub mod bridge;
pub mod config;
pub mod crypto;
pub mod enclave;
pub mod error;
pub mod platform;
pub mod sandbox;
pub mod telemetry;

pub use attestation::{
    AttestationReport, AttestationService, ChannelBinding, QuoteProvider, SimulatedQuoteProvider,
};
pub use bridge::{EnclaveBridge, ReportFields, ScriptResultHandle};
pub use config::EnclaveConfig;
pub use crypto::{CryptoService, KeyInfo};
pub use enclave::{calc_sealed_size, Enclave, EnclaveHandle, EnclaveState, HealthStatus, SealingService};
pub use error::{StatusCode, TeeError, TeeResult};
pub use platform::{EnclaveMode, Measurements, Platform, SimulatedPlatform};
pub use sandbox::{ScriptRequest, ScriptResult, ScriptSandbox};
pub use telemetry::{init_logging, LogConfig, LogFormat};
