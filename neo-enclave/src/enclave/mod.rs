//! Enclave lifecycle and sealing
//!
//! [`Enclave`] owns the single enclave instance and routes every operation
//! to it. Sealing binds data to the signer identity of the loaded image.

mod runtime;
mod sealing;

pub use runtime::{Enclave, EnclaveHandle, EnclaveState, HealthStatus};
pub use sealing::{
    calc_sealed_size, unsealed_len, SealingService, UnsealedData, SEALED_HEADER_SIZE,
    SEALED_OVERHEAD, SEAL_FORMAT_VERSION, SEAL_POLICY_SIGNER,
};
