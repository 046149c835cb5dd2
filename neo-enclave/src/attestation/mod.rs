//! Remote attestation
//!
//! Reports carry measurements read from the platform, never from the
//! caller, plus a quote from an external [`QuoteProvider`].

mod quoting;
mod report;
mod service;

pub use quoting::{Quote, QuoteProvider, SimulatedQuoteProvider, ATTESTATION_KEY_ECDSA_P256};
pub use report::AttestationReport;
pub use service::{key_binding_digest, AttestationService, ChannelBinding};
