//! Enclave lifecycle and operation dispatch

use crate::attestation::{
    AttestationReport, AttestationService, ChannelBinding, QuoteProvider, SimulatedQuoteProvider,
};
use crate::config::EnclaveConfig;
use crate::crypto::{
    CryptoService, EnclaveRng, KeyInfo, AEAD_IV_SIZE, AEAD_KEY_SIZE, AEAD_TAG_SIZE,
    ECC256_PUBLIC_KEY_SIZE, ECC256_SIGN_SIZE, HASH_SIZE,
};
use crate::enclave::sealing::{SealingService, UnsealedData};
use crate::error::{TeeError, TeeResult};
use crate::platform::{EnclaveMode, Measurements, Platform, SimulatedPlatform};
use crate::sandbox::{ScriptRequest, ScriptResult, ScriptSandbox};
use parking_lot::RwLock;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use zeroize::Zeroizing;

/// Opaque 32-byte identity of a live enclave instance
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnclaveHandle([u8; 32]);

impl EnclaveHandle {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EnclaveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnclaveHandle({})", hex::encode(self.0))
    }
}

impl fmt::Display for EnclaveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveState {
    Uninitialized,
    Initialized,
    /// Hardware session gone; only `init` or `destroy` are accepted
    Lost,
    /// Terminal
    Destroyed,
}

/// Result of a health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub handle: EnclaveHandle,
    pub mode: EnclaveMode,
    pub debug: bool,
    pub measurements: Measurements,
    pub key_count: usize,
}

/// Services bound to one initialization
struct EnclaveInstance {
    handle: EnclaveHandle,
    debug: bool,
    sealing: Arc<SealingService>,
    attestation: AttestationService,
    crypto: CryptoService,
    sandbox: ScriptSandbox,
}

enum Lifecycle {
    Uninitialized,
    Initialized(Arc<EnclaveInstance>),
    Lost,
    Destroyed,
}

impl Lifecycle {
    fn state(&self) -> EnclaveState {
        match self {
            Lifecycle::Uninitialized => EnclaveState::Uninitialized,
            Lifecycle::Initialized(_) => EnclaveState::Initialized,
            Lifecycle::Lost => EnclaveState::Lost,
            Lifecycle::Destroyed => EnclaveState::Destroyed,
        }
    }
}

/// The single enclave instance and its operation surface.
///
/// Lifecycle state sits behind a lock; the live instance is shared by
/// `Arc`, so a long script run does not block other operations.
pub struct Enclave {
    config: EnclaveConfig,
    platform: Arc<dyn Platform>,
    quote_provider: Option<Arc<dyn QuoteProvider>>,
    lifecycle: RwLock<Lifecycle>,
}

impl Enclave {
    /// Enclave on the simulated platform with the simulated quoting enclave
    pub fn new(config: EnclaveConfig) -> TeeResult<Self> {
        config.validate()?;
        let platform: Arc<dyn Platform> =
            Arc::new(SimulatedPlatform::new(&config.platform, &config.sealing)?);
        let quote_provider: Arc<dyn QuoteProvider> =
            Arc::new(SimulatedQuoteProvider::new(platform.clone())?);
        Self::with_components(config, platform, Some(quote_provider))
    }

    /// Enclave on an explicit platform and quoting collaborator
    pub fn with_components(
        config: EnclaveConfig,
        platform: Arc<dyn Platform>,
        quote_provider: Option<Arc<dyn QuoteProvider>>,
    ) -> TeeResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            platform,
            quote_provider,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
        })
    }

    pub fn config(&self) -> &EnclaveConfig {
        &self.config
    }

    pub fn state(&self) -> EnclaveState {
        self.lifecycle.read().state()
    }

    /// Valid in any state
    pub fn is_hardware_mode(&self) -> bool {
        self.platform.mode().is_hardware()
    }

    /// Load the image at `path` and bring up all services.
    ///
    /// Rejected while initialized and after destroy; allowed again after
    /// the session was lost.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn init(&self, path: impl AsRef<Path>, debug_mode: bool) -> TeeResult<EnclaveHandle> {
        let mut lifecycle = self.lifecycle.write();
        match &*lifecycle {
            Lifecycle::Initialized(_) => {
                return Err(TeeError::InvalidEnclave(
                    "enclave already initialized".to_string(),
                ))
            }
            Lifecycle::Destroyed => {
                return Err(TeeError::InvalidEnclave("enclave destroyed".to_string()))
            }
            Lifecycle::Lost => {
                info!("reinitializing after lost session");
                self.platform.unload();
            }
            Lifecycle::Uninitialized => {}
        }

        let path = path.as_ref();
        let image = std::fs::read(path).map_err(|e| {
            TeeError::InvalidEnclave(format!(
                "cannot read enclave image {}: {}",
                path.display(),
                e
            ))
        })?;
        if image.is_empty() {
            return Err(TeeError::InvalidEnclave(format!(
                "enclave image {} is empty",
                path.display()
            )));
        }

        let measurements = self.platform.load(&image, debug_mode)?;
        let instance = match self.build_instance(measurements, debug_mode) {
            Ok(instance) => instance,
            Err(e) => {
                self.platform.unload();
                return Err(e);
            }
        };

        let handle = instance.handle;
        *lifecycle = Lifecycle::Initialized(Arc::new(instance));
        info!(
            %handle,
            mode = %self.platform.mode(),
            debug = debug_mode,
            mr_enclave = %hex::encode(measurements.mr_enclave),
            "enclave initialized"
        );
        Ok(handle)
    }

    fn build_instance(&self, measurements: Measurements, debug: bool) -> TeeResult<EnclaveInstance> {
        let rng = Arc::new(EnclaveRng::from_platform(self.platform.as_ref())?);
        let handle = EnclaveHandle(rng.array());
        let sealing = Arc::new(SealingService::new(
            self.platform.clone(),
            rng.clone(),
            &self.config.sealing,
        ));
        let attestation = AttestationService::new(
            self.platform.clone(),
            self.quote_provider.clone(),
            measurements,
            &self.config.attestation,
        );
        let crypto = CryptoService::new(rng, sealing.clone());
        let sandbox = ScriptSandbox::new(&self.config.sandbox)?;

        Ok(EnclaveInstance {
            handle,
            debug,
            sealing,
            attestation,
            crypto,
            sandbox,
        })
    }

    /// Tear down the instance and wipe its keys. Terminal.
    #[instrument(skip(self))]
    pub fn destroy(&self) -> TeeResult<()> {
        let mut lifecycle = self.lifecycle.write();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Destroyed) {
            Lifecycle::Initialized(instance) => {
                instance.crypto.clear();
                self.platform.unload();
                info!(handle = %instance.handle, "enclave destroyed");
                Ok(())
            }
            Lifecycle::Lost => {
                self.platform.unload();
                info!("lost enclave destroyed");
                Ok(())
            }
            Lifecycle::Uninitialized => {
                *lifecycle = Lifecycle::Uninitialized;
                Err(TeeError::EnclaveNotInitialized)
            }
            Lifecycle::Destroyed => Err(TeeError::InvalidEnclave(
                "enclave already destroyed".to_string(),
            )),
        }
    }

    pub fn health_check(&self) -> TeeResult<HealthStatus> {
        self.with_instance(|instance| {
            Ok(HealthStatus {
                handle: instance.handle,
                mode: self.platform.mode(),
                debug: instance.debug,
                measurements: instance.attestation.get_measurements(),
                key_count: instance.crypto.key_count(),
            })
        })
    }

    pub fn handle(&self) -> TeeResult<EnclaveHandle> {
        self.with_instance(|instance| Ok(instance.handle))
    }

    fn instance(&self) -> TeeResult<Arc<EnclaveInstance>> {
        let instance = match &*self.lifecycle.read() {
            Lifecycle::Initialized(instance) => instance.clone(),
            Lifecycle::Uninitialized | Lifecycle::Destroyed => {
                return Err(TeeError::EnclaveNotInitialized)
            }
            Lifecycle::Lost => return Err(TeeError::EnclaveLost),
        };

        if !self.platform.session_alive() {
            self.mark_lost(&instance);
            return Err(TeeError::EnclaveLost);
        }
        Ok(instance)
    }

    /// Run `f` against the live instance; a lost session observed by `f`
    /// moves the enclave to `Lost`
    fn with_instance<R>(
        &self,
        f: impl FnOnce(&EnclaveInstance) -> TeeResult<R>,
    ) -> TeeResult<R> {
        let instance = self.instance()?;
        let result = f(&instance);
        if matches!(result, Err(TeeError::EnclaveLost)) {
            self.mark_lost(&instance);
        }
        result
    }

    fn mark_lost(&self, instance: &Arc<EnclaveInstance>) {
        let mut lifecycle = self.lifecycle.write();
        if let Lifecycle::Initialized(current) = &*lifecycle {
            if Arc::ptr_eq(current, instance) {
                current.crypto.clear();
                *lifecycle = Lifecycle::Lost;
                error!(handle = %instance.handle, "enclave session lost, reinitialization required");
            }
        }
    }

    // Sealing

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> TeeResult<Vec<u8>> {
        self.with_instance(|instance| instance.sealing.seal(plaintext, aad))
    }

    pub fn seal_into(&self, plaintext: &[u8], aad: &[u8], out: &mut [u8]) -> TeeResult<usize> {
        self.with_instance(|instance| instance.sealing.seal_into(plaintext, aad, out))
    }

    pub fn unseal(&self, sealed: &[u8]) -> TeeResult<UnsealedData> {
        self.with_instance(|instance| instance.sealing.unseal(sealed))
    }

    pub fn unseal_with_aad(
        &self,
        sealed: &[u8],
        expected_aad: &[u8],
    ) -> TeeResult<Zeroizing<Vec<u8>>> {
        self.with_instance(|instance| instance.sealing.unseal_with_aad(sealed, expected_aad))
    }

    pub fn unseal_into(&self, sealed: &[u8], out: &mut [u8]) -> TeeResult<usize> {
        self.with_instance(|instance| instance.sealing.unseal_into(sealed, out))
    }

    // Attestation

    pub fn generate_attestation(&self, report_data: &[u8]) -> TeeResult<AttestationReport> {
        self.with_instance(|instance| instance.attestation.generate_attestation(report_data))
    }

    pub fn get_measurements(&self) -> TeeResult<Measurements> {
        self.with_instance(|instance| Ok(instance.attestation.get_measurements()))
    }

    /// Attest that `key_id`'s public key was generated inside this enclave
    pub fn attest_public_key(&self, key_id: &str) -> TeeResult<AttestationReport> {
        self.with_instance(|instance| {
            let public_key = instance.crypto.public_key(key_id)?;
            instance.attestation.attest_public_key(&public_key)
        })
    }

    /// Attest this enclave to the peer of one TLS session
    pub fn attest_channel(&self, binding: &ChannelBinding) -> TeeResult<AttestationReport> {
        self.with_instance(|instance| instance.attestation.attest_channel(binding))
    }

    // Crypto

    pub fn generate_keypair(&self, key_id: &str) -> TeeResult<[u8; ECC256_PUBLIC_KEY_SIZE]> {
        self.with_instance(|instance| instance.crypto.generate_keypair(key_id))
    }

    pub fn sign(&self, key_id: &str, data: &[u8]) -> TeeResult<[u8; ECC256_SIGN_SIZE]> {
        self.with_instance(|instance| instance.crypto.sign(key_id, data))
    }

    pub fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> TeeResult<bool> {
        self.with_instance(|instance| instance.crypto.verify(public_key, data, signature))
    }

    pub fn hash(&self, data: &[u8]) -> TeeResult<[u8; HASH_SIZE]> {
        self.with_instance(|instance| Ok(instance.crypto.hash(data)))
    }

    pub fn aead_encrypt(
        &self,
        key: &[u8; AEAD_KEY_SIZE],
        iv: &[u8; AEAD_IV_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> TeeResult<(Vec<u8>, [u8; AEAD_TAG_SIZE])> {
        self.with_instance(|instance| instance.crypto.aead_encrypt(key, iv, plaintext, aad))
    }

    pub fn aead_decrypt(
        &self,
        key: &[u8; AEAD_KEY_SIZE],
        iv: &[u8; AEAD_IV_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
        tag: &[u8; AEAD_TAG_SIZE],
    ) -> TeeResult<Zeroizing<Vec<u8>>> {
        self.with_instance(|instance| {
            instance.crypto.aead_decrypt(key, iv, ciphertext, aad, tag)
        })
    }

    pub fn random_bytes(&self, len: usize) -> TeeResult<Vec<u8>> {
        self.with_instance(|instance| instance.crypto.random_bytes(len))
    }

    pub fn fill_random(&self, dest: &mut [u8]) -> TeeResult<()> {
        self.with_instance(|instance| instance.crypto.fill_random(dest))
    }

    pub fn public_key(&self, key_id: &str) -> TeeResult<[u8; ECC256_PUBLIC_KEY_SIZE]> {
        self.with_instance(|instance| instance.crypto.public_key(key_id))
    }

    pub fn list_keys(&self) -> TeeResult<Vec<KeyInfo>> {
        self.with_instance(|instance| Ok(instance.crypto.list_keys()))
    }

    pub fn delete_key(&self, key_id: &str) -> TeeResult<()> {
        self.with_instance(|instance| instance.crypto.delete_key(key_id))
    }

    pub fn export_sealed_key(&self, key_id: &str) -> TeeResult<Vec<u8>> {
        self.with_instance(|instance| instance.crypto.export_sealed_key(key_id))
    }

    pub fn import_sealed_key(
        &self,
        key_id: &str,
        sealed: &[u8],
    ) -> TeeResult<[u8; ECC256_PUBLIC_KEY_SIZE]> {
        self.with_instance(|instance| instance.crypto.import_sealed_key(key_id, sealed))
    }

    // Script sandbox

    /// Run a script; blocks for at most the request timeout
    pub fn execute_script(&self, request: &ScriptRequest) -> TeeResult<ScriptResult> {
        self.with_instance(|instance| instance.sandbox.execute(request))
    }
}

impl Drop for Enclave {
    fn drop(&mut self) {
        if let Lifecycle::Initialized(instance) = &*self.lifecycle.get_mut() {
            instance.crypto.clear();
            self.platform.unload();
            warn!(handle = %instance.handle, "enclave dropped without destroy");
        }
    }
}
