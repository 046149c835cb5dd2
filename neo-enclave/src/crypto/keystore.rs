//! In-enclave key table

use crate::crypto::ecdsa::{public_key_bytes, ECC256_PUBLIC_KEY_SIZE};
use crate::error::{TeeError, TeeResult};
use chrono::{DateTime, Utc};
use p256::ecdsa::SigningKey;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Longest accepted key id, in bytes
pub const MAX_KEY_ID_LEN: usize = 256;

struct KeyEntry {
    signing_key: SigningKey,
    public_key: [u8; ECC256_PUBLIC_KEY_SIZE],
    created_at: DateTime<Utc>,
}

/// Public description of a stored key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key_id: String,
    pub public_key: [u8; ECC256_PUBLIC_KEY_SIZE],
    pub created_at: DateTime<Utc>,
}

pub(crate) fn validate_key_id(key_id: &str) -> TeeResult<()> {
    if key_id.is_empty() || key_id.len() > MAX_KEY_ID_LEN {
        return Err(TeeError::InvalidParameter(format!(
            "key id must be 1..={} bytes, got {}",
            MAX_KEY_ID_LEN,
            key_id.len()
        )));
    }
    Ok(())
}

/// Signing keys by id. Private keys never leave this table except through
/// sealed export.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<String, KeyEntry>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `signing_key` under `key_id`; an existing id is never replaced
    pub fn insert(
        &self,
        key_id: &str,
        signing_key: SigningKey,
    ) -> TeeResult<[u8; ECC256_PUBLIC_KEY_SIZE]> {
        validate_key_id(key_id)?;

        let mut keys = self.keys.write();
        match keys.entry(key_id.to_string()) {
            Entry::Occupied(_) => Err(TeeError::KeyAlreadyExists(key_id.to_string())),
            Entry::Vacant(slot) => {
                let public_key = public_key_bytes(&signing_key);
                slot.insert(KeyEntry {
                    signing_key,
                    public_key,
                    created_at: Utc::now(),
                });
                Ok(public_key)
            }
        }
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.read().contains_key(key_id)
    }

    /// Run `f` against the private key of `key_id`
    pub fn with_signing_key<R>(
        &self,
        key_id: &str,
        f: impl FnOnce(&SigningKey) -> R,
    ) -> TeeResult<R> {
        let keys = self.keys.read();
        let entry = keys
            .get(key_id)
            .ok_or_else(|| TeeError::KeyNotFound(key_id.to_string()))?;
        Ok(f(&entry.signing_key))
    }

    pub fn public_key(&self, key_id: &str) -> TeeResult<[u8; ECC256_PUBLIC_KEY_SIZE]> {
        self.keys
            .read()
            .get(key_id)
            .map(|entry| entry.public_key)
            .ok_or_else(|| TeeError::KeyNotFound(key_id.to_string()))
    }

    pub fn remove(&self, key_id: &str) -> TeeResult<()> {
        self.keys
            .write()
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| TeeError::KeyNotFound(key_id.to_string()))
    }

    /// Stored keys ordered by id
    pub fn list(&self) -> Vec<KeyInfo> {
        let mut infos: Vec<KeyInfo> = self
            .keys
            .read()
            .iter()
            .map(|(key_id, entry)| KeyInfo {
                key_id: key_id.clone(),
                public_key: entry.public_key,
                created_at: entry.created_at,
            })
            .collect();
        infos.sort_by(|a, b| a.key_id.cmp(&b.key_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Drop every key; signing keys zeroize themselves on drop
    pub fn clear(&self) {
        self.keys.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ecdsa::generate_signing_key;
    use crate::crypto::EnclaveRng;

    #[test]
    fn test_insert_and_collision() {
        let rng = EnclaveRng::from_seed([3u8; 32]);
        let store = KeyStore::new();

        let public_key = store.insert("k1", generate_signing_key(&rng)).unwrap();
        assert_eq!(store.public_key("k1").unwrap(), public_key);

        let err = store.insert("k1", generate_signing_key(&rng)).unwrap_err();
        assert!(matches!(err, TeeError::KeyAlreadyExists(_)));
        assert_eq!(store.public_key("k1").unwrap(), public_key);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_key_id_bounds() {
        let rng = EnclaveRng::from_seed([3u8; 32]);
        let store = KeyStore::new();

        assert!(matches!(
            store.insert("", generate_signing_key(&rng)),
            Err(TeeError::InvalidParameter(_))
        ));
        let long = "x".repeat(MAX_KEY_ID_LEN + 1);
        assert!(store.insert(&long, generate_signing_key(&rng)).is_err());
        let max = "x".repeat(MAX_KEY_ID_LEN);
        assert!(store.insert(&max, generate_signing_key(&rng)).is_ok());
    }

    #[test]
    fn test_list_remove_clear() {
        let rng = EnclaveRng::from_seed([3u8; 32]);
        let store = KeyStore::new();
        for id in ["b", "a", "c"] {
            store.insert(id, generate_signing_key(&rng)).unwrap();
        }

        let ids: Vec<String> = store.list().into_iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        store.remove("b").unwrap();
        assert!(matches!(store.remove("b"), Err(TeeError::KeyNotFound(_))));
        assert!(!store.contains("b"));

        store.clear();
        assert!(store.is_empty());
        assert!(matches!(
            store.with_signing_key("a", |_| ()),
            Err(TeeError::KeyNotFound(_))
        ));
    }
}
