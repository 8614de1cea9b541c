// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The trusted PGP public key set.

Operators register the public keys whose signatures count towards a release's
required signer threshold. Keys are stored ASCII armored, one storage entry
per key, and deduplicated by primary key fingerprint on load.
*/

use {
    crate::{
        error::{PipelineError, Result},
        storage::Storage,
    },
    pgp::{types::KeyTrait, Deserializable, SignedPublicKey},
    std::{collections::HashSet, io::Cursor},
};

const STORAGE_KEY_PREFIX_TRUSTED_KEY: &str = "trusted_pgp_public_keys/";

/// A single trusted public key with verification helpers.
pub struct TrustedKey {
    key: SignedPublicKey,
}

impl TrustedKey {
    /// Parse an ASCII armored public key.
    pub fn from_armored(name: &str, armored: &str) -> Result<Self> {
        let (key, _) = SignedPublicKey::from_armor_single(Cursor::new(armored.as_bytes()))
            .map_err(|e| PipelineError::MalformedTrustedKey(name.to_string(), e))?;

        Ok(Self { key })
    }

    /// The hex encoded fingerprint of the primary key.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.key.fingerprint())
    }

    /// Whether `signature` verifies over `payload` with this key.
    ///
    /// Signatures made by a subkey credit the primary key, so the caller's
    /// distinct-signer accounting sees one signer per registered key no
    /// matter which of its subkeys did the signing.
    pub fn verifies(&self, signature: &pgp::StandaloneSignature, payload: &[u8]) -> bool {
        if signature.verify(&self.key, payload).is_ok() {
            return true;
        }

        self.key
            .public_subkeys
            .iter()
            .any(|subkey| signature.verify(subkey, payload).is_ok())
    }
}

/// The full set of trusted keys, deduplicated by fingerprint.
pub struct TrustedKeys {
    keys: Vec<TrustedKey>,
}

impl TrustedKeys {
    /// Construct from already parsed keys, deduplicating by fingerprint.
    pub fn from_keys(keys: Vec<TrustedKey>) -> Self {
        let mut seen = HashSet::new();
        let keys = keys
            .into_iter()
            .filter(|key| seen.insert(key.fingerprint()))
            .collect();

        Self { keys }
    }

    /// Parse a set of armored keys.
    pub fn from_armored(armored_keys: &[String]) -> Result<Self> {
        let keys = armored_keys
            .iter()
            .enumerate()
            .map(|(i, armored)| TrustedKey::from_armored(&format!("#{}", i), armored))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_keys(keys))
    }

    /// Load every registered key from storage.
    pub async fn load(storage: &dyn Storage) -> Result<Self> {
        let mut keys = vec![];

        for name in storage.list(STORAGE_KEY_PREFIX_TRUSTED_KEY).await? {
            let key = format!("{}{}", STORAGE_KEY_PREFIX_TRUSTED_KEY, name);
            if let Some(data) = storage.get(&key).await? {
                let armored = String::from_utf8(data)
                    .map_err(|e| PipelineError::MalformedTrustedKey(name.clone(), pgp::errors::Error::Message(e.to_string())))?;

                keys.push(TrustedKey::from_armored(&name, &armored)?);
            }
        }

        Ok(Self::from_keys(keys))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrustedKey> {
        self.keys.iter()
    }
}

/// Register a trusted public key under `name`.
///
/// The armored input is parsed before storing so malformed keys are rejected
/// at registration time rather than at verification time.
pub async fn store_trusted_key(storage: &dyn Storage, name: &str, armored: &str) -> Result<()> {
    TrustedKey::from_armored(name, armored)?;

    storage
        .put(
            &format!("{}{}", STORAGE_KEY_PREFIX_TRUSTED_KEY, name),
            armored.as_bytes(),
        )
        .await
}

/// Remove the trusted key registered under `name`.
pub async fn delete_trusted_key(storage: &dyn Storage, name: &str) -> Result<()> {
    storage
        .delete(&format!("{}{}", STORAGE_KEY_PREFIX_TRUSTED_KEY, name))
        .await
}

/// Names of all registered trusted keys, sorted.
pub async fn list_trusted_key_names(storage: &dyn Storage) -> Result<Vec<String>> {
    storage.list(STORAGE_KEY_PREFIX_TRUSTED_KEY).await
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{storage::MemoryStorage, testutil},
    };

    #[tokio::test]
    async fn keys_round_trip_through_storage() -> Result<()> {
        let storage = MemoryStorage::new();
        let (_, armored) = testutil::generate_signing_key("someone@example.com");

        store_trusted_key(&storage, "someone", &armored).await?;
        assert_eq!(
            list_trusted_key_names(&storage).await?,
            vec!["someone".to_string()]
        );

        let keys = TrustedKeys::load(&storage).await?;
        assert_eq!(keys.iter().count(), 1);

        delete_trusted_key(&storage, "someone").await?;
        assert!(TrustedKeys::load(&storage).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn malformed_key_is_rejected_at_registration() {
        let storage = MemoryStorage::new();

        let err = store_trusted_key(&storage, "bogus", "not a pgp key")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedTrustedKey(_, _)));
    }

    #[test]
    fn duplicate_fingerprints_are_deduplicated() {
        let (_, armored) = testutil::generate_signing_key("dup@example.com");

        let keys = TrustedKeys::from_armored(&[armored.clone(), armored]).unwrap();
        assert_eq!(keys.iter().count(), 1);
    }
}
