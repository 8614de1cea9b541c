// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Shared fixtures for crate tests: throwaway PGP keys and git repositories. */

use {
    crate::error::Result,
    chrono::SubsecRound,
    git2::Repository,
    pgp::{
        crypto::{HashAlgorithm, SymmetricKeyAlgorithm},
        packet::{Packet, SignatureConfig, SignatureType, Subpacket},
        types::{CompressionAlgorithm, KeyTrait, KeyVersion, SecretKeyTrait},
        KeyType, SecretKeyParamsBuilder, SignedSecretKey,
    },
    smallvec::{smallvec, SmallVec},
    std::io::Cursor,
    tempfile::TempDir,
};

/// Generate a fresh signing key pair.
///
/// Returns the signed secret key and the ASCII armored public key the way
/// operators would register it.
pub fn generate_signing_key(email: &str) -> (SignedSecretKey, String) {
    let mut key_params = SecretKeyParamsBuilder::default();
    key_params
        .key_type(KeyType::EdDSA)
        .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES256])
        .preferred_hash_algorithms(smallvec![HashAlgorithm::SHA2_256])
        .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
        .can_create_certificates(false)
        .can_sign(true)
        .primary_user_id(email.to_string());

    let params = key_params.build().expect("key params are valid");
    let secret_key = params.generate().expect("key generation succeeds");
    let signed_secret = secret_key.sign(String::new).expect("self-sign succeeds");

    let public_key = signed_secret.public_key();
    let signed_public = public_key
        .sign(&signed_secret, String::new)
        .expect("self-sign succeeds");

    let armored = signed_public
        .to_armored_string(None)
        .expect("armoring succeeds");

    (signed_secret, armored)
}

/// Produce an ASCII armored detached signature over `data`.
pub fn armored_detached_signature(key: &SignedSecretKey, data: &[u8]) -> String {
    let hashed_subpackets = vec![
        Subpacket::IssuerFingerprint(KeyVersion::V4, SmallVec::from_slice(&key.fingerprint())),
        Subpacket::SignatureCreationTime(chrono::Utc::now().trunc_subsecs(0)),
    ];
    let unhashed_subpackets = vec![Subpacket::Issuer(key.key_id())];

    let config = SignatureConfig::new_v4(
        Default::default(),
        SignatureType::Binary,
        key.algorithm(),
        HashAlgorithm::SHA2_256,
        hashed_subpackets,
        unhashed_subpackets,
    );

    let signature = config
        .sign(key, String::new, Cursor::new(data.to_vec()))
        .expect("signing succeeds");

    let packet = Packet::Signature(signature);
    let mut writer = Cursor::new(Vec::<u8>::new());
    pgp::armor::write(&packet, pgp::armor::BlockType::Signature, &mut writer, None)
        .expect("armoring succeeds");

    String::from_utf8(writer.into_inner()).expect("armor is UTF-8")
}

/// A scratch git repository serving as the clone origin in tests.
pub struct GitFixture {
    dir: TempDir,
    repo: Repository,
}

impl GitFixture {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let repo = Repository::init(dir.path())?;

        {
            let mut config = repo.config()?;
            config.set_str("user.name", "Test Developer")?;
            config.set_str("user.email", "dev@example.com")?;
        }

        Ok(Self { dir, repo })
    }

    /// The fixture's path, usable as a clone URL.
    pub fn url(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    pub fn write_file(&self, rel_path: &str, data: &[u8]) -> Result<()> {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;

        Ok(())
    }

    /// Stage everything and commit.
    pub fn commit(&self, message: &str) -> Result<git2::Oid> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let signature = git2::Signature::now("Test Developer", "dev@example.com")?;

        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let parents = parent.iter().collect::<Vec<_>>();

        Ok(self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?)
    }

    pub fn head_commit(&self) -> Result<String> {
        Ok(self.repo.head()?.peel_to_commit()?.id().to_string())
    }

    pub fn lightweight_tag(&self, name: &str) -> Result<git2::Oid> {
        let head = self.repo.head()?.peel(git2::ObjectType::Commit)?;

        Ok(self.repo.tag_lightweight(name, &head, false)?)
    }

    /// Create an annotated tag and return the tag object's id.
    pub fn annotated_tag(&self, name: &str, message: &str) -> Result<git2::Oid> {
        let head = self.repo.head()?.peel(git2::ObjectType::Commit)?;
        let tagger = git2::Signature::now("Test Developer", "dev@example.com")?;

        Ok(self.repo.tag(name, &head, &tagger, message, false)?)
    }

    /// Append a detached signature over the object's canonical payload to
    /// its signatures note, the way the out-of-band signing tooling does.
    pub fn add_note_signature(&self, oid: git2::Oid, key: &SignedSecretKey) -> Result<()> {
        let raw = self.repo.odb()?.read(oid)?.data().to_vec();
        let (payload, _) = crate::signatures::strip_embedded_signature(&raw);

        let armored = armored_detached_signature(key, &payload);

        let existing = self
            .repo
            .find_note(Some(crate::gitrepo::SIGNATURES_NOTES_REF), oid)
            .ok()
            .and_then(|note| note.message().map(String::from))
            .unwrap_or_default();

        let body = format!("{}{}", existing, armored);

        let signature = git2::Signature::now("Test Developer", "dev@example.com")?;
        self.repo.note(
            &signature,
            &signature,
            Some(crate::gitrepo::SIGNATURES_NOTES_REF),
            oid,
            &body,
            true,
        )?;

        Ok(())
    }
}
