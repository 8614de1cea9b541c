// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Counting distinct trusted signers on tags and commits.

A release tag is considered sufficiently signed when the number of distinct
trusted keys with a valid signature over it reaches the configured
threshold. Signatures come from two places: embedded in the object itself
(`git tag -s`, `git commit -S`) and detached signatures attached through the
signatures notes ref.

The signed payload is always the canonical object: the raw object database
bytes with any embedded signature stripped. Multiple signatures by the same
key count once; signatures by unknown keys are ignored.
*/

use {
    crate::{
        error::{PipelineError, Result},
        gitrepo::ClonedRepo,
        keys::TrustedKeys,
    },
    log::debug,
    pgp::{Deserializable, StandaloneSignature},
    std::collections::HashSet,
};

const PGP_SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
const PGP_SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";

/// A git object reduced to its signature-relevant parts.
struct SignedObject {
    oid: git2::Oid,
    /// Canonical signed payload: raw object bytes minus the embedded
    /// signature.
    payload: Vec<u8>,
    /// The embedded armored signature, if the object carries one.
    embedded: Option<String>,
}

/// Verify that `tag` carries signatures from at least `required` distinct
/// trusted signers.
///
/// An annotated tag is verified over the tag object; a lightweight tag
/// degrades to verifying the commit it points to.
pub fn verify_tag_signatures(
    repo: &ClonedRepo,
    tag: &str,
    trusted_keys: &TrustedKeys,
    required: u64,
) -> Result<()> {
    if required == 0 {
        return Ok(());
    }

    let object = repo
        .repo()
        .revparse_single(&format!("refs/tags/{}", tag))
        .map_err(|_| PipelineError::TagNotFound(tag.to_string()))?;

    let signed = match object.kind() {
        Some(git2::ObjectType::Tag) => tag_signed_object(repo, object.id())?,
        _ => commit_signed_object(repo, object.peel_to_commit()?.id())?,
    };

    verify_signed_object(repo, &signed, trusted_keys, required)
}

/// Verify that the commit named by `commit_hash` carries signatures from at
/// least `required` distinct trusted signers.
pub fn verify_commit_signatures(
    repo: &ClonedRepo,
    commit_hash: &str,
    trusted_keys: &TrustedKeys,
    required: u64,
) -> Result<()> {
    if required == 0 {
        return Ok(());
    }

    let oid = git2::Oid::from_str(commit_hash)?;
    let signed = commit_signed_object(repo, oid)?;

    verify_signed_object(repo, &signed, trusted_keys, required)
}

fn verify_signed_object(
    repo: &ClonedRepo,
    signed: &SignedObject,
    trusted_keys: &TrustedKeys,
    required: u64,
) -> Result<()> {
    let mut candidates = vec![];

    if let Some(embedded) = &signed.embedded {
        candidates.push(embedded.clone());
    }

    for note in repo.signature_notes(signed.oid) {
        candidates.extend(split_armored_signatures(&note));
    }

    let mut verified_fingerprints = HashSet::new();

    for armored in &candidates {
        let signature = match StandaloneSignature::from_string(armored) {
            Ok((signature, _)) => signature,
            Err(e) => {
                debug!("skipping unparseable signature on {}: {}", signed.oid, e);
                continue;
            }
        };

        for key in trusted_keys.iter() {
            if key.verifies(&signature, &signed.payload) {
                verified_fingerprints.insert(key.fingerprint());
            }
        }
    }

    let verified = verified_fingerprints.len() as u64;

    if verified >= required {
        Ok(())
    } else {
        Err(PipelineError::NotEnoughSignatures {
            missing: required - verified,
        })
    }
}

fn tag_signed_object(repo: &ClonedRepo, oid: git2::Oid) -> Result<SignedObject> {
    let raw = repo.raw_object(oid)?;
    let (payload, embedded) = strip_embedded_signature(&raw);

    Ok(SignedObject {
        oid,
        payload,
        embedded,
    })
}

fn commit_signed_object(repo: &ClonedRepo, oid: git2::Oid) -> Result<SignedObject> {
    match repo.repo().extract_signature(&oid, None) {
        Ok((signature, signed_data)) => Ok(SignedObject {
            oid,
            payload: signed_data.to_vec(),
            embedded: String::from_utf8(signature.to_vec()).ok(),
        }),
        // An unsigned commit still has a canonical payload for notes
        // signatures to verify over.
        Err(_) => Ok(SignedObject {
            oid,
            payload: repo.raw_object(oid)?,
            embedded: None,
        }),
    }
}

/// Split raw object bytes into (payload, embedded armored signature).
///
/// Annotated tag objects store the signature as a trailing armored block
/// after the tag message.
pub(crate) fn strip_embedded_signature(raw: &[u8]) -> (Vec<u8>, Option<String>) {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => return (raw.to_vec(), None),
    };

    match text.find(PGP_SIGNATURE_BEGIN) {
        Some(index) => (
            text[..index].as_bytes().to_vec(),
            Some(text[index..].trim_end().to_string()),
        ),
        None => (raw.to_vec(), None),
    }
}

/// Extract every armored signature block from a notes body.
///
/// A note accumulates one block per `append`, so bodies routinely contain
/// several concatenated armors. Text outside the armor markers is ignored.
fn split_armored_signatures(note: &str) -> Vec<String> {
    let mut signatures = vec![];
    let mut current: Option<Vec<&str>> = None;

    for line in note.lines() {
        let trimmed = line.trim_end();

        if trimmed == PGP_SIGNATURE_BEGIN {
            current = Some(vec![trimmed]);
        } else if let Some(block) = &mut current {
            block.push(trimmed);

            if trimmed == PGP_SIGNATURE_END {
                signatures.push(block.join("\n"));
                current = None;
            }
        }
    }

    signatures
}
