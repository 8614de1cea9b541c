// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading the release repository through the TUF client.

Role chain validation, metadata freshness, and download integrity all come
from the TUF library; this module narrows its surface to what the update
loop needs: list the targets, download one target. The local trust anchor
is `root.json` inside the client's `.meta` directory, installed when the
client directory is first provisioned.

A refresh is a fresh load of the repository: an unchanged remote snapshot
simply loads to the same state, so "already up to date" is a success, not
an error.
*/

use {
    crate::error::{ClientError, Result},
    std::{
        collections::BTreeMap,
        fs::File,
        io::Write,
        path::{Path, PathBuf},
    },
    tough::{DefaultTransport, FilesystemTransport, RepositoryLoader, TargetName},
    url::Url,
};

/// Size and hash of one target, as recorded in signed metadata.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetMeta {
    pub length: u64,
    pub sha256: Vec<u8>,
}

/// Remote repository coordinates plus the local trust store.
pub struct TufSource {
    root_path: PathBuf,
    datastore: PathBuf,
    metadata_url: Url,
    targets_url: Url,
}

impl TufSource {
    /// Bind to the repository at `repo_url`, trusting `meta_dir/root.json`.
    ///
    /// The repository serves metadata under `<repo_url>/metadata/` and
    /// target files under `<repo_url>/targets/`.
    pub fn new(meta_dir: &Path, repo_url: &str) -> Result<Self> {
        // Trailing slashes are significant to Url::join.
        let mut base = repo_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)?;

        Ok(Self {
            root_path: meta_dir.join("root.json"),
            datastore: meta_dir.join("datastore"),
            metadata_url: base.join("metadata/")?,
            targets_url: base.join("targets/")?,
        })
    }

    /// Fetch and verify the repository state.
    pub fn load(&self) -> Result<TufRepository> {
        std::fs::create_dir_all(&self.datastore)?;

        let root = File::open(&self.root_path).map_err(|e| {
            ClientError::Other(format!(
                "trusted root {} unreadable: {}",
                self.root_path.display(),
                e
            ))
        })?;

        let loader = RepositoryLoader::new(
            root,
            self.metadata_url.clone(),
            self.targets_url.clone(),
        )
        .datastore(&self.datastore);

        let repo = if self.metadata_url.scheme() == "file" {
            loader.transport(FilesystemTransport).load()?
        } else {
            loader.transport(DefaultTransport::new()).load()?
        };

        Ok(TufRepository { repo })
    }
}

/// A loaded, verified repository snapshot.
pub struct TufRepository {
    repo: tough::Repository,
}

impl TufRepository {
    /// All targets with their metadata, keyed by target name.
    pub fn targets(&self) -> BTreeMap<String, TargetMeta> {
        self.repo
            .targets()
            .signed
            .targets
            .iter()
            .map(|(name, target)| {
                (
                    name.raw().to_string(),
                    TargetMeta {
                        length: target.length,
                        sha256: target.hashes.sha256.to_vec(),
                    },
                )
            })
            .collect()
    }

    /// Stream one target into `writer`.
    ///
    /// The library verifies length and hash; a mismatch surfaces as a read
    /// error before the final byte is delivered.
    pub fn download(&self, name: &str, writer: &mut impl Write) -> Result<u64> {
        let target_name = TargetName::new(name)?;

        let mut reader = self
            .repo
            .read_target(&target_name)?
            .ok_or_else(|| ClientError::Other(format!("target {} vanished from metadata", name)))?;

        Ok(std::io::copy(&mut reader, writer)?)
    }
}
