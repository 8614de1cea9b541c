// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publishing release targets into a signed TUF repository.

The repository is a filesystem tree with `metadata/` and `targets/`
directories, served to clients over plain HTTP(S). Role chain semantics come
from the TUF library; this module only stages target files and drives the
re-sign on commit.

A [RepositoryHandle] buffers target files in a staging directory owned by
the release task. Nothing becomes visible to readers until [commit]: target
files are copied into place first, then the freshly signed metadata files
are renamed in with `timestamp.json` last, which is the file readers fetch
first, so the new state appears atomically from their point of view.

[commit]: RepositoryHandle::commit
*/

use {
    crate::{
        config::RepositoryConfig,
        error::{PipelineError, Result},
    },
    chrono::{DateTime, Duration, Utc},
    log::{debug, info},
    olpc_cjson::CanonicalFormatter,
    ring::rand::SystemRandom,
    serde::Serialize,
    std::{
        collections::HashMap,
        fs::File,
        io::Read,
        num::NonZeroU64,
        path::{Path, PathBuf},
    },
    tempfile::TempDir,
    tough::{
        editor::RepositoryEditor,
        key_source::{KeySource, LocalKeySource},
        schema::{
            decoded::{Decoded, Hex},
            key::Key,
            RoleKeys, RoleType, Root, Signature, Signed, Target,
        },
        ExpirationEnforcement, FilesystemTransport, RepositoryLoader, TargetName,
    },
    url::Url,
};

const TUF_SPEC_VERSION: &str = "1.0.0";

/// How long a bootstrapped root role stays valid.
const ROOT_EXPIRATION_DAYS: i64 = 3650;

/// A mutable handle on the TUF repository for the duration of one task.
///
/// Not thread-safe; the release task owns it exclusively.
pub struct RepositoryHandle {
    config: RepositoryConfig,
    staging: TempDir,
    staged: Vec<(String, PathBuf)>,
}

impl RepositoryHandle {
    /// Open a handle on the repository described by `config`.
    pub fn open(config: &RepositoryConfig) -> Result<Self> {
        let root_json = config.tuf_repo_root.join("metadata").join("root.json");
        if !root_json.is_file() {
            return Err(PipelineError::Other(format!(
                "TUF repository not initialized: {} missing",
                root_json.display()
            )));
        }

        Ok(Self {
            config: config.clone(),
            staging: TempDir::new()?,
            staged: vec![],
        })
    }

    /// Stage one release target at `releases/<release>/<name>`.
    pub fn publish_release_target(
        &mut self,
        release: &str,
        name: &str,
        reader: &mut impl Read,
    ) -> Result<()> {
        self.stage_target(format!("releases/{}/{}", release, trim_entry_name(name)), reader)
    }

    /// Stage the channel pointer `channels/<group>/<channel>`.
    ///
    /// The pointer file's whole content is the release name.
    pub fn publish_channel_release(
        &mut self,
        group: &str,
        channel: &str,
        release: &str,
    ) -> Result<()> {
        let content = format!("{}\n", release);

        self.stage_target(
            format!("channels/{}/{}", group, channel),
            &mut content.as_bytes(),
        )
    }

    fn stage_target(&mut self, target_name: String, reader: &mut impl Read) -> Result<()> {
        validate_target_name(&target_name)?;

        let dest = self.staging.path().join(&target_name);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = File::create(&dest)?;
        let written = std::io::copy(reader, &mut file)?;

        debug!("staged target {} ({} bytes)", target_name, written);
        self.staged.push((target_name, dest));

        Ok(())
    }

    /// Sign and persist the new repository state.
    ///
    /// Consuming the handle makes commit a one-shot operation. Any error
    /// before the metadata swap leaves the served repository unchanged.
    pub fn commit(self) -> Result<()> {
        let metadata_dir = self.config.tuf_repo_root.join("metadata");
        let targets_dir = self.config.tuf_repo_root.join("targets");
        let root_json = metadata_dir.join("root.json");

        let repo = load_filesystem_repository(&root_json, &metadata_dir, &targets_dir)?;

        let next_version = NonZeroU64::new(repo.targets().signed.version.get() + 1)
            .expect("incremented version is nonzero");
        let expires = Utc::now() + Duration::days(self.config.metadata_expiration_days);

        let mut editor = RepositoryEditor::from_repo(&root_json, repo)?;
        editor
            .targets_version(next_version)?
            .targets_expires(expires)?
            .snapshot_version(next_version)
            .snapshot_expires(expires)
            .timestamp_version(next_version)
            .timestamp_expires(expires);

        for (name, path) in &self.staged {
            editor.add_target(TargetName::new(name)?, Target::from_path(path)?)?;
        }

        let signed = editor.sign(&signing_keys(&self.config))?;

        let new_metadata = tempfile::tempdir_in(&self.config.tuf_repo_root)?;
        signed.write(new_metadata.path())?;

        // Target files first: they are invisible until metadata references
        // them.
        for (name, path) in &self.staged {
            let dest = targets_dir.join(name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(path, &dest)?;
        }

        swap_metadata_into_place(new_metadata.path(), &metadata_dir)?;

        info!(
            "committed TUF repository state v{} with {} staged targets",
            next_version,
            self.staged.len()
        );

        Ok(())
    }
}

/// Strip the leading `./` some tar producers put on entry names.
fn trim_entry_name(name: &str) -> &str {
    name.trim_start_matches("./")
}

fn validate_target_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && !name.split('/').any(|part| part.is_empty() || part == "." || part == "..");

    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidTargetName(
            name.to_string(),
            "target names must be clean relative paths".to_string(),
        ))
    }
}

fn load_filesystem_repository(
    root_json: &Path,
    metadata_dir: &Path,
    targets_dir: &Path,
) -> Result<tough::Repository> {
    Ok(RepositoryLoader::new(
        File::open(root_json)?,
        dir_url(metadata_dir)?,
        dir_url(targets_dir)?,
    )
    .transport(FilesystemTransport)
    // The publisher must be able to re-sign a tree whose metadata lapsed.
    .expiration_enforcement(ExpirationEnforcement::Unsafe)
    .load()?)
}

fn dir_url(path: &Path) -> Result<Url> {
    Url::from_directory_path(path)
        .map_err(|_| PipelineError::Other(format!("not an absolute path: {}", path.display())))
}

fn signing_keys(config: &RepositoryConfig) -> Vec<Box<dyn KeySource>> {
    config
        .signing_key_paths
        .iter()
        .map(|path| Box::new(LocalKeySource { path: path.clone() }) as Box<dyn KeySource>)
        .collect()
}

/// Move freshly written metadata files into the served directory.
///
/// `timestamp.json` goes last: readers start at the timestamp role, so the
/// rename that publishes it is the commit point.
fn swap_metadata_into_place(new_metadata: &Path, metadata_dir: &Path) -> Result<()> {
    let mut files = std::fs::read_dir(new_metadata)?
        .map(|entry| Ok(entry?.path()))
        .collect::<Result<Vec<_>>>()?;

    files.sort_by_key(|path| {
        (
            path.file_name() == Some(std::ffi::OsStr::new("timestamp.json")),
            path.clone(),
        )
    });

    for path in files {
        let file_name = path
            .file_name()
            .ok_or_else(|| PipelineError::Other("metadata entry without a name".to_string()))?;
        std::fs::rename(&path, metadata_dir.join(file_name))?;
    }

    Ok(())
}

/// Generate a new ed25519 signing key at `path` (PKCS#8, raw DER).
pub fn write_new_signing_key(path: &Path) -> Result<()> {
    let document = ring::signature::Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
        .map_err(|e| PipelineError::Other(format!("key generation failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, document.as_ref())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Initialize an empty signed repository tree at the configured root.
///
/// All four top-level roles are held by the configured keys with a
/// threshold of 1. Consistent snapshots are disabled so target files live
/// at their plain paths.
pub fn init_repository(config: &RepositoryConfig) -> Result<()> {
    let metadata_dir = config.tuf_repo_root.join("metadata");
    let targets_dir = config.tuf_repo_root.join("targets");
    std::fs::create_dir_all(&metadata_dir)?;
    std::fs::create_dir_all(&targets_dir)?;

    let root_json = metadata_dir.join("root.json");
    if root_json.exists() {
        return Err(PipelineError::Other(format!(
            "refusing to re-initialize {}",
            root_json.display()
        )));
    }

    let signed_root = build_signed_root(config)?;
    std::fs::write(&root_json, serde_json::to_vec_pretty(&signed_root)?)?;
    std::fs::write(
        metadata_dir.join("1.root.json"),
        serde_json::to_vec_pretty(&signed_root)?,
    )?;

    // First signed, empty metadata set.
    let version = NonZeroU64::new(1).expect("1 is nonzero");
    let expires = Utc::now() + Duration::days(config.metadata_expiration_days);

    let mut editor = RepositoryEditor::new(&root_json)?;
    editor
        .targets_version(version)?
        .targets_expires(expires)?
        .snapshot_version(version)
        .snapshot_expires(expires)
        .timestamp_version(version)
        .timestamp_expires(expires);

    let signed = editor.sign(&signing_keys(config))?;

    let new_metadata = tempfile::tempdir_in(&config.tuf_repo_root)?;
    signed.write(new_metadata.path())?;
    swap_metadata_into_place(new_metadata.path(), &metadata_dir)?;

    info!(
        "initialized TUF repository at {}",
        config.tuf_repo_root.display()
    );

    Ok(())
}

fn build_signed_root(config: &RepositoryConfig) -> Result<Signed<Root>> {
    let expires: DateTime<Utc> = Utc::now() + Duration::days(ROOT_EXPIRATION_DAYS);

    let mut root = Root {
        spec_version: TUF_SPEC_VERSION.to_string(),
        consistent_snapshot: false,
        version: NonZeroU64::new(1).expect("1 is nonzero"),
        expires,
        keys: HashMap::new(),
        roles: [
            RoleType::Root,
            RoleType::Targets,
            RoleType::Snapshot,
            RoleType::Timestamp,
        ]
        .iter()
        .map(|&role| {
            (
                role,
                RoleKeys {
                    keyids: vec![],
                    threshold: NonZeroU64::new(1).expect("1 is nonzero"),
                    _extra: HashMap::new(),
                },
            )
        })
        .collect(),
        _extra: HashMap::new(),
    };

    let sources = signing_keys(config);

    for source in &sources {
        let key = source
            .as_sign()
            .map_err(|e| PipelineError::Other(format!("unusable signing key: {}", e)))?
            .tuf_key();
        let key_id = compute_key_id(&key)?;

        root.keys.insert(key_id.clone(), key);
        for role_keys in root.roles.values_mut() {
            role_keys.keyids.push(key_id.clone());
        }
    }

    let payload = canonical_json(&root)?;
    let rng = SystemRandom::new();

    let mut signatures = vec![];
    for source in &sources {
        let sign = source
            .as_sign()
            .map_err(|e| PipelineError::Other(format!("unusable signing key: {}", e)))?;
        let sig = sign
            .sign(&payload, &rng)
            .map_err(|e| PipelineError::Other(format!("root signing failed: {}", e)))?;

        signatures.push(Signature {
            keyid: compute_key_id(&sign.tuf_key())?,
            sig: sig.into(),
        });
    }

    Ok(Signed {
        signed: root,
        signatures,
    })
}

/// A key's id is the SHA-256 of its canonical JSON form.
fn compute_key_id(key: &Key) -> Result<Decoded<Hex>> {
    let data = canonical_json(key)?;
    let digest = ring::digest::digest(&ring::digest::SHA256, &data);

    Ok(digest.as_ref().to_vec().into())
}

fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
    value.serialize(&mut serializer)?;

    Ok(data)
}

/// Publish every non-directory entry of an artifact tar as a release target.
///
/// Returns the published target names in arrival order.
pub fn publish_artifact_tar(
    handle: &mut RepositoryHandle,
    release: &str,
    artifacts: impl Read,
) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(artifacts);
    let mut published = vec![];

    for entry in archive.entries()? {
        let mut entry = entry?;

        if entry.header().entry_type().is_dir() {
            continue;
        }

        let name = entry
            .path()?
            .to_string_lossy()
            .into_owned();
        let name = trim_entry_name(&name).to_string();
        if name.is_empty() {
            continue;
        }

        info!("publishing {} into the repository", name);
        handle.publish_release_target(release, &name, &mut entry)?;
        published.push(name);
    }

    Ok(published)
}
