// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Synchronizing a channel to the repository.

[Client::update_channel] brings the local installation in line with what
the repository publishes for a group/channel pair: refresh the verified
metadata, sync the channel pointer file, then sync every target of the
pointed-to release under the best matching platform prefix.

Files already byte-identical to their metadata are only re-chmodded, so a
repeat update with an unchanged remote performs no downloads.
*/

use {
    crate::{
        client::{validate_channel, Client, RELEASES_DIR},
        error::{ClientError, Result},
        locker::LockMode,
        tuf::{TargetMeta, TufRepository},
    },
    log::{debug, info},
    sha2::{Digest, Sha256},
    std::{
        collections::BTreeMap,
        fs::OpenOptions,
        io::Read,
        path::Path,
    },
};

const FILE_MODE_EXECUTABLE: u32 = 0o755;
const FILE_MODE_REGULAR: u32 = 0o644;

impl Client {
    /// Synchronize the local installation to `<group>/<channel>`.
    ///
    /// Runs under an exclusive cross-process lock named after the pair.
    pub fn update_channel(&self, group: &str, channel: &str) -> Result<()> {
        validate_channel(channel)?;

        let lock_name = Self::group_channel_lock_name(group, channel);

        self.locker.with_lock(
            &lock_name,
            LockMode::Exclusive,
            crate::client::DEFAULT_LOCKER_TIMEOUT,
            || {
                let repo = self.tuf.load()?;

                self.sync_channel(&repo, group, channel)?;
                self.sync_channel_release(&repo, group, channel)
            },
        )
    }

    fn sync_channel(&self, repo: &TufRepository, group: &str, channel: &str) -> Result<()> {
        let targets = repo.targets();

        let target_name = Self::channel_target_name(group, channel);
        let meta = targets
            .get(&target_name)
            .ok_or_else(|| ClientError::ChannelNotFoundInRepo {
                group: group.to_string(),
                channel: channel.to_string(),
            })?;

        self.sync_file(
            repo,
            &target_name,
            meta,
            &self.channel_path(group, channel),
            FILE_MODE_REGULAR,
        )
    }

    fn sync_channel_release(
        &self,
        repo: &TufRepository,
        group: &str,
        channel: &str,
    ) -> Result<()> {
        let release = self.channel_release(group, channel)?;

        let os = go_style_os(std::env::consts::OS);
        let arch = go_style_arch(std::env::consts::ARCH);

        let targets = repo.targets();
        let (prefix, selected) = select_release_prefix(&targets, &release, os, arch)
            .ok_or_else(|| ClientError::NoReleaseTargetsForPlatform {
                group: group.to_string(),
                channel: channel.to_string(),
                os: os.to_string(),
                arch: arch.to_string(),
                release: release.clone(),
            })?;

        info!(
            "syncing release {} ({} targets under {})",
            release,
            selected.len(),
            prefix
        );

        let bin_prefix = format!("{}bin/", prefix);

        for (name, meta) in selected {
            let mode = if name.starts_with(&bin_prefix) {
                FILE_MODE_EXECUTABLE
            } else {
                FILE_MODE_REGULAR
            };

            let dest = self.root_dir().join(name);
            self.sync_file(repo, name, meta, &dest, mode)?;
        }

        Ok(())
    }

    /// Make `dest` match the target's metadata, downloading only when the
    /// local content differs.
    fn sync_file(
        &self,
        repo: &TufRepository,
        name: &str,
        meta: &TargetMeta,
        dest: &Path,
        mode: u32,
    ) -> Result<()> {
        if dest.is_file() && file_matches_meta(dest, meta)? {
            debug!("{} is up to date", name);
            set_file_mode(dest, mode)?;

            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Stage the download and rename it in, so a failed or interrupted
        // transfer never leaves a half-written destination.
        let mut staged = tempfile::NamedTempFile::new_in(self.staging_dir())?;
        self.download_into(repo, name, &mut staged)?;

        staged
            .persist(dest)
            .map_err(|e| ClientError::Other(format!("installing {}: {}", dest.display(), e)))?;
        set_file_mode(dest, mode)?;

        debug!("downloaded {} to {}", name, dest.display());

        Ok(())
    }

    fn download_into(
        &self,
        repo: &TufRepository,
        name: &str,
        writer: &mut impl std::io::Write,
    ) -> Result<()> {
        self.downloads.set(self.downloads.get() + 1);
        repo.download(name, writer)?;

        Ok(())
    }
}

/// Pick the platform prefix to install from, in fallback order: exact
/// os-arch, os-any, any-arch, any-any. The first prefix with any targets
/// wins.
pub(crate) fn select_release_prefix<'t>(
    targets: &'t BTreeMap<String, TargetMeta>,
    release: &str,
    os: &str,
    arch: &str,
) -> Option<(String, BTreeMap<&'t str, &'t TargetMeta>)> {
    let release_prefix = format!("{}/{}", RELEASES_DIR, release);

    for platform_dir in [
        format!("{}-{}", os, arch),
        format!("{}-any", os),
        format!("any-{}", arch),
        "any-any".to_string(),
    ] {
        let prefix = format!("{}/{}/", release_prefix, platform_dir);

        let selected: BTreeMap<&str, &TargetMeta> = targets
            .range(prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&prefix))
            .map(|(name, meta)| (name.as_str(), meta))
            .collect();

        if !selected.is_empty() {
            return Some((prefix, selected));
        }
    }

    None
}

/// Whether the file's size and SHA-256 equal the target metadata.
fn file_matches_meta(path: &Path, meta: &TargetMeta) -> Result<bool> {
    let mut file = OpenOptions::new().read(true).open(path)?;

    if file.metadata()?.len() != meta.length {
        return Ok(false);
    }

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16384];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().as_slice() == meta.sha256)
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;

    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Platform names follow the `<goos>-<goarch>` convention of the target
/// path schema.
fn go_style_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn go_style_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

#[cfg(test)]
mod test {
    use {super::*, tempfile::TempDir};

    fn meta(content: &[u8]) -> TargetMeta {
        TargetMeta {
            length: content.len() as u64,
            sha256: Sha256::digest(content).to_vec(),
        }
    }

    fn targets_fixture(names: &[&str]) -> BTreeMap<String, TargetMeta> {
        names
            .iter()
            .map(|name| (name.to_string(), meta(b"content")))
            .collect()
    }

    #[test]
    fn exact_platform_prefix_wins() {
        let targets = targets_fixture(&[
            "releases/v1/linux-amd64/bin/tool",
            "releases/v1/linux-any/bin/tool",
            "releases/v1/any-any/bin/tool",
        ]);

        let (prefix, selected) =
            select_release_prefix(&targets, "v1", "linux", "amd64").unwrap();
        assert_eq!(prefix, "releases/v1/linux-amd64/");
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn fallback_walks_os_any_then_any_arch_then_any_any() {
        let targets = targets_fixture(&[
            "releases/v1/linux-any/bin/tool",
            "releases/v1/any-amd64/bin/tool",
            "releases/v1/any-any/bin/tool",
        ]);
        let (prefix, _) = select_release_prefix(&targets, "v1", "linux", "amd64").unwrap();
        assert_eq!(prefix, "releases/v1/linux-any/");

        let targets = targets_fixture(&[
            "releases/v1/any-amd64/bin/tool",
            "releases/v1/any-any/bin/tool",
        ]);
        let (prefix, _) = select_release_prefix(&targets, "v1", "linux", "amd64").unwrap();
        assert_eq!(prefix, "releases/v1/any-amd64/");

        let targets = targets_fixture(&["releases/v1/any-any/bin/tool"]);
        let (prefix, _) = select_release_prefix(&targets, "v1", "linux", "amd64").unwrap();
        assert_eq!(prefix, "releases/v1/any-any/");
    }

    #[test]
    fn unrelated_releases_do_not_match() {
        let targets = targets_fixture(&[
            "releases/v10/linux-amd64/bin/tool",
            "channels/1.0/stable",
        ]);

        assert!(select_release_prefix(&targets, "v1", "linux", "amd64").is_none());
    }

    #[test]
    fn file_meta_comparison_checks_length_and_hash() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("file");

        std::fs::write(&path, b"expected content")?;
        assert!(file_matches_meta(&path, &meta(b"expected content"))?);
        assert!(!file_matches_meta(&path, &meta(b"other content!!!"))?);
        assert!(!file_matches_meta(&path, &meta(b"longer than the file"))?);

        Ok(())
    }

    #[test]
    fn platform_names_follow_go_convention() {
        assert_eq!(go_style_os("macos"), "darwin");
        assert_eq!(go_style_os("linux"), "linux");
        assert_eq!(go_style_arch("x86_64"), "amd64");
        assert_eq!(go_style_arch("aarch64"), "arm64");
        assert_eq!(go_style_arch("riscv64"), "riscv64");
    }
}
