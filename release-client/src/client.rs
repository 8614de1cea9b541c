// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The client installation directory and its selectors.

A client directory holds, per project:

- `.meta/`: the TUF trust anchor and metadata cache.
- `channels/<group>/<channel>`: channel pointer files naming a release.
- `releases/<release>/<os>-<arch>/...`: installed release files.

Selectors resolve the currently pointed-to release and its binaries from
that layout without touching the network; [Client::update_channel] in the
update module is what talks to the repository.
*/

use {
    crate::{
        error::{ClientError, Result},
        locker::FileLocker,
        tuf::TufSource,
    },
    std::{
        cell::Cell,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Channel names a group may publish.
pub const CHANNELS: [&str; 5] = ["alpha", "beta", "ea", "stable", "rock-solid"];

/// Default bound on waiting for another client invocation's lock.
pub const DEFAULT_LOCKER_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const CHANNELS_DIR: &str = "channels";
pub(crate) const RELEASES_DIR: &str = "releases";

/// Reject channel names outside the supported set.
pub fn validate_channel(channel: &str) -> Result<()> {
    if CHANNELS.contains(&channel) {
        Ok(())
    } else {
        Err(ClientError::UnsupportedChannel {
            channel: channel.to_string(),
            supported: &CHANNELS,
        })
    }
}

/// Whether self-update is disabled through the environment.
///
/// `TRDL_NO_SELF_UPDATE` set to `1`, `true` or `yes` disables it; anything
/// else, including unset, does not.
pub fn no_self_update_from_env() -> bool {
    matches!(
        std::env::var("TRDL_NO_SELF_UPDATE").as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// A per-project client bound to one installation directory.
pub struct Client {
    project_name: String,
    dir: PathBuf,
    tmp_dir: PathBuf,
    pub(crate) locker: FileLocker,
    pub(crate) tuf: TufSource,
    pub(crate) downloads: Cell<u64>,
}

impl Client {
    /// Construct a client for `project_name` installed under `dir`,
    /// synchronizing from the repository at `repo_url`.
    ///
    /// `locks_dir` holds cross-process lock files; `tmp_dir` holds download
    /// staging. The TUF trust anchor is expected at `<dir>/.meta/root.json`.
    pub fn new(
        project_name: &str,
        dir: impl Into<PathBuf>,
        repo_url: &str,
        locks_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let dir = dir.into();
        let tmp_dir = tmp_dir.into();

        let meta_dir = dir.join(".meta");
        std::fs::create_dir_all(&meta_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            project_name: project_name.to_string(),
            dir,
            tmp_dir,
            locker: FileLocker::new(locks_dir)?,
            tuf: TufSource::new(&meta_dir, repo_url)?,
            downloads: Cell::new(0),
        })
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// How many target downloads this client performed. Hash-equal files
    /// are skipped and do not count.
    pub fn download_count(&self) -> u64 {
        self.downloads.get()
    }

    /// Name of the channel target and also the channel's local path,
    /// relative to their respective roots.
    pub(crate) fn channel_target_name(group: &str, channel: &str) -> String {
        format!("{}/{}/{}", CHANNELS_DIR, group, channel)
    }

    pub(crate) fn channel_path(&self, group: &str, channel: &str) -> PathBuf {
        self.dir.join(CHANNELS_DIR).join(group).join(channel)
    }

    pub(crate) fn root_dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn staging_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub(crate) fn group_channel_lock_name(group: &str, channel: &str) -> String {
        format!("{}-{}", group, channel)
    }

    /// The release the channel currently points to, from the local channel
    /// file.
    pub fn channel_release(&self, group: &str, channel: &str) -> Result<String> {
        let path = self.channel_path(group, channel);

        if !path.is_file() {
            return Err(ClientError::ChannelNotFoundLocally {
                group: group.to_string(),
                channel: channel.to_string(),
            });
        }

        let data = std::fs::read_to_string(path)?;

        Ok(data.trim().to_string())
    }

    /// The single platform directory of the locally installed release.
    pub fn channel_release_dir(&self, group: &str, channel: &str) -> Result<(PathBuf, String)> {
        let release = self.channel_release(group, channel)?;
        let release_root = self.dir.join(RELEASES_DIR).join(&release);

        let mut entries = match std::fs::read_dir(&release_root) {
            Ok(entries) => entries
                .map(|entry| Ok(entry?.path()))
                .collect::<Result<Vec<_>>>()?,
            Err(_) => vec![],
        };
        entries.sort();

        match entries.len() {
            0 => Err(ClientError::ReleaseNotFoundLocally {
                group: group.to_string(),
                channel: channel.to_string(),
                release,
            }),
            1 => Ok((entries.remove(0), release)),
            _ => Err(ClientError::UnexpectedReleaseContents {
                entries: entries
                    .iter()
                    .map(|path| path.to_string_lossy().into_owned())
                    .collect(),
            }),
        }
    }

    /// The `bin` directory of the locally installed release.
    pub fn channel_release_bin_dir(&self, group: &str, channel: &str) -> Result<(PathBuf, String)> {
        let (release_dir, release) = self.channel_release_dir(group, channel)?;
        let bin_dir = release_dir.join("bin");

        if !bin_dir.is_dir() {
            return Err(ClientError::BinDirNotFound {
                group: group.to_string(),
                channel: channel.to_string(),
            });
        }

        Ok((bin_dir, release))
    }

    /// Path of the release binary, optionally selected by name.
    ///
    /// Without a name, the release must contain exactly one binary;
    /// several candidates produce an error listing their names.
    pub fn channel_release_bin_path(
        &self,
        group: &str,
        channel: &str,
        optional_bin_name: Option<&str>,
    ) -> Result<PathBuf> {
        let (bin_dir, release) = self.channel_release_bin_dir(group, channel)?;

        let mut matches = std::fs::read_dir(&bin_dir)?
            .map(|entry| Ok(entry?.path()))
            .collect::<Result<Vec<_>>>()?;
        matches.sort();

        if let Some(name) = optional_bin_name {
            matches.retain(|path| path.file_name().map(|f| f == name).unwrap_or(false));
        }

        match matches.len() {
            0 => Err(ClientError::BinaryNotFound(
                optional_bin_name.unwrap_or("").to_string(),
            )),
            1 => Ok(matches.remove(0)),
            _ => Err(ClientError::SeveralBinariesFound {
                release,
                names: matches
                    .iter()
                    .filter_map(|path| {
                        // A plain file-name strip, so binaries sharing
                        // characters with the directory path keep their
                        // full names.
                        path.strip_prefix(&bin_dir)
                            .ok()
                            .map(|rel| rel.to_string_lossy().into_owned())
                    })
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, tempfile::TempDir};

    fn scratch_client(dir: &Path) -> Client {
        Client::new(
            "project",
            dir.join("installation"),
            "https://repo.example.com/project",
            dir.join("locks"),
            dir.join("tmp"),
        )
        .unwrap()
    }

    #[test]
    fn channel_names_are_validated() {
        for channel in CHANNELS {
            validate_channel(channel).unwrap();
        }

        let err = validate_channel("nightly").unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedChannel { .. }));
    }

    #[test]
    fn missing_channel_file_is_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let client = scratch_client(dir.path());

        let err = client.channel_release("1.0", "stable").unwrap_err();
        assert!(matches!(err, ClientError::ChannelNotFoundLocally { .. }));
    }

    #[test]
    fn channel_release_trims_whitespace() {
        let dir = TempDir::new().unwrap();
        let client = scratch_client(dir.path());

        let channel_path = client.channel_path("1.0", "stable");
        std::fs::create_dir_all(channel_path.parent().unwrap()).unwrap();
        std::fs::write(&channel_path, "  v1.0.0\n").unwrap();

        assert_eq!(client.channel_release("1.0", "stable").unwrap(), "v1.0.0");
    }

    fn install_release(client: &Client, release: &str, files: &[&str]) {
        let platform_dir = client
            .root_dir()
            .join(RELEASES_DIR)
            .join(release)
            .join("any-any");

        for file in files {
            let path = platform_dir.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"bin").unwrap();
        }

        let channel_path = client.channel_path("1.0", "stable");
        std::fs::create_dir_all(channel_path.parent().unwrap()).unwrap();
        std::fs::write(channel_path, format!("{}\n", release)).unwrap();
    }

    #[test]
    fn sole_binary_resolves_without_a_name() {
        let dir = TempDir::new().unwrap();
        let client = scratch_client(dir.path());
        install_release(&client, "v1.0.0", &["bin/tool"]);

        let path = client
            .channel_release_bin_path("1.0", "stable", None)
            .unwrap();
        assert!(path.ends_with("releases/v1.0.0/any-any/bin/tool"));
    }

    #[test]
    fn several_binaries_require_a_name() {
        let dir = TempDir::new().unwrap();
        let client = scratch_client(dir.path());
        install_release(&client, "v1.0.0", &["bin/tool", "bin/toolctl"]);

        let err = client
            .channel_release_bin_path("1.0", "stable", None)
            .unwrap_err();
        match err {
            ClientError::SeveralBinariesFound { names, .. } => {
                // Names are intact even though they share characters with
                // the directory path.
                assert_eq!(names, vec!["tool".to_string(), "toolctl".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let path = client
            .channel_release_bin_path("1.0", "stable", Some("toolctl"))
            .unwrap();
        assert!(path.ends_with("bin/toolctl"));

        let err = client
            .channel_release_bin_path("1.0", "stable", Some("absent"))
            .unwrap_err();
        assert!(matches!(err, ClientError::BinaryNotFound(_)));
    }

    #[test]
    fn missing_bin_dir_is_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let client = scratch_client(dir.path());
        install_release(&client, "v1.0.0", &["README"]);

        let err = client
            .channel_release_bin_path("1.0", "stable", None)
            .unwrap_err();
        assert!(matches!(err, ClientError::BinDirNotFound { .. }));
    }

    #[test]
    fn extra_release_dir_entries_are_an_error() {
        let dir = TempDir::new().unwrap();
        let client = scratch_client(dir.path());
        install_release(&client, "v1.0.0", &["bin/tool"]);

        std::fs::create_dir_all(
            client
                .root_dir()
                .join(RELEASES_DIR)
                .join("v1.0.0")
                .join("linux-amd64"),
        )
        .unwrap();

        let err = client.channel_release_dir("1.0", "stable").unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedReleaseContents { .. }));
    }

    #[test]
    fn no_self_update_env_values() {
        // Runs serially within this test only; restore to not leak.
        for (value, expected) in [
            (Some("1"), true),
            (Some("true"), true),
            (Some("yes"), true),
            (Some("0"), false),
            (Some(""), false),
            (None, false),
        ] {
            match value {
                Some(v) => std::env::set_var("TRDL_NO_SELF_UPDATE", v),
                None => std::env::remove_var("TRDL_NO_SELF_UPDATE"),
            }
            assert_eq!(no_self_update_from_env(), expected, "value {:?}", value);
        }

        std::env::remove_var("TRDL_NO_SELF_UPDATE");
    }
}
