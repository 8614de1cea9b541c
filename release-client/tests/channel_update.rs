// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! End-to-end: publish a release with the pipeline, sync it with the client. */

use {
    release_client::{Client, ClientError},
    release_pipeline::{
        config::RepositoryConfig,
        publisher::{self, RepositoryHandle},
    },
    std::path::{Path, PathBuf},
    tempfile::TempDir,
};

const TOOL_CONTENT: &[u8] = b"#!/bin/sh\necho tool\n";
const README_CONTENT: &[u8] = b"release notes\n";

fn publish_fixture(scratch: &Path) -> RepositoryConfig {
    let key_path = scratch.join("signing.p8");
    publisher::write_new_signing_key(&key_path).unwrap();

    let config = RepositoryConfig {
        tuf_repo_root: scratch.join("repo"),
        signing_key_paths: vec![key_path],
        metadata_expiration_days: 30,
    };

    publisher::init_repository(&config).unwrap();

    let mut handle = RepositoryHandle::open(&config).unwrap();
    handle
        .publish_release_target("v1.0.0", "any-any/bin/tool", &mut &TOOL_CONTENT[..])
        .unwrap();
    handle
        .publish_release_target("v1.0.0", "any-any/README.md", &mut &README_CONTENT[..])
        .unwrap();
    handle
        .publish_channel_release("1.0", "stable", "v1.0.0")
        .unwrap();
    handle.commit().unwrap();

    config
}

fn bootstrapped_client(scratch: &Path, config: &RepositoryConfig) -> (Client, PathBuf) {
    let install_dir = scratch.join("install");

    // The trust anchor is installed when the directory is provisioned.
    std::fs::create_dir_all(install_dir.join(".meta")).unwrap();
    std::fs::copy(
        config.tuf_repo_root.join("metadata/root.json"),
        install_dir.join(".meta/root.json"),
    )
    .unwrap();

    let repo_url = url::Url::from_directory_path(&config.tuf_repo_root)
        .unwrap()
        .to_string();

    let client = Client::new(
        "project",
        &install_dir,
        &repo_url,
        scratch.join("locks"),
        scratch.join("tmp"),
    )
    .unwrap();

    (client, install_dir)
}

#[cfg(unix)]
fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[test]
fn update_channel_installs_the_platform_release() {
    let scratch = TempDir::new().unwrap();
    let config = publish_fixture(scratch.path());
    let (client, install_dir) = bootstrapped_client(scratch.path(), &config);

    client.update_channel("1.0", "stable").unwrap();

    let channel_file = install_dir.join("channels/1.0/stable");
    assert_eq!(std::fs::read(&channel_file).unwrap(), b"v1.0.0\n");

    let tool = install_dir.join("releases/v1.0.0/any-any/bin/tool");
    let readme = install_dir.join("releases/v1.0.0/any-any/README.md");
    assert_eq!(std::fs::read(&tool).unwrap(), TOOL_CONTENT);
    assert_eq!(std::fs::read(&readme).unwrap(), README_CONTENT);

    #[cfg(unix)]
    {
        assert_eq!(mode_of(&channel_file), 0o644);
        assert_eq!(mode_of(&tool), 0o755, "bin targets install executable");
        assert_eq!(mode_of(&readme), 0o644);
    }

    // Channel file + two release targets.
    assert_eq!(client.download_count(), 3);

    // The selectors resolve the installed binary.
    let bin = client
        .channel_release_bin_path("1.0", "stable", None)
        .unwrap();
    assert_eq!(bin, tool);
}

#[test]
fn repeated_update_downloads_nothing() {
    let scratch = TempDir::new().unwrap();
    let config = publish_fixture(scratch.path());
    let (client, install_dir) = bootstrapped_client(scratch.path(), &config);

    client.update_channel("1.0", "stable").unwrap();
    let after_first = client.download_count();

    #[cfg(unix)]
    {
        // Drop the executable bit; a no-op update must restore it.
        use std::os::unix::fs::PermissionsExt;
        let tool = install_dir.join("releases/v1.0.0/any-any/bin/tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o600)).unwrap();
    }

    client.update_channel("1.0", "stable").unwrap();
    assert_eq!(
        client.download_count(),
        after_first,
        "hash-equal files are not re-downloaded"
    );

    #[cfg(unix)]
    assert_eq!(
        mode_of(&install_dir.join("releases/v1.0.0/any-any/bin/tool")),
        0o755
    );
}

#[test]
fn corrupted_local_file_is_repaired() {
    let scratch = TempDir::new().unwrap();
    let config = publish_fixture(scratch.path());
    let (client, install_dir) = bootstrapped_client(scratch.path(), &config);

    client.update_channel("1.0", "stable").unwrap();

    let tool = install_dir.join("releases/v1.0.0/any-any/bin/tool");
    std::fs::write(&tool, b"tampered").unwrap();

    client.update_channel("1.0", "stable").unwrap();
    assert_eq!(std::fs::read(&tool).unwrap(), TOOL_CONTENT);
}

#[test]
fn unknown_channel_is_a_typed_error() {
    let scratch = TempDir::new().unwrap();
    let config = publish_fixture(scratch.path());
    let (client, _) = bootstrapped_client(scratch.path(), &config);

    let err = client.update_channel("1.0", "alpha").unwrap_err();
    assert!(matches!(err, ClientError::ChannelNotFoundInRepo { .. }));
}

#[test]
fn channel_moves_are_followed() {
    let scratch = TempDir::new().unwrap();
    let config = publish_fixture(scratch.path());
    let (client, install_dir) = bootstrapped_client(scratch.path(), &config);

    client.update_channel("1.0", "stable").unwrap();

    // A new release is published and the channel pointer moves.
    let mut handle = RepositoryHandle::open(&config).unwrap();
    handle
        .publish_release_target("v1.1.0", "any-any/bin/tool", &mut &b"newer tool"[..])
        .unwrap();
    handle
        .publish_channel_release("1.0", "stable", "v1.1.0")
        .unwrap();
    handle.commit().unwrap();

    client.update_channel("1.0", "stable").unwrap();

    assert_eq!(
        std::fs::read(install_dir.join("channels/1.0/stable")).unwrap(),
        b"v1.1.0\n"
    );
    assert_eq!(
        std::fs::read(install_dir.join("releases/v1.1.0/any-any/bin/tool")).unwrap(),
        b"newer tool"
    );
}
