// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("TUF repository error: {0:?}")]
    Tuf(#[from] tough::error::Error),

    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error(
        "unsupported channel {channel:?} specified, use one of the following: {supported:?}"
    )]
    UnsupportedChannel {
        channel: String,
        supported: &'static [&'static str],
    },

    #[error("channel not found locally (group: {group:?}, channel: {channel:?}); run an update first")]
    ChannelNotFoundLocally { group: String, channel: String },

    #[error("channel not found in the repository (group: {group:?}, channel: {channel:?})")]
    ChannelNotFoundInRepo { group: String, channel: String },

    #[error("release {release:?} not found locally (group: {group:?}, channel: {channel:?}); run an update first")]
    ReleaseNotFoundLocally {
        group: String,
        channel: String,
        release: String,
    },

    #[error("unexpected entries in release directory:\n - {}", entries.join("\n - "))]
    UnexpectedReleaseContents { entries: Vec<String> },

    #[error("bin directory not found in release directory (group: {group:?}, channel: {channel:?})")]
    BinDirNotFound { group: String, channel: String },

    #[error("several binaries found in release {release:?}: {}", names.join(", "))]
    SeveralBinariesFound {
        release: String,
        names: Vec<String>,
    },

    #[error("binary file {0:?} not found in release")]
    BinaryNotFound(String),

    #[error(
        "nothing found in the repository for group {group:?} channel {channel:?} os {os:?} arch {arch:?} (release {release:?})"
    )]
    NoReleaseTargetsForPlatform {
        group: String,
        channel: String,
        os: String,
        arch: String,
        release: String,
    },

    #[error("timed out after {seconds}s waiting for lock {name:?}")]
    LockTimeout { name: String, seconds: u64 },

    #[error("{0}")]
    Other(String),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, ClientError>;
