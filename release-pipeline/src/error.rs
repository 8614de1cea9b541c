// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("git error: {0:?}")]
    Git(#[from] git2::Error),

    #[error("PGP error: {0:?}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("hex parsing error: {0:?}")]
    Hex(#[from] hex::FromHexError),

    #[error("JSON serialization error: {0:?}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML parsing error: {0:?}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("TUF repository error: {0:?}")]
    Tuf(#[from] tough::error::Error),

    #[error("TUF schema error: {0:?}")]
    TufSchema(#[from] tough::schema::Error),

    #[error("storage I/O error on key {0}: {1}")]
    StorageIoKey(String, String),

    #[error("configuration not found in storage")]
    ConfigurationNotFound,

    #[error("required request field missing or empty: {0}")]
    RequiredFieldMissing(&'static str),

    #[error("malformed trusted PGP public key {0}: {1:?}")]
    MalformedTrustedKey(String, pgp::errors::Error),

    #[error("not enough verified PGP signatures; {missing} more required")]
    NotEnoughSignatures { missing: u64 },

    #[error("tag {0} not found in repository")]
    TagNotFound(String),

    #[error("worktree file not found: {0}")]
    WorktreeFileNotFound(String),

    #[error("required field missing or empty in release build instructions: {0}")]
    BuildInstructionsFieldMissing(&'static str),

    #[error("container build failed: {0}")]
    ContainerBuild(String),

    #[error("container engine unavailable: {0}")]
    ContainerEngineUnavailable(String),

    #[error("invalid target name {0}: {1}")]
    InvalidTargetName(String, String),

    #[error("task queue full")]
    TaskQueueFull,

    #[error("task deadline exceeded")]
    TaskDeadlineExceeded,

    #[error("busy")]
    Busy,

    #[error("{0}")]
    Other(String),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
