// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Pipeline configuration and git credentials, persisted through [Storage]. */

use {
    crate::{
        error::Result,
        storage::Storage,
    },
    serde::{Deserialize, Serialize},
    std::{path::PathBuf, time::Duration},
};

const STORAGE_KEY_CONFIGURATION: &str = "configuration";
const STORAGE_KEY_GIT_CREDENTIAL: &str = "git_credential";

/// Default per-task deadline. Matches the task manager's default.
pub const DEFAULT_TASK_TIMEOUT_SECONDS: u64 = 600;

fn default_task_timeout_seconds() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECONDS
}

/// Pipeline configuration persisted by the operator.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PipelineConfig {
    /// URL of the git repository holding the project being released.
    pub git_repo_url: String,

    /// How many distinct trusted signers must have signed a release tag.
    pub required_number_of_verified_signatures_on_commit: u64,

    /// Per-task deadline, in seconds.
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,

    /// TUF publisher bindings.
    pub repository: RepositoryConfig,
}

/// Where the published TUF repository lives and how its metadata is signed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RepositoryConfig {
    /// Root directory of the served TUF tree (`metadata/` and `targets/`).
    pub tuf_repo_root: PathBuf,

    /// Signing keys, one per top-level role that needs re-signing on commit.
    pub signing_key_paths: Vec<PathBuf>,

    /// Days until newly signed metadata expires.
    #[serde(default = "RepositoryConfig::default_metadata_expiration_days")]
    pub metadata_expiration_days: i64,
}

impl RepositoryConfig {
    fn default_metadata_expiration_days() -> i64 {
        120
    }
}

impl PipelineConfig {
    /// Load the configuration from storage. Absent configuration is `Ok(None)`.
    pub async fn load(storage: &dyn Storage) -> Result<Option<Self>> {
        match storage.get(STORAGE_KEY_CONFIGURATION).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Persist the configuration.
    pub async fn save(&self, storage: &dyn Storage) -> Result<()> {
        storage
            .put(STORAGE_KEY_CONFIGURATION, &serde_json::to_vec(self)?)
            .await
    }

    /// The per-task deadline as a [Duration].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }
}

/// Optional stored git credential for cloning private repositories.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GitCredential {
    pub username: String,
    pub password: String,
}

impl GitCredential {
    pub async fn load(storage: &dyn Storage) -> Result<Option<Self>> {
        match storage.get(STORAGE_KEY_GIT_CREDENTIAL).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, storage: &dyn Storage) -> Result<()> {
        storage
            .put(STORAGE_KEY_GIT_CREDENTIAL, &serde_json::to_vec(self)?)
            .await
    }

    pub async fn delete(storage: &dyn Storage) -> Result<()> {
        storage.delete(STORAGE_KEY_GIT_CREDENTIAL).await
    }
}

/// Resolve the credential to use for a release request.
///
/// A stored credential applies only when the request carries neither a
/// username nor a password; partially specified request credentials are
/// used as-is so the caller notices the omission instead of silently
/// cloning as somebody else.
pub fn resolve_git_credential(
    stored: Option<GitCredential>,
    request_username: &str,
    request_password: &str,
) -> (String, String) {
    if request_username.is_empty() && request_password.is_empty() {
        if let Some(stored) = stored {
            return (stored.username, stored.password);
        }
    }

    (request_username.to_string(), request_password.to_string())
}

#[cfg(test)]
mod test {
    use {super::*, crate::storage::MemoryStorage};

    fn some_config() -> PipelineConfig {
        PipelineConfig {
            git_repo_url: "https://example.com/project.git".to_string(),
            required_number_of_verified_signatures_on_commit: 2,
            task_timeout_seconds: 60,
            repository: RepositoryConfig {
                tuf_repo_root: PathBuf::from("/srv/tuf"),
                signing_key_paths: vec![PathBuf::from("/etc/keys/targets.pem")],
                metadata_expiration_days: 120,
            },
        }
    }

    #[tokio::test]
    async fn config_round_trips_through_storage() -> Result<()> {
        let storage = MemoryStorage::new();

        assert!(PipelineConfig::load(&storage).await?.is_none());

        let config = some_config();
        config.save(&storage).await?;

        assert_eq!(PipelineConfig::load(&storage).await?, Some(config));

        Ok(())
    }

    #[tokio::test]
    async fn task_timeout_defaults_when_absent_from_json() -> Result<()> {
        let storage = MemoryStorage::new();
        storage
            .put(
                STORAGE_KEY_CONFIGURATION,
                br#"{
                    "git_repo_url": "https://example.com/p.git",
                    "required_number_of_verified_signatures_on_commit": 1,
                    "repository": {
                        "tuf_repo_root": "/srv/tuf",
                        "signing_key_paths": []
                    }
                }"#,
            )
            .await?;

        let config = PipelineConfig::load(&storage).await?.unwrap();
        assert_eq!(config.task_timeout(), Duration::from_secs(600));
        assert_eq!(config.repository.metadata_expiration_days, 120);

        Ok(())
    }

    #[test]
    fn stored_credential_applies_only_when_request_is_empty() {
        let stored = Some(GitCredential {
            username: "stored-user".to_string(),
            password: "stored-pass".to_string(),
        });

        assert_eq!(
            resolve_git_credential(stored.clone(), "", ""),
            ("stored-user".to_string(), "stored-pass".to_string())
        );
        assert_eq!(
            resolve_git_credential(stored.clone(), "req-user", "req-pass"),
            ("req-user".to_string(), "req-pass".to_string())
        );
        // A partially specified request credential is not merged with the
        // stored one.
        assert_eq!(
            resolve_git_credential(stored, "req-user", ""),
            ("req-user".to_string(), "".to_string())
        );
        assert_eq!(
            resolve_git_credential(None, "", ""),
            ("".to_string(), "".to_string())
        );
    }
}
