// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The release operation.

Ties the subsystems together: a release request enqueues a task that clones
the tag, checks the trusted-signer threshold, builds artifacts in a
container sandbox, and publishes the resulting files into the TUF
repository. The request handler returns the task id; everything else
happens on the worker.
*/

use {
    crate::{
        config::{resolve_git_credential, GitCredential, PipelineConfig},
        docker,
        error::{PipelineError, Result},
        gitrepo::{CloneOptions, ClonedRepo},
        keys::TrustedKeys,
        manifest::{ReleaseManifest, MANIFEST_FILE_NAME},
        pipe::pipe,
        publisher::{publish_artifact_tar, RepositoryHandle},
        signatures::verify_tag_signatures,
        storage::Storage,
        tasks::{task_fn, TaskManager},
    },
    log::info,
    std::sync::Arc,
};

/// Bound on in-flight artifact chunks between the build and the publisher.
const ARTIFACTS_PIPE_CAPACITY: usize = 64;

/// A release request as received from the hosting request router.
#[derive(Clone, Debug, Default)]
pub struct ReleaseRequest {
    /// Tag to release. Required.
    pub git_tag: String,
    /// Optional per-request git credential. Both fields must be set to
    /// override the stored credential.
    pub git_username: String,
    pub git_password: String,
}

/// The release backend: a task manager plus the release operation.
pub struct ReleaseBackend {
    manager: TaskManager,
}

impl ReleaseBackend {
    /// Create a backend with a fresh task manager on the current runtime.
    pub fn new() -> Self {
        Self {
            manager: TaskManager::new(),
        }
    }

    /// The backend's task manager, for status lookups and extra tasks.
    pub fn task_manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Submit a release of `request.git_tag`.
    ///
    /// Returns the id of the queued task, [PipelineError::Busy] when a
    /// mutating task already exists, or a validation error.
    pub async fn release(
        &self,
        storage: Arc<dyn Storage>,
        request: ReleaseRequest,
    ) -> Result<String> {
        if request.git_tag.trim().is_empty() {
            return Err(PipelineError::RequiredFieldMissing("git_tag"));
        }

        let config = PipelineConfig::load(&*storage)
            .await?
            .ok_or(PipelineError::ConfigurationNotFound)?;

        let stored_credential = GitCredential::load(&*storage).await?;
        let (username, password) = resolve_git_credential(
            stored_credential,
            &request.git_username,
            &request.git_password,
        );

        // Acquire the publisher handle up front so a misconfigured
        // repository fails the request, not the task.
        let handle = RepositoryHandle::open(&config.repository)?;

        let git_tag = request.git_tag;
        let git_repo_url = config.git_repo_url.clone();
        let required_signatures = config.required_number_of_verified_signatures_on_commit;

        self.manager
            .run_task(
                storage,
                task_fn(move |storage| {
                    run_release_task(
                        storage,
                        handle,
                        git_repo_url,
                        git_tag,
                        CloneOptions { username, password },
                        required_signatures,
                    )
                }),
            )
            .await
    }
}

impl Default for ReleaseBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_release_task(
    storage: Arc<dyn Storage>,
    mut handle: RepositoryHandle,
    git_repo_url: String,
    git_tag: String,
    clone_options: CloneOptions,
    required_signatures: u64,
) -> Result<()> {
    info!("started release task for tag {}", git_tag);

    let repo = {
        let url = git_repo_url.clone();
        let tag = git_tag.clone();
        spawn_blocking(move || ClonedRepo::clone_tag(&url, &tag, clone_options)).await?
    };

    info!("cloned {} at tag {}", git_repo_url, git_tag);

    let trusted_keys = TrustedKeys::load(&*storage).await?;

    let repo = {
        let tag = git_tag.clone();
        spawn_blocking(move || {
            verify_tag_signatures(&repo, &tag, &trusted_keys, required_signatures)?;
            Ok(repo)
        })
        .await?
    };

    info!("verified tag signatures");

    let manifest_data = repo.read_worktree_file(MANIFEST_FILE_NAME)?;
    let manifest = ReleaseManifest::parse(&manifest_data, &git_tag)?;

    info!("validated {} configuration", MANIFEST_FILE_NAME);

    let (writer, reader) = pipe(ARTIFACTS_PIPE_CAPACITY);

    let build = {
        let worktree = repo.workdir().to_path_buf();
        let manifest = manifest.clone();
        tokio::task::spawn_blocking(move || {
            docker::build_release_artifacts(
                &worktree,
                &manifest.docker_image,
                &manifest.commands,
                writer,
            )
        })
    };

    let publish = {
        let release = git_tag.clone();
        tokio::task::spawn_blocking(move || {
            let published = publish_artifact_tar(&mut handle, &release, reader)?;
            Ok::<_, PipelineError>((handle, published))
        })
    };

    let (build_result, publish_result) = tokio::join!(build, publish);

    // The build error is primary; a publish failure on a broken pipe is
    // its echo.
    join_result(build_result)?;
    let (handle, published) = join_result(publish_result)?;

    info!("built and staged {} release targets", published.len());

    spawn_blocking(move || handle.commit()).await?;

    info!("committed release {} into the repository", git_tag);

    // The clone lives until the build finished reading the worktree.
    drop(repo);

    Ok(())
}

async fn spawn_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    join_result(tokio::task::spawn_blocking(f).await)
}

fn join_result<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.map_err(|e| PipelineError::Other(format!("worker thread failed: {}", e)))?
}
