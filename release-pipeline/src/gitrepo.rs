// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Tag-pinned ephemeral git clones.

A release is always built from a single tag. The clone lives in a temporary
directory owned by the pipeline task and is removed when the task finishes,
so nothing is ever shared between tasks.
*/

use {
    crate::error::{PipelineError, Result},
    git2::{build::CheckoutBuilder, Cred, FetchOptions, RemoteCallbacks, Repository},
    log::debug,
    std::{
        io::Write,
        path::{Path, PathBuf},
    },
    tempfile::TempDir,
};

/// Notes ref holding detached signatures over tags and commits.
pub const SIGNATURES_NOTES_REF: &str = "refs/notes/signatures";

/// Options for [ClonedRepo::clone_tag].
#[derive(Clone, Debug, Default)]
pub struct CloneOptions {
    /// HTTP basic auth username. Used only when the password is also set.
    pub username: String,
    /// HTTP basic auth password.
    pub password: String,
}

impl CloneOptions {
    fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// A repository cloned at a single tag into an ephemeral directory.
pub struct ClonedRepo {
    dir: TempDir,
    repo: Repository,
    tag: String,
}

impl ClonedRepo {
    /// Clone `tag` of the repository at `url`.
    ///
    /// The fetch is shallow and limited to the tag ref plus the signatures
    /// notes ref. Submodules are updated recursively. The checkout is
    /// detached at the commit the tag points to.
    pub fn clone_tag(url: &str, tag: &str, options: CloneOptions) -> Result<Self> {
        let dir = TempDir::new()?;
        let repo = Repository::init(dir.path())?;

        {
            let mut remote = repo.remote("origin", url)?;

            // Shallow fetch is only negotiated by the smart transports; a
            // filesystem remote gets a full fetch.
            let shallow = url.starts_with("http://") || url.starts_with("https://");

            let tag_refspec = format!("+refs/tags/{}:refs/tags/{}", tag, tag);
            remote
                .fetch(
                    &[tag_refspec.as_str()],
                    Some(&mut fetch_options(&options, shallow)),
                    None,
                )
                .map_err(|e| {
                    if e.code() == git2::ErrorCode::NotFound {
                        PipelineError::TagNotFound(tag.to_string())
                    } else {
                        PipelineError::Git(e)
                    }
                })?;

            // Signature notes are optional; a repository without the notes
            // ref is simply unsigned-by-notes.
            let notes_refspec =
                format!("+{}:{}", SIGNATURES_NOTES_REF, SIGNATURES_NOTES_REF);
            if let Err(e) = remote.fetch(
                &[notes_refspec.as_str()],
                Some(&mut fetch_options(&options, false)),
                None,
            ) {
                debug!("no signature notes fetched: {}", e);
            }
        }

        let commit_id = {
            let object = repo
                .revparse_single(&format!("refs/tags/{}", tag))
                .map_err(|_| PipelineError::TagNotFound(tag.to_string()))?;
            let commit = object.peel_to_commit()?;
            let commit_id = commit.id();

            repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
            commit_id
        };
        repo.set_head_detached(commit_id)?;

        update_submodules(&repo, &options)?;

        debug!("cloned {} at tag {} ({})", url, tag, commit_id);

        Ok(Self {
            dir,
            repo,
            tag: tag.to_string(),
        })
    }

    /// The tag this clone is pinned to.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The underlying git repository.
    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Absolute path of the checked out worktree.
    pub fn workdir(&self) -> &Path {
        self.dir.path()
    }

    /// Hex object id of the checked out commit.
    pub fn head_commit(&self) -> Result<String> {
        Ok(self.repo.head()?.peel_to_commit()?.id().to_string())
    }

    /// Read a file from the checked out worktree.
    pub fn read_worktree_file(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.workdir().join(path);

        if !full.is_file() {
            return Err(PipelineError::WorktreeFileNotFound(path.to_string()));
        }

        Ok(std::fs::read(full)?)
    }

    /// Raw object database bytes for `oid`.
    pub fn raw_object(&self, oid: git2::Oid) -> Result<Vec<u8>> {
        Ok(self.repo.odb()?.read(oid)?.data().to_vec())
    }

    /// Notes attached to `oid` under the signatures ref.
    pub fn signature_notes(&self, oid: git2::Oid) -> Vec<String> {
        match self.repo.find_note(Some(SIGNATURES_NOTES_REF), oid) {
            Ok(note) => note
                .message()
                .map(|m| vec![m.to_string()])
                .unwrap_or_default(),
            Err(_) => vec![],
        }
    }

    /// Append every worktree entry to `builder`.
    ///
    /// Entries are emitted in sorted order with `/` separators and their
    /// on-disk modes, so the archive is reproducible for a given checkout.
    pub fn append_worktree_to_tar<W: Write>(&self, builder: &mut tar::Builder<W>) -> Result<()> {
        append_dir_to_tar(self.workdir(), builder)
    }
}

/// Append a directory tree to a tar, skipping any `.git` directory.
///
/// This is separate from [ClonedRepo] so producer threads can archive a
/// checkout while holding only its path.
pub fn append_dir_to_tar<W: Write>(root: &Path, builder: &mut tar::Builder<W>) -> Result<()> {
    let walk = walkdir::WalkDir::new(root).sort_by(|a, b| a.path().cmp(b.path()));

    for entry in walk {
        let entry =
            entry.map_err(|e| PipelineError::Other(format!("error walking worktree: {}", e)))?;
        let path = entry.path();

        if path == root {
            continue;
        }

        let rel_path = path
            .strip_prefix(root)
            .map_err(|e| PipelineError::Other(e.to_string()))?;

        if rel_path.components().next()
            == Some(std::path::Component::Normal(std::ffi::OsStr::new(".git")))
        {
            continue;
        }

        let archive_path = tar_safe_path(rel_path);
        builder.append_path_with_name(path, archive_path)?;
    }

    Ok(())
}

/// Join path components with forward slashes regardless of platform.
fn tar_safe_path(path: &Path) -> PathBuf {
    let mut result = String::new();

    for component in path.components() {
        if !result.is_empty() {
            result.push('/');
        }
        result.push_str(&component.as_os_str().to_string_lossy());
    }

    PathBuf::from(result)
}

fn fetch_options<'cb>(options: &CloneOptions, with_depth: bool) -> FetchOptions<'cb> {
    let mut fetch = FetchOptions::new();

    if options.has_credentials() {
        let username = options.username.clone();
        let password = options.password.clone();

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, _username_from_url, _allowed| {
            Cred::userpass_plaintext(&username, &password)
        });

        fetch.remote_callbacks(callbacks);
    }

    if with_depth {
        fetch.depth(1);
    }

    fetch
}

fn update_submodules(repo: &Repository, options: &CloneOptions) -> Result<()> {
    for mut submodule in repo.submodules()? {
        let mut update = git2::SubmoduleUpdateOptions::new();
        update.fetch(fetch_options(options, false));

        submodule.update(true, Some(&mut update))?;

        if let Ok(subrepo) = submodule.open() {
            update_submodules(&subrepo, options)?;
        }
    }

    Ok(())
}
