// Copyright 2024 SAP SE
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use git2::{
    Cred, Direction, ErrorCode, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks, Repository, Signature,
    Tree,
};
use tracing::info;

/// Name of the git remote the bump branch is pushed through.
pub const FORK_REMOTE_NAME: &str = "bumper-fork-remote";

pub enum Staging<'a> {
    All,
    Files(&'a [PathBuf]),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The remote branch already carries the same tree, nothing was pushed.
    UpToDate,
    DryRun,
}

/// Basic auth for the fork remote.
#[derive(Clone)]
pub struct GitCredentials {
    pub login: String,
    pub token: String,
}

pub fn tree_for_commit_ref<'r>(repo: &'r Repository, commit_ref: &'_ str) -> Result<Tree<'r>, anyhow::Error> {
    let commit_id = repo
        .revparse_single(commit_ref)
        .with_context(|| format!("cannot revparse {commit_ref:?}"))?
        .id();
    let commit = repo
        .find_commit(commit_id)
        .with_context(|| format!("cannot find Git commit {commit_id}"))?;
    let tree = commit
        .tree()
        .with_context(|| format!("cannot find tree for Git commit {commit_id}"))?;
    Ok(tree)
}

pub fn stage(repo: &Repository, staging: &Staging<'_>) -> Result<(), anyhow::Error> {
    let mut index = repo.index().context("cannot open Git index")?;
    match staging {
        Staging::All => {
            index
                .add_all(["*"], IndexAddOption::DEFAULT, None)
                .context("cannot stage working tree")?;
            index.update_all(["*"], None).context("cannot stage removed files")?;
        },
        Staging::Files(files) => {
            let workdir = repo
                .workdir()
                .ok_or_else(|| anyhow!("cannot stage files in a bare repository"))?
                .canonicalize()
                .context("cannot resolve repository working directory")?;
            for file in files.iter() {
                let path = file
                    .canonicalize()
                    .with_context(|| format!("cannot resolve {}", file.display()))?;
                let relative = path
                    .strip_prefix(&workdir)
                    .with_context(|| format!("{} is outside of {}", path.display(), workdir.display()))?;
                index
                    .add_path(relative)
                    .with_context(|| format!("cannot stage {}", relative.display()))?;
            }
        },
    }
    index.write().context("cannot write Git index")
}

/// Commits the index on top of `HEAD`.
///
/// Returns `None` without committing when the index tree equals the tree of `HEAD`.
pub fn commit(repo: &Repository, signature: &Signature<'_>, message: &str) -> Result<Option<Oid>, anyhow::Error> {
    let mut index = repo.index().context("cannot open Git index")?;
    let tree_id = index.write_tree().context("cannot write tree from index")?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit().context("HEAD does not point to a commit")?),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => None,
        Err(err) => return Err(err).context("cannot resolve HEAD"),
    };
    if parent.as_ref().is_some_and(|parent| parent.tree_id() == tree_id) {
        return Ok(None);
    }

    let tree = repo
        .find_tree(tree_id)
        .with_context(|| format!("cannot find Git tree {tree_id}"))?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo
        .commit(Some("HEAD"), signature, signature, message, &tree, &parents)
        .context("cannot create Git commit")?;
    Ok(Some(oid))
}

/// Appends a `Signed-off-by` trailer for `signature`, like `git commit --signoff`.
pub fn signed_off(message: &str, signature: &Signature<'_>) -> String {
    let trailer = format!(
        "Signed-off-by: {} <{}>",
        signature.name().unwrap_or_default(),
        signature.email().unwrap_or_default()
    );
    if message.lines().any(|line| line == trailer) {
        return message.to_string();
    }
    format!("{}\n\n{trailer}\n", message.trim_end())
}

/// Force-pushes `HEAD` to `branch` on the fork at `url`.
///
/// Skips the push when the remote branch already has the same tree, so that metadata-only
/// pushes don't re-trigger tests on an open PR.
pub fn push(
    repo: &Repository,
    url: &str,
    branch: &str,
    credentials: &GitCredentials,
    dry_run: bool,
) -> Result<PushOutcome, anyhow::Error> {
    let local_tree = tree_for_commit_ref(repo, "HEAD").context("while reading local tree")?.id();
    if dry_run {
        info!(remote = url, branch, tree = %local_tree, "[dry run] skipping git push");
        return Ok(PushOutcome::DryRun);
    }

    let mut remote = ensure_remote(repo, url)?;
    let remote_tree = fetch_remote_tree(repo, &mut remote, branch, credentials)
        .with_context(|| format!("cannot read branch {branch} from {url}"))?;
    if remote_tree == Some(local_tree) {
        info!(remote = url, branch, "not pushing as up-to-date remote branch already exists");
        return Ok(PushOutcome::UpToDate);
    }

    let mut rejection = None;
    {
        let mut callbacks = callbacks(credentials);
        callbacks.push_update_reference(|refname, status| {
            if let Some(status) = status {
                rejection = Some(format!("{refname}: {status}"));
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        remote
            .push(&[format!("+HEAD:refs/heads/{branch}")], Some(&mut options))
            .with_context(|| format!("cannot push to {url}"))?;
    }
    if let Some(rejection) = rejection {
        bail!("remote rejected push of {rejection}");
    }

    info!(remote = url, branch, "pushed to remote");
    Ok(PushOutcome::Pushed)
}

fn ensure_remote<'r>(repo: &'r Repository, url: &str) -> Result<git2::Remote<'r>, anyhow::Error> {
    match repo.find_remote(FORK_REMOTE_NAME) {
        Ok(remote) if remote.url().ok() == Some(url) => Ok(remote),
        Ok(_) => {
            repo.remote_set_url(FORK_REMOTE_NAME, url)
                .with_context(|| format!("cannot update remote {FORK_REMOTE_NAME}"))?;
            repo.find_remote(FORK_REMOTE_NAME)
                .with_context(|| format!("cannot find remote {FORK_REMOTE_NAME}"))
        },
        Err(_) => repo
            .remote(FORK_REMOTE_NAME, url)
            .with_context(|| format!("cannot add remote {FORK_REMOTE_NAME}")),
    }
}

/// Tree of the remote branch, `None` if the branch does not exist yet.
fn fetch_remote_tree(
    repo: &Repository,
    remote: &mut git2::Remote<'_>,
    branch: &str,
    credentials: &GitCredentials,
) -> Result<Option<Oid>, anyhow::Error> {
    let remote_ref = format!("refs/heads/{branch}");
    let mut connection = remote
        .connect_auth(Direction::Fetch, Some(callbacks(credentials)), None)
        .context("cannot connect to remote")?;
    let exists = connection
        .remote()
        .list()
        .context("cannot list remote refs")?
        .iter()
        .any(|head| head.name() == remote_ref);
    drop(connection);
    if !exists {
        return Ok(None);
    }

    let tracking_ref = format!("refs/remotes/{FORK_REMOTE_NAME}/{branch}");
    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks(credentials));
    remote
        .fetch(&[format!("+{remote_ref}:{tracking_ref}")], Some(&mut options), None)
        .context("cannot fetch from remote")?;
    Ok(Some(tree_for_commit_ref(repo, &tracking_ref)?.id()))
}

fn callbacks(credentials: &GitCredentials) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username, _allowed| Cred::userpass_plaintext(&credentials.login, &credentials.token));
    callbacks
}
