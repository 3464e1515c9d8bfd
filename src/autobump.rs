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

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use git2::{Repository, Signature};
use tracing::{debug, info, warn};

use crate::api_clients::Client;
use crate::changes::{BumpChangeset, ReplacementMap};
use crate::config::Options;
use crate::publisher::{ChangeDescription, PublishOutcome, PublishSettings, Publisher};
use crate::registry::Registry;
use crate::remote::Remote;
use crate::repo::{GitCredentials, Staging};
use crate::resolver::TagResolver;
use crate::scanner::{self, ScanTargets};

/// The checkout being bumped and the token file the GitHub credentials come from.
pub struct Workspace {
    pub root: PathBuf,
    pub token_path: PathBuf,
}

#[derive(Debug)]
pub struct RunReport {
    pub replacements: ReplacementMap,
    /// `None` when every image was already up to date.
    pub publish: Option<PublishOutcome>,
}

/// Scans, checks and publishes one bump.
///
/// `fork_url` is asked for the push target once the bot identity is known. Images whose upstream
/// tag is missing do not stop the other bumps from being published, the run fails afterwards.
pub async fn run<C, R, F>(
    options: &mut Options,
    resolver: &mut TagResolver<R>,
    client: &C,
    workspace: &Workspace,
    fork_url: F,
) -> Result<RunReport, anyhow::Error>
where
    C: Client,
    R: Registry,
    F: FnOnce(&Options) -> Result<String, anyhow::Error>,
{
    let targets = ScanTargets {
        included: workspace_paths(&workspace.root, &options.included_config_paths),
        excluded: workspace_paths(&workspace.root, &options.excluded_config_paths),
        extra: workspace_paths(&workspace.root, &options.extra_files),
    };
    let filter = scanner::prefix_filter(&options.prefixes)?;
    let scanned = scanner::scan(&targets, &filter, resolver)
        .await
        .context("while bumping images")?;
    if !resolver.pinned_images().is_empty() {
        warn!(images = ?resolver.pinned_images(), "images kept at their current tag");
    }
    let unresolved = scanned.unresolved_error();

    let changeset = BumpChangeset::new(&options.prefixes, scanned.replacements)
        .context("while checking bump consistency")?;
    if changeset.is_empty() {
        info!("all images are up to date");
        return match unresolved {
            Some(err) => Err(err),
            None => Ok(RunReport {
                replacements: changeset.replacements,
                publish: None,
            }),
        };
    }

    let mut token = String::new();
    if !options.skip_pull_request {
        if options.needs_bot_identity() {
            let user = client.bot_user().await?;
            options.apply_bot_user(&user);
        }

        // the token file might have been rotated while scanning
        token = read_token(&workspace.token_path)?;
        if client.reauthenticate(&token).await? {
            info!("picked up rotated GitHub token");
        }
    }

    let fork_url = if options.skip_pull_request {
        String::new()
    } else {
        fork_url(options)?
    };

    let repository = Repository::open(&workspace.root).context("failed to open repository")?;
    let signature = signature(&repository, options)?;

    let title = changeset.summary(&options.prefixes);
    let body = changeset.pr_body(&options.prefixes, &options.additional_pr_body, &options.assign_to);
    let commit_message = changeset.commit_message(&options.prefixes);

    let publisher = Publisher::new(
        client,
        PublishSettings {
            org: options.git_hub_org.clone(),
            repo: options.git_hub_repo.clone(),
            fork_url,
            credentials: GitCredentials {
                login: options.git_hub_login.clone(),
                token,
            },
            head_branch: options.head_branch_name.clone(),
            base_branch: options.git_hub_base_branch.clone(),
            labels: options.labels.clone(),
            signoff: options.signoff,
            dry_run: options.skip_pull_request,
        },
    );
    let outcome = publisher
        .publish(
            &repository,
            &Staging::Files(&scanned.touched_files),
            &signature,
            &ChangeDescription {
                commit_message: &commit_message,
                title: &title,
                body: &body,
            },
        )
        .await?;

    match &outcome {
        PublishOutcome::NothingToCommit => info!("nothing to publish"),
        PublishOutcome::Published { push, pull_request } => info!(
            ?push,
            pull_request = pull_request.as_ref().map_or("", |pr| pr.url.as_str()),
            %title,
            "published image bump"
        ),
    }

    if let Some(err) = unresolved {
        return Err(err);
    }
    Ok(RunReport {
        replacements: changeset.replacements,
        publish: Some(outcome),
    })
}

/// `https://{host}/{login}/{remoteName}.git`
pub fn github_fork_url(options: &Options) -> Result<String, anyhow::Error> {
    Ok(Remote::fork(&options.git_hub_host, &options.git_hub_login, &options.remote_name)?
        .url()
        .to_string())
}

pub fn read_token(path: &Path) -> Result<String, anyhow::Error> {
    let token = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read GitHub token from {}", path.display()))?;
    let token = token.trim();
    if token.is_empty() {
        bail!("GitHub token file {} is empty", path.display());
    }
    debug!(path = %path.display(), "read GitHub token");
    Ok(token.to_string())
}

fn workspace_paths(workspace: &Path, paths: &[String]) -> Vec<PathBuf> {
    paths.iter().map(|path| workspace.join(path)).collect()
}

/// Commit identity from the options, or from the repository's git config when none is configured.
fn signature(repository: &Repository, options: &Options) -> Result<Signature<'static>, anyhow::Error> {
    if options.git_name.is_empty() {
        return repository
            .signature()
            .context("no gitName/gitEmail configured and no git identity found in the repository config");
    }
    Signature::now(&options.git_name, &options.git_email)
        .with_context(|| format!("invalid git identity {} <{}>", options.git_name, options.git_email))
}
