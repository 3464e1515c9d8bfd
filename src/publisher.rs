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

use anyhow::Context;
use git2::{Repository, Signature};
use tracing::info;

use crate::api_clients::Client;
use crate::github::PullRequest;
use crate::repo::{self, GitCredentials, PushOutcome, Staging};

/// Where and how the bump gets published.
#[derive(Clone)]
pub struct PublishSettings {
    pub org: String,
    pub repo: String,
    pub fork_url: String,
    pub credentials: GitCredentials,
    pub head_branch: String,
    /// Detected from the repository when empty.
    pub base_branch: String,
    pub labels: Vec<String>,
    pub signoff: bool,
    /// Commit locally but neither push nor touch pull requests.
    pub dry_run: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    NothingToCommit,
    Published {
        push: PushOutcome,
        pull_request: Option<PullRequest>,
    },
}

/// Text that describes the change.
pub struct ChangeDescription<'a> {
    pub commit_message: &'a str,
    pub title: &'a str,
    pub body: &'a str,
}

pub struct Publisher<'a, C: Client> {
    client: &'a C,
    settings: PublishSettings,
}

impl<'a, C: Client> Publisher<'a, C> {
    pub fn new(client: &'a C, settings: PublishSettings) -> Self {
        Self { client, settings }
    }

    /// Stages, commits and pushes the working tree, then creates or updates the pull request.
    ///
    /// Even when the fork branch is already up to date the pull request is refreshed, so that
    /// title, body and labels follow the latest run.
    pub async fn publish(
        &self,
        repository: &Repository,
        staging: &Staging<'_>,
        signature: &Signature<'_>,
        description: &ChangeDescription<'_>,
    ) -> Result<PublishOutcome, anyhow::Error> {
        repo::stage(repository, staging).context("while staging changes")?;

        let message = if self.settings.signoff {
            repo::signed_off(description.commit_message, signature)
        } else {
            description.commit_message.to_string()
        };
        let Some(commit) = repo::commit(repository, signature, &message).context("while committing changes")? else {
            info!("nothing changed, skipping commit and pull request");
            return Ok(PublishOutcome::NothingToCommit);
        };
        info!(%commit, "committed changes");

        let s = &self.settings;
        let push = repo::push(repository, &s.fork_url, &s.head_branch, &s.credentials, s.dry_run)
            .context("while pushing changes to the fork")?;

        let pull_request = self
            .ensure_pr(description.title, description.body)
            .await
            .context("while creating or updating the pull request")?;

        Ok(PublishOutcome::Published { push, pull_request })
    }

    async fn ensure_pr(&self, title: &str, body: &str) -> Result<Option<PullRequest>, anyhow::Error> {
        let s = &self.settings;
        let head = format!("{}:{}", s.credentials.login, s.head_branch);

        if s.dry_run {
            info!(
                org = %s.org,
                repo = %s.repo,
                %head,
                base = %s.base_branch,
                title,
                labels = ?s.labels,
                "[dry run] skipping pull request"
            );
            return Ok(None);
        }

        let base = if s.base_branch.is_empty() {
            self.client
                .default_branch(&s.org, &s.repo)
                .await
                .with_context(|| format!("cannot detect default branch of {}/{}", s.org, s.repo))?
        } else {
            s.base_branch.clone()
        };

        let mut pr = match self.client.find_open_pr(&s.org, &s.repo, &head, &base).await? {
            Some(mut pr) => {
                self.client.update_pr(&s.org, &s.repo, pr.number, title, body).await?;
                info!(url = %pr.url, "updated pull request");
                title.clone_into(&mut pr.title);
                body.clone_into(&mut pr.body);
                pr
            },
            None => {
                let pr = self.client.create_pr(&s.org, &s.repo, title, body, &head, &base).await?;
                info!(url = %pr.url, "created pull request");
                pr
            },
        };

        let missing_labels: Vec<String> = s.labels.iter().filter(|l| !pr.labels.contains(l)).cloned().collect();
        if !missing_labels.is_empty() {
            self.client.add_labels(&s.org, &s.repo, pr.number, &missing_labels).await?;
            pr.labels.extend(missing_labels);
        }

        Ok(Some(pr))
    }
}
