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

#[cfg(test)]
use std::collections::HashMap;
use std::future::Future;
#[cfg(test)]
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use octocrab::params;
use octocrab::Octocrab;
use tokio::sync::Semaphore;

use crate::credentials::CredentialRotator;
use crate::github::{BotUser, PullRequest};

pub trait Client {
    fn bot_user(&self) -> impl Future<Output = anyhow::Result<BotUser>> + Send;

    fn default_branch(&self, org: &str, repo: &str) -> impl Future<Output = anyhow::Result<String>> + Send;

    /// Open PR from `head` (`login:branch`) into `base`, if there is one.
    fn find_open_pr(
        &self,
        org: &str,
        repo: &str,
        head: &str,
        base: &str,
    ) -> impl Future<Output = anyhow::Result<Option<PullRequest>>> + Send;

    fn create_pr(
        &self,
        org: &str,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> impl Future<Output = anyhow::Result<PullRequest>> + Send;

    fn update_pr(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        title: &str,
        body: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn add_labels(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        labels: &[String],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Swaps in a client for `token` if it differs from the current one.
    fn reauthenticate(&self, token: &str) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

#[derive(Debug)]
pub struct RealClient {
    semaphore: Semaphore,
    credentials: CredentialRotator<Octocrab>,
}

impl RealClient {
    pub fn new(token: &str, api_endpoint: String) -> anyhow::Result<Self> {
        Ok(Self {
            semaphore: Semaphore::new(5), // i.e. up to 5 API calls in parallel to the same GitHub instance
            credentials: CredentialRotator::new(token, move |token| build_octocrab(token, &api_endpoint))?,
        })
    }
}

fn build_octocrab(token: &str, api_endpoint: &str) -> anyhow::Result<Octocrab> {
    Octocrab::builder()
        .personal_token(token.to_string())
        .base_uri(api_endpoint)
        .with_context(|| format!("failed to set base_uri to {api_endpoint}"))?
        .build()
        .context("failed to build octocrab client")
}

fn pull_request(pr: octocrab::models::pulls::PullRequest) -> anyhow::Result<PullRequest> {
    Ok(PullRequest {
        number: pr.number,
        url: pr
            .html_url
            .as_ref()
            .ok_or_else(|| anyhow!("pr without an html link!?"))?
            .to_string(),
        title: pr.title.unwrap_or_default(),
        body: pr.body.unwrap_or_default(),
        labels: pr.labels.unwrap_or_default().into_iter().map(|l| l.name).collect(),
    })
}

impl Client for RealClient {
    async fn bot_user(&self) -> anyhow::Result<BotUser> {
        let _permit = self.semaphore.acquire().await?;
        let octocrab = self.credentials.read().await;

        octocrab
            .get("/user", None::<&()>)
            .await
            .context("failed to get the user data for the provided token")
    }

    async fn default_branch(&self, org: &str, repo: &str) -> anyhow::Result<String> {
        let _permit = self.semaphore.acquire().await?;
        let octocrab = self.credentials.read().await;

        octocrab
            .repos(org, repo)
            .get()
            .await
            .with_context(|| format!("failed to get repository {org}/{repo}"))?
            .default_branch
            .ok_or_else(|| anyhow!("repository {org}/{repo} has no default branch"))
    }

    async fn find_open_pr(&self, org: &str, repo: &str, head: &str, base: &str) -> anyhow::Result<Option<PullRequest>> {
        let _permit = self.semaphore.acquire().await?;
        let octocrab = self.credentials.read().await;

        let mut prs_page = octocrab
            .pulls(org, repo)
            .list()
            .state(params::State::Open)
            .head(head)
            .base(base)
            .send()
            .await
            .context("failed to list pull requests")?;

        prs_page.take_items().into_iter().next().map(pull_request).transpose()
    }

    async fn create_pr(
        &self,
        org: &str,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> anyhow::Result<PullRequest> {
        let _permit = self.semaphore.acquire().await?;
        let octocrab = self.credentials.read().await;

        let pr = octocrab
            .pulls(org, repo)
            .create(title, head, base)
            .body(body)
            .maintainer_can_modify(false)
            .send()
            .await
            .with_context(|| format!("failed to create pull request from {head} into {org}/{repo}:{base}"))?;
        pull_request(pr)
    }

    async fn update_pr(&self, org: &str, repo: &str, number: u64, title: &str, body: &str) -> anyhow::Result<()> {
        let _permit = self.semaphore.acquire().await?;
        let octocrab = self.credentials.read().await;

        octocrab
            .pulls(org, repo)
            .update(number)
            .title(title)
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to update {org}/{repo}#{number}"))?;
        Ok(())
    }

    async fn add_labels(&self, org: &str, repo: &str, number: u64, labels: &[String]) -> anyhow::Result<()> {
        let _permit = self.semaphore.acquire().await?;
        let octocrab = self.credentials.read().await;

        octocrab
            .issues(org, repo)
            .add_labels(number, labels)
            .await
            .with_context(|| format!("failed to add labels {labels:?} to {org}/{repo}#{number}"))?;
        Ok(())
    }

    async fn reauthenticate(&self, token: &str) -> anyhow::Result<bool> {
        self.credentials.reauthenticate(token).await
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockClient {
    pub bot_user: Mutex<Option<BotUser>>,
    /// org/repo -> default branch
    pub default_branches: Mutex<HashMap<String, String>>,
    pub pull_requests: Mutex<Vec<MockPullRequest>>,
    pub updated: Mutex<Vec<u64>>,
    pub tokens: Mutex<Vec<String>>,
}

#[cfg(test)]
#[derive(Debug)]
pub struct MockPullRequest {
    pub head: String,
    pub base: String,
    pub pr: PullRequest,
}

#[cfg(test)]
impl MockClient {
    /// Registers an already open PR.
    pub fn with_open_pr(self, head: &str, base: &str, pr: PullRequest) -> Self {
        self.pull_requests.lock().unwrap().push(MockPullRequest {
            head: head.to_string(),
            base: base.to_string(),
            pr,
        });
        self
    }

    pub fn pr(&self, number: u64) -> Option<PullRequest> {
        self.pull_requests
            .lock()
            .unwrap()
            .iter()
            .map(|p| &p.pr)
            .find(|pr| pr.number == number)
            .cloned()
    }
}

#[cfg(test)]
impl Client for MockClient {
    async fn bot_user(&self) -> anyhow::Result<BotUser> {
        self.bot_user
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("MockClient contains no bot_user"))
    }

    async fn default_branch(&self, org: &str, repo: &str) -> anyhow::Result<String> {
        let key = format!("{org}/{repo}");
        self.default_branches
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("MockClient default_branches contains no {key}"))
    }

    async fn find_open_pr(&self, _org: &str, _repo: &str, head: &str, base: &str) -> anyhow::Result<Option<PullRequest>> {
        Ok(self
            .pull_requests
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.head == head && p.base == base)
            .map(|p| p.pr.clone()))
    }

    async fn create_pr(
        &self,
        org: &str,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> anyhow::Result<PullRequest> {
        let mut pull_requests = self.pull_requests.lock().unwrap();
        let number = pull_requests.len() as u64 + 1;
        let pr = PullRequest {
            number,
            url: format!("https://github.com/{org}/{repo}/pull/{number}"),
            title: title.to_string(),
            body: body.to_string(),
            labels: Vec::new(),
        };
        pull_requests.push(MockPullRequest {
            head: head.to_string(),
            base: base.to_string(),
            pr: pr.clone(),
        });
        Ok(pr)
    }

    async fn update_pr(&self, _org: &str, _repo: &str, number: u64, title: &str, body: &str) -> anyhow::Result<()> {
        let mut pull_requests = self.pull_requests.lock().unwrap();
        let pr = pull_requests
            .iter_mut()
            .map(|p| &mut p.pr)
            .find(|pr| pr.number == number)
            .ok_or_else(|| anyhow!("MockClient pull_requests contains no {number}"))?;
        title.clone_into(&mut pr.title);
        body.clone_into(&mut pr.body);
        self.updated.lock().unwrap().push(number);
        Ok(())
    }

    async fn add_labels(&self, _org: &str, _repo: &str, number: u64, labels: &[String]) -> anyhow::Result<()> {
        let mut pull_requests = self.pull_requests.lock().unwrap();
        let pr = pull_requests
            .iter_mut()
            .map(|p| &mut p.pr)
            .find(|pr| pr.number == number)
            .ok_or_else(|| anyhow!("MockClient pull_requests contains no {number}"))?;
        pr.labels.extend(labels.iter().cloned());
        Ok(())
    }

    async fn reauthenticate(&self, token: &str) -> anyhow::Result<bool> {
        let mut tokens = self.tokens.lock().unwrap();
        if tokens.last().is_some_and(|last| last == token) {
            return Ok(false);
        }
        tokens.push(token.to_string());
        Ok(true)
    }
}

/// REST endpoint for a GitHub or GitHub Enterprise host.
pub fn api_endpoint_for_host(host: &str) -> String {
    if host == "github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("https://{host}/api/v3")
    }
}

#[cfg(test)]
mod tests {
    use crate::api_clients;

    #[test]
    fn api_endpoint_for_host() {
        assert_eq!(api_clients::api_endpoint_for_host("github.com"), "https://api.github.com");
        assert_eq!(
            api_clients::api_endpoint_for_host("github.example.com"),
            "https://github.example.com/api/v3"
        );
    }

    #[tokio::test]
    async fn real_client_builds_for_enterprise_hosts() {
        let client = api_clients::RealClient::new("token", api_clients::api_endpoint_for_host("github.example.com"));
        assert!(client.is_ok());
    }
}
