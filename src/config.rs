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

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Context};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::github::BotUser;
use crate::registry::GOOGLE_IMAGE_REGISTRY_AUTH;
use crate::resolver::{BumpPolicy, LATEST_VERSION, UPSTREAM_STAGING_VERSION, UPSTREAM_VERSION};

pub const DEFAULT_UPSTREAM_URL_BASE: &str = "https://raw.githubusercontent.com/kubernetes/test-infra/master";
pub const DEFAULT_HEAD_BRANCH_NAME: &str = "autobump";
pub const DEFAULT_GITHUB_HOST: &str = "github.com";

static PINNED_TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v[0-9]{8}-[a-f0-9]{6,9}").expect("pinned tag regex must compile"));

/// Everything the autobumper reads from its YAML config file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Org of the repository the PR is opened against.
    pub git_hub_org: String,
    /// Repository the PR is opened against.
    pub git_hub_repo: String,
    /// Base branch of the PR; detected from the repository default branch when empty.
    pub git_hub_base_branch: String,
    /// Login owning the fork. Defaults to the user behind the token.
    pub git_hub_login: String,
    #[serde(alias = "GitHubHost")]
    pub git_hub_host: String,
    pub git_name: String,
    pub git_email: String,
    /// Name of the fork repository below the login.
    pub remote_name: String,
    pub head_branch_name: String,
    pub labels: Vec<String>,
    #[serde(alias = "assign_to")]
    pub assign_to: String,
    #[serde(rename = "additionalPRBody")]
    pub additional_pr_body: String,
    pub skip_pull_request: bool,
    /// Adds a `Signed-off-by` trailer to the bump commit.
    pub signoff: bool,
    /// Empty for anonymous registry access, or `google` for Google application default credentials.
    pub image_registry_auth: String,

    #[serde(rename = "upstreamURLBase")]
    pub upstream_url_base: String,
    pub included_config_paths: Vec<String>,
    pub excluded_config_paths: Vec<String>,
    pub extra_files: Vec<String>,
    /// One of `latest`, `upstream`, `upstream-staging` or a literal `vYYYYMMDD-deadbeef` tag.
    pub target_version: String,
    pub prefixes: Vec<Prefix>,
}

/// A named group of images that share a registry path.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Prefix {
    pub name: String,
    /// The image prefix the bumper looks for, e.g. `europe-docker.pkg.dev/kyma-project/prod/`.
    pub prefix: String,
    /// Source repository of the images, used for compare links.
    pub repo: String,
    pub ref_config_file: String,
    pub staging_ref_config_file: String,
    pub summarise: bool,
    pub consistent_images: bool,
    pub consistent_image_exceptions: BTreeSet<String>,
}

impl Prefix {
    pub fn owns(&self, image: &str) -> bool {
        image.starts_with(&self.prefix)
    }

    /// The part of an image path below the prefix, e.g. `foo` for `registry.example.com/a/foo`.
    pub fn component<'a>(&self, image_path: &'a str) -> &'a str {
        let component = image_path
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(image_path)
            .trim_start_matches('/');
        if component.is_empty() {
            image_path.rsplit('/').next().unwrap_or(image_path)
        } else {
            component
        }
    }

    /// Exceptions can be given either as full image paths or as components below the prefix.
    pub fn is_exception(&self, image_path: &str) -> bool {
        self.consistent_image_exceptions.contains(image_path)
            || self.consistent_image_exceptions.contains(self.component(image_path))
    }
}

impl Options {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read(path).with_context(|| format!("cannot read config file {}", path.display()))?;
        serde_yml::from_slice(&content).with_context(|| format!("cannot parse yaml file {}", path.display()))
    }

    /// Checks the options, fills in defaults and decides on the bump policy.
    ///
    /// Runs before any file is touched.
    pub fn validate(&mut self) -> Result<BumpPolicy, anyhow::Error> {
        if self.prefixes.is_empty() {
            bail!("must have at least one prefix specified");
        }
        for prefix in &self.prefixes {
            if prefix.prefix.is_empty() {
                bail!("prefix {:?} has an empty prefix string", prefix.name);
            }
            if !prefix.consistent_image_exceptions.is_empty() && !prefix.consistent_images {
                bail!(
                    "consistentImageExceptions requires consistentImages to be true, found in prefix {:?}",
                    prefix.name
                );
            }
        }
        if self.included_config_paths.is_empty() {
            bail!("includedConfigPaths is mandatory");
        }

        if !self.skip_pull_request {
            if self.git_hub_org.is_empty() || self.git_hub_repo.is_empty() {
                bail!("gitHubOrg and gitHubRepo are mandatory when skipPullRequest is false or unspecified");
            }
            if self.remote_name.is_empty() {
                bail!("remoteName is mandatory when skipPullRequest is false or unspecified");
            }
        }
        if self.git_email.is_empty() != self.git_name.is_empty() {
            bail!("gitName and gitEmail must be specified together");
        }
        if !self.image_registry_auth.is_empty() && self.image_registry_auth != GOOGLE_IMAGE_REGISTRY_AUTH {
            bail!(
                "imageRegistryAuth has incorrect value: {:?}. Only \"\" and {GOOGLE_IMAGE_REGISTRY_AUTH:?} are allowed",
                self.image_registry_auth
            );
        }
        if self.head_branch_name.is_empty() {
            self.head_branch_name = DEFAULT_HEAD_BRANCH_NAME.to_string();
        }
        if self.git_hub_host.is_empty() {
            self.git_hub_host = DEFAULT_GITHUB_HOST.to_string();
        }

        let target_version = self.target_version.as_str();
        let is_upstream = target_version == UPSTREAM_VERSION || target_version == UPSTREAM_STAGING_VERSION;
        if target_version.is_empty() {
            bail!("targetVersion is mandatory");
        }
        if !is_upstream && target_version != LATEST_VERSION && !PINNED_TAG_REGEX.is_match(target_version) {
            warn!(
                target_version,
                allowed = ?[LATEST_VERSION, UPSTREAM_VERSION, UPSTREAM_STAGING_VERSION, "vYYYYMMDD-deadbeef"],
                "targetVersion is not one of the known forms, it might not work properly"
            );
        }
        if is_upstream && self.upstream_url_base.is_empty() {
            warn!(
                default = DEFAULT_UPSTREAM_URL_BASE,
                "targetVersion {target_version:?} without upstreamURLBase, using the default"
            );
            self.upstream_url_base = DEFAULT_UPSTREAM_URL_BASE.to_string();
        }

        BumpPolicy::new(target_version, &self.upstream_url_base, &self.prefixes)
            .map_err(|err| anyhow!("invalid targetVersion {target_version:?}: {err:#}"))
    }

    pub fn needs_bot_identity(&self) -> bool {
        self.git_hub_login.is_empty() || self.git_name.is_empty() || self.git_email.is_empty()
    }

    /// Fills login, name and email that were left out of the config from the token's user.
    pub fn apply_bot_user(&mut self, user: &BotUser) {
        if self.git_hub_login.is_empty() {
            self.git_hub_login.clone_from(&user.login);
        }
        if self.git_name.is_empty() {
            self.git_name = user.name.clone().unwrap_or_default();
        }
        if self.git_email.is_empty() {
            self.git_email = user.email.clone().unwrap_or_default();
        }
    }
}
