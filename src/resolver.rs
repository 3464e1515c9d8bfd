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

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Context};
use regex::Regex;
use tracing::{debug, info};

use crate::config::Prefix;
use crate::registry::Registry;

pub const LATEST_VERSION: &str = "latest";
pub const UPSTREAM_VERSION: &str = "upstream";
pub const UPSTREAM_STAGING_VERSION: &str = "upstream-staging";

static UPSTREAM_IMAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.+image:(.+):(v[a-zA-Z0-9_.-]+)").expect("upstream image regex must compile"));

/// How the new tag of every matched image is chosen. Decided once per run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BumpPolicy {
    Latest,
    Upstream(UpstreamRefs),
    UpstreamStaging(UpstreamRefs),
    Pinned(String),
}

/// Where the upstream reference documents live, one per prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamRefs {
    pub base_url: String,
    /// (prefix string, reference file path)
    pub ref_files: Vec<(String, String)>,
}

impl UpstreamRefs {
    pub fn address(&self, ref_file: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), ref_file)
    }
}

impl BumpPolicy {
    pub fn new(target_version: &str, upstream_url_base: &str, prefixes: &[Prefix]) -> anyhow::Result<Self> {
        let upstream_refs = |field: &str, file_of: fn(&Prefix) -> &String| -> anyhow::Result<UpstreamRefs> {
            if upstream_url_base.is_empty() {
                bail!("targetVersion {target_version:?} requires upstreamURLBase");
            }
            let mut ref_files = Vec::with_capacity(prefixes.len());
            for prefix in prefixes {
                let file = file_of(prefix);
                if file.is_empty() {
                    bail!(
                        "targetVersion can't be {target_version:?} without {field} for each prefix, {:?} is missing one",
                        prefix.name
                    );
                }
                ref_files.push((prefix.prefix.clone(), file.clone()));
            }
            Ok(UpstreamRefs {
                base_url: upstream_url_base.to_string(),
                ref_files,
            })
        };

        Ok(match target_version {
            LATEST_VERSION => Self::Latest,
            UPSTREAM_VERSION => Self::Upstream(upstream_refs("refConfigFile", |p| &p.ref_config_file)?),
            UPSTREAM_STAGING_VERSION => {
                Self::UpstreamStaging(upstream_refs("stagingRefConfigFile", |p| &p.staging_ref_config_file)?)
            },
            "" => bail!("empty target version"),
            tag => Self::Pinned(tag.to_string()),
        })
    }
}

/// The policy with its upstream documents already resolved to versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagPicker {
    Latest,
    /// (prefix string, upstream version)
    Upstream(Vec<(String, String)>),
    Pinned(String),
}

impl TagPicker {
    /// Fetches the upstream reference document of every prefix for the upstream policies.
    pub async fn from_policy(policy: &BumpPolicy, http: &reqwest::Client) -> anyhow::Result<Self> {
        Ok(match policy {
            BumpPolicy::Latest => Self::Latest,
            BumpPolicy::Pinned(tag) => Self::Pinned(tag.clone()),
            BumpPolicy::Upstream(refs) | BumpPolicy::UpstreamStaging(refs) => {
                let mut versions = Vec::with_capacity(refs.ref_files.len());
                for (prefix, ref_file) in &refs.ref_files {
                    let address = refs.address(ref_file);
                    let version = fetch_upstream_version(http, &address, prefix)
                        .await
                        .with_context(|| format!("failed to resolve the upstream version of {prefix}"))?;
                    info!(%prefix, %version, "resolved upstream version");
                    versions.push((prefix.clone(), version));
                }
                Self::Upstream(versions)
            },
        })
    }
}

pub async fn fetch_upstream_version(http: &reqwest::Client, address: &str, prefix: &str) -> anyhow::Result<String> {
    let response = http
        .get(address)
        .send()
        .await
        .with_context(|| format!("error sending GET request to {address:?}"))?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        bail!("HTTP error {status} fetching upstream config file {address:?}");
    }
    let document = response.text().await.context("error reading the response body")?;
    parse_upstream_version(&document, prefix)
}

/// Returns the tag of the first `image:` line whose image contains `prefix`.
pub fn parse_upstream_version(document: &str, prefix: &str) -> anyhow::Result<String> {
    document
        .lines()
        .filter_map(|line| UPSTREAM_IMAGE_REGEX.captures(line))
        .find(|captures| captures[1].contains(prefix))
        .map(|captures| captures[2].to_string())
        .ok_or_else(|| anyhow!("unable to find match for {prefix} in upstream refConfigFile"))
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unable to bump {image}, image tag {tag} does not exist for {name}")]
    MissingUpstreamTag { image: String, tag: String, name: String },
    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// Picks the new tag for every image the scanner hands in.
pub struct TagResolver<R> {
    picker: TagPicker,
    registry: R,
    // host/name:tag -> resolved tag
    cache: HashMap<String, String>,
    pinned: BTreeSet<String>,
}

impl<R: Registry> TagResolver<R> {
    pub fn new(picker: TagPicker, registry: R) -> Self {
        Self {
            picker,
            registry,
            cache: HashMap::new(),
            pinned: BTreeSet::new(),
        }
    }

    /// Images that stay at their current tag because the upstream tag is missing for them.
    pub fn pinned_images(&self) -> &BTreeSet<String> {
        &self.pinned
    }

    pub async fn resolve(&mut self, host: &str, name: &str, current_tag: &str) -> Result<String, ResolveError> {
        let image = format!("{host}/{name}:{current_tag}");
        if let Some(tag) = self.cache.get(&image) {
            return Ok(tag.clone());
        }

        let tag = match &self.picker {
            TagPicker::Pinned(tag) => tag.clone(),
            TagPicker::Latest => self.registry.latest_tag(host, name, current_tag).await?,
            TagPicker::Upstream(versions) => {
                let Some(version) = versions
                    .iter()
                    .filter(|(prefix, _)| image.starts_with(prefix.as_str()))
                    .max_by_key(|(prefix, _)| prefix.len())
                    .map(|(_, version)| version.clone())
                else {
                    debug!(%image, "no upstream version for image");
                    return Ok(current_tag.to_string());
                };

                if !self.registry.tag_exists(host, name, &version).await? {
                    self.cache.insert(image.clone(), current_tag.to_string());
                    self.pinned.insert(image.clone());
                    return Err(ResolveError::MissingUpstreamTag {
                        image,
                        tag: version,
                        name: name.to_string(),
                    });
                }
                version
            },
        };

        self.cache.insert(image, tag.clone());
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MockRegistry;

    const DECK_DEPLOYMENT: &str = r"
apiVersion: apps/v1
kind: Deployment
spec:
  template:
    spec:
      containers:
        - name: deck
          image: gcr.io/k8s-prow/deck:v20230601-222222
        - name: sidecar
          image: gcr.io/k8s-staging-boskos/boskos:v20230501-111111
";

    fn prefix(name: &str, prefix: &str, ref_file: &str) -> Prefix {
        Prefix {
            name: name.to_string(),
            prefix: prefix.to_string(),
            ref_config_file: ref_file.to_string(),
            ..Prefix::default()
        }
    }

    #[test]
    fn policy_from_target_version() {
        let prefixes = vec![prefix("Prow", "gcr.io/k8s-prow/", "deck.yaml")];
        assert_eq!(BumpPolicy::new("latest", "", &prefixes).unwrap(), BumpPolicy::Latest);
        assert_eq!(
            BumpPolicy::new("v20230101-abcdef", "", &prefixes).unwrap(),
            BumpPolicy::Pinned("v20230101-abcdef".to_string())
        );
        assert_eq!(
            BumpPolicy::new("upstream", "https://example.com/base/", &prefixes).unwrap(),
            BumpPolicy::Upstream(UpstreamRefs {
                base_url: "https://example.com/base/".to_string(),
                ref_files: vec![("gcr.io/k8s-prow/".to_string(), "deck.yaml".to_string())],
            })
        );
        assert!(BumpPolicy::new("upstream-staging", "https://example.com", &prefixes).is_err());
        assert!(BumpPolicy::new("upstream", "", &prefixes).is_err());
    }

    #[test]
    fn upstream_address() {
        let refs = UpstreamRefs {
            base_url: "https://example.com/base/".to_string(),
            ref_files: Vec::new(),
        };
        assert_eq!(refs.address("deck.yaml"), "https://example.com/base/deck.yaml");
    }

    #[test]
    fn parses_upstream_document() {
        assert_eq!(
            parse_upstream_version(DECK_DEPLOYMENT, "gcr.io/k8s-prow/").unwrap(),
            "v20230601-222222"
        );
        assert_eq!(
            parse_upstream_version(DECK_DEPLOYMENT, "gcr.io/k8s-staging-boskos/").unwrap(),
            "v20230501-111111"
        );
        let err = parse_upstream_version(DECK_DEPLOYMENT, "gcr.io/other/").unwrap_err();
        assert!(err.to_string().contains("unable to find match for gcr.io/other/"));
    }

    #[tokio::test]
    async fn pinned_ignores_registry_and_current_tag() {
        let mut resolver = TagResolver::new(TagPicker::Pinned("v20230101-abcdef".to_string()), MockRegistry::default());
        for current in ["v20200101-000000", "latest", "v20990101-ffffff"] {
            let tag = resolver.resolve("registry.example.com", "a/foo", current).await.unwrap();
            assert_eq!(tag, "v20230101-abcdef");
        }
    }

    #[tokio::test]
    async fn latest_uses_registry_and_propagates_errors() {
        let registry = MockRegistry::with_latest(&[("registry.example.com/a/foo:v1", "v2")]);
        let mut resolver = TagResolver::new(TagPicker::Latest, registry);
        assert_eq!(resolver.resolve("registry.example.com", "a/foo", "v1").await.unwrap(), "v2");
        assert!(matches!(
            resolver.resolve("registry.example.com", "a/bar", "v1").await,
            Err(ResolveError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn upstream_prefers_longest_prefix() {
        let registry = MockRegistry::with_tags(&[("gcr.io/k8s-prow/deck", &["v1", "v2"])]);
        let picker = TagPicker::Upstream(vec![
            ("gcr.io/".to_string(), "v1".to_string()),
            ("gcr.io/k8s-prow/".to_string(), "v2".to_string()),
        ]);
        let mut resolver = TagResolver::new(picker, registry);
        assert_eq!(resolver.resolve("gcr.io", "k8s-prow/deck", "v0").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn upstream_leaves_unowned_images_alone() {
        let picker = TagPicker::Upstream(vec![("gcr.io/k8s-prow/".to_string(), "v2".to_string())]);
        let mut resolver = TagResolver::new(picker, MockRegistry::default());
        assert_eq!(resolver.resolve("quay.io", "other/tool", "v0").await.unwrap(), "v0");
    }

    #[tokio::test]
    async fn upstream_missing_tag_pins_image() {
        let registry = MockRegistry::with_tags(&[("gcr.io/k8s-prow/hook", &["v1"])]);
        let picker = TagPicker::Upstream(vec![("gcr.io/k8s-prow/".to_string(), "v2".to_string())]);
        let mut resolver = TagResolver::new(picker, registry);

        let err = resolver.resolve("gcr.io", "k8s-prow/hook", "v1").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to bump gcr.io/k8s-prow/hook:v1, image tag v2 does not exist for k8s-prow/hook"
        );
        assert!(resolver.pinned_images().contains("gcr.io/k8s-prow/hook:v1"));

        // the decision is remembered for further occurrences of the same image
        assert_eq!(resolver.resolve("gcr.io", "k8s-prow/hook", "v1").await.unwrap(), "v1");
    }
}
