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

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use tracing::debug;

use crate::images::tag_version_and_variant;

/// Tag queries against an image registry.
pub trait Registry {
    /// Most recent tag of `host/name` that carries the same variant suffix as `current_tag`.
    fn latest_tag(
        &self,
        host: &str,
        name: &str,
        current_tag: &str,
    ) -> impl Future<Output = anyhow::Result<String>> + Send;

    fn tag_exists(&self, host: &str, name: &str, tag: &str) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TagList {
    #[serde(default)]
    pub tags: Vec<String>,
    /// Google registries add creation times per digest.
    #[serde(default)]
    pub manifest: BTreeMap<String, ManifestEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "timeCreatedMs", default)]
    pub time_created_ms: String,
    #[serde(rename = "tag", default)]
    pub tags: Vec<String>,
}

impl TagList {
    fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag) || self.manifest.values().any(|e| e.tags.iter().any(|t| t == tag))
    }
}

/// Value of `imageRegistryAuth` that selects Google application default credentials.
pub const GOOGLE_IMAGE_REGISTRY_AUTH: &str = "google";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// How tag list requests authenticate against the registry.
#[derive(Clone, Default)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    /// Private Artifact Registry and GCR repositories.
    Google(Arc<dyn gcp_auth::TokenProvider>),
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Google(_) => f.write_str("Google"),
        }
    }
}

impl RegistryAuth {
    /// Builds the auth for an `imageRegistryAuth` config value.
    pub async fn from_config(kind: &str) -> anyhow::Result<Self> {
        match kind {
            "" => Ok(Self::Anonymous),
            GOOGLE_IMAGE_REGISTRY_AUTH => {
                let provider = gcp_auth::provider()
                    .await
                    .context("failed to find Google credentials for the image registry")?;
                Ok(Self::Google(provider))
            },
            other => bail!("unknown image registry auth {other:?}"),
        }
    }

    async fn bearer_token(&self) -> anyhow::Result<Option<String>> {
        match self {
            Self::Anonymous => Ok(None),
            Self::Google(provider) => {
                let token = provider
                    .token(&[CLOUD_PLATFORM_SCOPE])
                    .await
                    .context("failed to get a Google access token")?;
                Ok(Some(token.as_str().to_string()))
            },
        }
    }
}

/// Talks to the registry's `/v2/<name>/tags/list` endpoint.
#[derive(Debug)]
pub struct HttpRegistry {
    http: reqwest::Client,
    auth: RegistryAuth,
    // keyed by host/name, a run never needs a fresher listing than the first one
    tag_lists: Mutex<HashMap<String, Arc<TagList>>>,
}

impl HttpRegistry {
    pub fn new(http: reqwest::Client, auth: RegistryAuth) -> Self {
        Self {
            http,
            auth,
            tag_lists: Mutex::new(HashMap::new()),
        }
    }

    fn tag_list_request(&self, uri: &str, token: Option<&str>) -> reqwest::RequestBuilder {
        let mut req = self.http.get(uri);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn tag_list(&self, host: &str, name: &str) -> anyhow::Result<Arc<TagList>> {
        let key = format!("{host}/{name}");
        if let Some(list) = self.tag_lists.lock().map_err(|_| anyhow!("tag list cache poisoned"))?.get(&key) {
            return Ok(list.clone());
        }

        let uri = format!("https://{host}/v2/{name}/tags/list");
        debug!(%uri, auth = ?self.auth, "fetching tag list");
        let token = self.auth.bearer_token().await?;
        let list: TagList = self
            .tag_list_request(&uri, token.as_deref())
            .send()
            .await
            .with_context(|| format!("couldn't fetch tag list from {uri}"))?
            .error_for_status()
            .with_context(|| format!("registry refused tag list request {uri}"))?
            .json()
            .await
            .context("couldn't parse tag information from registry")?;

        let list = Arc::new(list);
        self.tag_lists
            .lock()
            .map_err(|_| anyhow!("tag list cache poisoned"))?
            .insert(key, list.clone());
        Ok(list)
    }
}

impl Registry for HttpRegistry {
    async fn latest_tag(&self, host: &str, name: &str, current_tag: &str) -> anyhow::Result<String> {
        let (version, variant) = tag_version_and_variant(current_tag)
            .ok_or_else(|| anyhow!("couldn't figure out the current tag in {current_tag:?}"))?;
        if version == "latest" {
            return Ok(current_tag.to_string());
        }

        let list = self.tag_list(host, name).await?;
        pick_best_tag(variant, &list.manifest)
    }

    async fn tag_exists(&self, host: &str, name: &str, tag: &str) -> anyhow::Result<bool> {
        Ok(self.tag_list(host, name).await?.contains(tag))
    }
}

/// Finds the most recently created tag with the same variant suffix.
///
/// A digest that is also tagged `latest` (with that variant) wins regardless of creation time.
/// Within one digest the shortest matching tag is preferred.
pub fn pick_best_tag(variant: &str, manifest: &BTreeMap<String, ManifestEntry>) -> anyhow::Result<String> {
    let mut latest_time = 0_i64;
    let mut latest_tag = String::new();

    for entry in manifest.values() {
        let mut best_tag: Option<&str> = None;
        let mut is_latest = false;

        for tag in &entry.tags {
            let Some((tag_version, tag_variant)) = tag_version_and_variant(tag) else {
                continue;
            };
            if tag_variant != variant {
                continue;
            }
            if tag_version == "latest" {
                is_latest = true;
                continue;
            }
            if best_tag.is_none_or(|best| tag.len() < best.len()) {
                best_tag = Some(tag);
            }
        }

        let Some(best_tag) = best_tag else {
            continue;
        };

        let time_created: i64 = entry
            .time_created_ms
            .parse()
            .with_context(|| format!("couldn't parse timestamp {:?}", entry.time_created_ms))?;

        if is_latest || time_created > latest_time {
            latest_time = time_created;
            best_tag.clone_into(&mut latest_tag);
            if is_latest {
                break;
            }
        }
    }

    if latest_tag.is_empty() {
        bail!("failed to find a suitable tag");
    }
    Ok(latest_tag)
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockRegistry {
    /// host/name:tag -> latest tag
    pub latest: Mutex<HashMap<String, String>>,
    /// host/name -> existing tags
    pub tags: Mutex<HashMap<String, Vec<String>>>,
}

#[cfg(test)]
impl MockRegistry {
    pub fn with_latest(entries: &[(&str, &str)]) -> Self {
        let registry = Self::default();
        for (image, tag) in entries {
            registry.latest.lock().unwrap().insert((*image).to_string(), (*tag).to_string());
        }
        registry
    }

    pub fn with_tags(entries: &[(&str, &[&str])]) -> Self {
        let registry = Self::default();
        for (image, tags) in entries {
            registry
                .tags
                .lock()
                .unwrap()
                .insert((*image).to_string(), tags.iter().map(ToString::to_string).collect());
        }
        registry
    }
}

#[cfg(test)]
impl Registry for MockRegistry {
    async fn latest_tag(&self, host: &str, name: &str, current_tag: &str) -> anyhow::Result<String> {
        let image = format!("{host}/{name}:{current_tag}");
        self.latest
            .lock()
            .unwrap()
            .get(&image)
            .cloned()
            .ok_or_else(|| anyhow!("MockRegistry latest contains no {image}"))
    }

    async fn tag_exists(&self, host: &str, name: &str, tag: &str) -> anyhow::Result<bool> {
        let image = format!("{host}/{name}");
        Ok(self
            .tags
            .lock()
            .unwrap()
            .get(&image)
            .ok_or_else(|| anyhow!("MockRegistry tags contains no {image}"))?
            .iter()
            .any(|t| t == tag))
    }
}
