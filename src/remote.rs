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

use std::fmt;

use anyhow::{bail, Context};
use url::Url;

/// The fork the bump branch is pushed to, `https://{host}/{owner}/{repository}.git`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Remote {
    pub host: url::Host,
    pub owner: String,
    pub repository: String,
    url: Url,
}

impl Remote {
    pub fn fork(host: &str, login: &str, remote_name: &str) -> Result<Self, anyhow::Error> {
        if login.is_empty() || remote_name.is_empty() {
            bail!("cannot build a fork remote without login and remote name, got {login:?} and {remote_name:?}");
        }
        Self::parse(&format!("https://{host}/{login}/{remote_name}.git"))
    }

    pub fn parse(url: &str) -> Result<Self, anyhow::Error> {
        let remote_url = Url::parse(url).with_context(|| format!("can't parse remote {url:?}"))?;
        let path_elements: Vec<&str> = remote_url.path().trim_start_matches('/').split('/').collect();
        let [owner, repository] = path_elements[..] else {
            bail!("remote {url:?} is not of the form https://host/owner/repository");
        };
        Ok(Self {
            host: remote_url.host().context("remote has no host")?.to_owned(),
            owner: owner.to_string(),
            repository: repository.trim_end_matches(".git").to_string(),
            url: remote_url,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.host, self.owner, self.repository)
    }
}
