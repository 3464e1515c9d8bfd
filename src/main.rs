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

#![warn(clippy::pedantic)]

mod api_clients;
mod autobump;
mod changes;
mod config;
mod credentials;
mod github;
mod images;
mod publisher;
mod registry;
mod remote;
mod repo;
mod resolver;
mod scanner;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use api_clients::{api_endpoint_for_host, RealClient};
use autobump::Workspace;
use clap::builder::styling::Style;
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use config::Options;
use registry::{HttpRegistry, RegistryAuth};
use resolver::{TagPicker, TagResolver};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const BOLD_UNDERLINE: Style = Style::new().bold().underline();
static ENV_HELP: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{BOLD_UNDERLINE}Environment variables:{BOLD_UNDERLINE:#}
  AUTOBUMP_CONFIG              Path to the autobumper config, same as --autobump-config
  GITHUB_WORKSPACE             Repository to bump, same as --workspace
  GOOGLE_APPLICATION_CREDENTIALS
                               Service account key used when imageRegistryAuth is google
  RUST_LOG                     Log filter, defaults to info
"
    )
});

/// Bumps container image tags in a config tree and proposes the result as a pull request
#[derive(Parser)]
#[command(version, about, long_about = None, after_help = ENV_HELP.to_string())]
struct Cli {
    /// YAML file with the autobumper options and image prefixes
    #[arg(long, env = "AUTOBUMP_CONFIG", hide_env_values = true, value_parser = NonEmptyStringValueParser::new())]
    autobump_config: String,

    /// File holding the GitHub token, re-read right before publishing
    #[arg(long, default_value = "/etc/github/token")]
    github_token_path: PathBuf,

    /// Comma separated labels to use instead of the ones from the config
    #[arg(long, value_delimiter = ',')]
    labels_override: Option<Vec<String>>,

    /// Rewrite and commit locally, but neither push nor open a pull request
    #[arg(long)]
    skip_pull_request: bool,

    /// Add a Signed-off-by trailer to the commit
    #[arg(long)]
    signoff: bool,

    /// Git repository containing the configured paths
    #[arg(long, env = "GITHUB_WORKSPACE", hide_env_values = true, default_value = ".")]
    workspace: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut options = Options::load(Path::new(&cli.autobump_config))?;
    if let Some(labels) = cli.labels_override {
        options.labels = labels;
    }
    options.skip_pull_request |= cli.skip_pull_request;
    options.signoff |= cli.signoff;
    let policy = options.validate().context("while validating options")?;
    info!(config = %cli.autobump_config, target_version = %options.target_version, "starting image-autobumper");

    let workspace = Workspace {
        root: cli.workspace,
        token_path: cli.github_token_path,
    };
    let token = match autobump::read_token(&workspace.token_path) {
        Ok(token) => token,
        Err(err) if options.skip_pull_request => {
            debug!("continuing without token: {err:#}");
            String::new()
        },
        Err(err) => return Err(err),
    };

    let http = reqwest::Client::builder()
        .user_agent(concat!("image-autobumper/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reqwest client")?;
    let picker = TagPicker::from_policy(&policy, &http)
        .await
        .context("while resolving the target version")?;
    let auth = RegistryAuth::from_config(&options.image_registry_auth).await?;
    let mut resolver = TagResolver::new(picker, HttpRegistry::new(http, auth));

    let client = RealClient::new(&token, api_endpoint_for_host(&options.git_hub_host))?;
    let report = autobump::run(&mut options, &mut resolver, &client, &workspace, autobump::github_fork_url).await?;
    info!(
        bumped_images = report.replacements.len(),
        published = report.publish.is_some(),
        "image-autobumper finished"
    );

    Ok(())
}
