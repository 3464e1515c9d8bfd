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

use std::collections::{BTreeMap, BTreeSet};

use anyhow::bail;

use crate::config::Prefix;
use crate::images::{commit_to_ref, deconstruct_tag, format_tag_date, format_variant, unique_images, ImageRef};

/// Old `host/name:tag` -> new tag, only for images whose tag changed.
pub type ReplacementMap = BTreeMap<String, String>;

/// New tag -> old `host/name:tag` strings that moved to it.
pub type VersionsIndex = BTreeMap<String, Vec<String>>;

/// The checked outcome of a scan, ready to be described in a commit and a PR.
#[derive(Clone, Debug)]
pub struct BumpChangeset {
    pub replacements: ReplacementMap,
    pub versions: VersionsIndex,
}

impl BumpChangeset {
    pub fn new(prefixes: &[Prefix], replacements: ReplacementMap) -> Result<Self, anyhow::Error> {
        let versions = check_consistency(prefixes, &replacements)?;
        Ok(Self { replacements, versions })
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    /// One line used as PR title.
    pub fn summary(&self, prefixes: &[Prefix]) -> String {
        commit_summary(prefixes, &self.versions)
    }

    pub fn commit_message(&self, prefixes: &[Prefix]) -> String {
        let names: Vec<&str> = prefixes.iter().map(|p| p.name.as_str()).collect();
        format!("Bumping {}\n\n{}", names.join(" and "), self.prefix_summaries(prefixes))
    }

    pub fn pr_body(&self, prefixes: &[Prefix], additional_body: &str, assign_to: &str) -> String {
        let mut body = self.prefix_summaries(prefixes) + "\n";
        if !additional_body.is_empty() {
            body += additional_body;
            body += "\n";
        }
        if !assign_to.is_empty() {
            body += &format!("/cc @{assign_to}\n");
        }
        body
    }

    fn prefix_summaries(&self, prefixes: &[Prefix]) -> String {
        prefixes
            .iter()
            .map(|prefix| prefix_summary(prefix, &self.replacements) + "\n\n")
            .collect()
    }
}

/// Fails when an image of a consistent prefix moved to another tag than its siblings.
///
/// Returns the versions index over all prefixes.
pub fn check_consistency(prefixes: &[Prefix], replacements: &ReplacementMap) -> Result<VersionsIndex, anyhow::Error> {
    let mut versions: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for prefix in prefixes {
        // (image, tag) every other non-excepted image of this prefix has to agree with
        let mut reference: Option<(&str, &str)> = None;

        for (image, new_tag) in replacements {
            if !prefix.owns(image) {
                continue;
            }
            let image_path = ImageRef::parse(image).map_or_else(|| image.clone(), |i| i.path());

            if prefix.consistent_images && !prefix.is_exception(&image_path) {
                match reference {
                    Some((reference_image, reference_tag)) if reference_tag != new_tag => {
                        bail!(
                            "{image} -> {new_tag} not bumped consistently for prefix {} ({}), expected version \
                             {reference_tag} based on bump of {reference_image}",
                            prefix.prefix,
                            prefix.name
                        );
                    },
                    Some(_) => {},
                    None => reference = Some((image.as_str(), new_tag.as_str())),
                }
            }

            versions.entry(new_tag.clone()).or_default().push(image.clone());
        }
    }

    Ok(versions.into_iter().map(|(tag, images)| (tag, unique_images(images))).collect())
}

/// Commit summary such as `Update Prow to v20230601-222222 and Boskos, alpine as needed`.
pub fn commit_summary(prefixes: &[Prefix], versions: &VersionsIndex) -> String {
    if versions.is_empty() {
        let names: Vec<&str> = prefixes.iter().map(|p| p.name.as_str()).collect();
        return format!("Update {} images as necessary", names.join(", "));
    }

    let mut consistent_bumps = Vec::new();
    let mut as_needed = Vec::new();
    for prefix in prefixes {
        let bumped: Vec<(&str, String)> = versions
            .iter()
            .flat_map(|(tag, images)| images.iter().map(move |image| (tag.as_str(), image)))
            .filter(|(_, image)| prefix.owns(image))
            .map(|(tag, image)| (tag, ImageRef::parse(image).map_or_else(|| image.clone(), |i| i.path())))
            .collect();
        if bumped.is_empty() {
            continue;
        }
        if !prefix.consistent_images {
            as_needed.push(prefix.name.clone());
            continue;
        }

        let reference_tag = bumped
            .iter()
            .find(|(_, path)| !prefix.is_exception(path))
            .map(|(tag, _)| *tag);
        if let Some(tag) = reference_tag {
            consistent_bumps.push(format!("{} to {tag}", prefix.name));
        }
        let exceptions: BTreeSet<&str> = bumped
            .iter()
            .filter(|(tag, path)| prefix.is_exception(path) && Some(*tag) != reference_tag)
            .map(|(_, path)| prefix.component(path))
            .collect();
        as_needed.extend(exceptions.into_iter().map(ToString::to_string));
    }

    let mut messages = Vec::new();
    if !consistent_bumps.is_empty() {
        messages.push(consistent_bumps.join(", "));
    }
    if !as_needed.is_empty() {
        messages.push(format!("{} as needed", as_needed.join(", ")));
    }
    format!("Update {}", messages.join(" and "))
}

struct Delta {
    old_date: String,
    new_date: String,
    component: String,
}

/// Human readable description of what changed below one prefix, with compare links into its repo.
pub fn prefix_summary(prefix: &Prefix, replacements: &ReplacementMap) -> String {
    // "old commit:new commit" -> images that made that move
    let mut moves: BTreeMap<(String, String), Vec<Delta>> = BTreeMap::new();
    for (image, new_tag) in replacements {
        if !prefix.owns(image) {
            continue;
        }
        let Some(image) = ImageRef::parse(image) else {
            continue;
        };
        let old = deconstruct_tag(&image.tag).unwrap_or_default();
        let new = deconstruct_tag(new_tag).unwrap_or_default();
        let key = (
            commit_to_ref(&old.commit).to_string(),
            commit_to_ref(&new.commit).to_string(),
        );
        moves.entry(key).or_default().push(Delta {
            old_date: old.date,
            new_date: new.date,
            component: format!("{}{}", prefix.component(&image.path()), format_variant(&old.variant)),
        });
    }

    let repo = prefix.repo.trim_end_matches('/');
    if moves.is_empty() {
        return format!("No {} changes.", prefix.prefix);
    }
    if let (true, Some(((old_commit, new_commit), deltas))) = (prefix.summarise && moves.len() == 1, moves.iter().next()) {
        return format!(
            "{} changes: {repo}/compare/{old_commit}...{new_commit} ({} → {})",
            prefix.prefix,
            format_tag_date(&deltas[0].old_date),
            format_tag_date(&deltas[0].new_date)
        );
    }

    let mut rows: Vec<(String, String)> = moves
        .iter()
        .map(|((old_commit, new_commit), deltas)| {
            let mut names: Vec<&str> = deltas.iter().map(|d| d.component.as_str()).collect();
            names.sort_unstable();
            let dates = format!(
                "{}&nbsp;&#x2192;&nbsp;{}",
                format_tag_date(&deltas[0].old_date),
                format_tag_date(&deltas[0].new_date)
            );
            let row = format!("{repo}/compare/{old_commit}...{new_commit} | {dates} | {}", names.join(", "));
            (dates, row)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    let rows: Vec<String> = rows.into_iter().map(|(_, row)| row).collect();

    format!(
        "Multiple distinct {} changes:\n\nCommits | Dates | Images\n--- | --- | ---\n{}\n",
        prefix.prefix,
        rows.join("\n")
    )
}
