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

use anyhow::{anyhow, Context};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::changes::ReplacementMap;
use crate::config::Prefix;
use crate::images::{ImageRef, IMAGE_REGEX};
use crate::registry::Registry;
use crate::resolver::{ResolveError, TagResolver};

/// Which files a scan visits.
#[derive(Clone, Debug, Default)]
pub struct ScanTargets {
    /// Directories are walked recursively, only `.yaml`/`.yml` files are rewritten.
    pub included: Vec<PathBuf>,
    pub excluded: Vec<PathBuf>,
    /// Always rewritten, whatever their extension.
    pub extra: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub replacements: ReplacementMap,
    /// Files whose content was rewritten, in visiting order.
    pub touched_files: Vec<PathBuf>,
    /// Images whose upstream tag does not exist in their registry. They keep their current tag.
    pub unresolved: Vec<ResolveError>,
}

impl ScanOutcome {
    /// One error naming every image that could not be bumped to its upstream tag.
    pub fn unresolved_error(&self) -> Option<anyhow::Error> {
        if self.unresolved.is_empty() {
            return None;
        }
        let messages: Vec<String> = self.unresolved.iter().map(ToString::to_string).collect();
        Some(anyhow!(
            "some images could not be bumped to the upstream version: {}",
            messages.join("; ")
        ))
    }
}

/// Builds `^(?:p1|p2|...)` out of the literal prefix strings.
pub fn prefix_filter(prefixes: &[Prefix]) -> anyhow::Result<Regex> {
    let alternation = prefixes
        .iter()
        .map(|prefix| regex::escape(&prefix.prefix))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!("^(?:{alternation})");
    Regex::new(&pattern).with_context(|| format!("bad regexp {pattern:?}"))
}

/// Rewrites the tags of every image matched by `filter` in the target files.
///
/// Per-image resolver failures are logged and leave that reference untouched. Missing upstream
/// tags additionally end up in [`ScanOutcome::unresolved`], the rest of the bump goes on.
/// Only I/O failures abort the scan.
pub async fn scan<R: Registry>(
    targets: &ScanTargets,
    filter: &Regex,
    resolver: &mut TagResolver<R>,
) -> anyhow::Result<ScanOutcome> {
    info!("bumping image references");
    let mut scanner = Scanner {
        filter,
        resolver,
        outcome: ScanOutcome::default(),
    };

    for path in &targets.included {
        let metadata = std::fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
        let files = if metadata.is_dir() {
            walk_files(path).with_context(|| format!("failed to list files under {}", path.display()))?
        } else {
            vec![path.clone()]
        };
        for file in files {
            if is_yaml(&file) && !is_under_path(&file, &targets.excluded) {
                scanner.update_file(&file).await?;
            }
        }
    }

    for file in &targets.extra {
        scanner
            .update_file(file)
            .await
            .with_context(|| format!("failed to update the extra file {}", file.display()))?;
    }

    Ok(scanner.outcome)
}

struct Scanner<'a, R> {
    filter: &'a Regex,
    resolver: &'a mut TagResolver<R>,
    outcome: ScanOutcome,
}

impl<R: Registry> Scanner<'_, R> {
    async fn update_file(&mut self, path: &Path) -> anyhow::Result<()> {
        info!(file = %path.display(), "updating file");
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        let new_content = self.update_all_tags(&content).await;
        if new_content != content {
            tokio::fs::write(path, new_content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            self.outcome.touched_files.push(path.to_path_buf());
        }
        Ok(())
    }

    async fn update_all_tags(&mut self, content: &[u8]) -> Vec<u8> {
        let matches: Vec<(usize, usize, ImageRef)> = IMAGE_REGEX
            .captures_iter(content)
            .filter_map(|captures| {
                let tag = captures.get(3)?;
                let image = ImageRef::new(
                    std::str::from_utf8(&captures[1]).ok()?,
                    std::str::from_utf8(&captures[2]).ok()?,
                    std::str::from_utf8(tag.as_bytes()).ok()?,
                );
                Some((tag.start(), tag.end(), image))
            })
            .collect();

        let mut new_content = Vec::with_capacity(content.len());
        let mut last_index = 0;
        for (start, end, image) in matches {
            if !self.filter.is_match(&image.path()) {
                continue;
            }

            let new_tag = match self.resolver.resolve(&image.host, &image.name, &image.tag).await {
                Ok(tag) => tag,
                Err(err) => {
                    warn!(image = %image, "failed to update image: {err:#}");
                    if matches!(err, ResolveError::MissingUpstreamTag { .. }) {
                        self.outcome.unresolved.push(err);
                    }
                    continue;
                },
            };
            if new_tag == image.tag {
                continue;
            }

            new_content.extend_from_slice(&content[last_index..start]);
            new_content.extend_from_slice(new_tag.as_bytes());
            last_index = end;
            self.outcome.replacements.insert(image.to_string(), new_tag);
        }
        new_content.extend_from_slice(&content[last_index..]);
        new_content
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"))
}

fn is_under_path(path: &Path, excluded: &[PathBuf]) -> bool {
    excluded
        .iter()
        .any(|excluded| !excluded.as_os_str().is_empty() && path.starts_with(excluded))
}

/// Every file below `dir`, sorted so repeated runs visit files in the same order.
///
/// Symlinked directories are not followed.
fn walk_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        entries.push((entry.path(), entry.file_type()?));
    }
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut files = Vec::new();
    for (path, file_type) in entries {
        if file_type.is_dir() {
            files.extend(walk_files(&path)?);
        } else if file_type.is_symlink() && path.is_dir() {
            debug!(path = %path.display(), "not following symlinked directory");
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::registry::MockRegistry;
    use crate::resolver::TagPicker;

    const FOO: &str = "image: registry.example.com/a/foo:v20230101-111111\n";
    const BAR: &str = "containers:\n  - image: registry.example.com/a/bar:v20230101-111111 # keep comment\n";

    fn prefixes() -> Vec<Prefix> {
        vec![Prefix {
            name: "A".to_string(),
            prefix: "registry.example.com/a".to_string(),
            consistent_images: true,
            ..Prefix::default()
        }]
    }

    fn pinned(tag: &str) -> TagResolver<MockRegistry> {
        TagResolver::new(TagPicker::Pinned(tag.to_string()), MockRegistry::default())
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn filter_is_anchored_and_escaped() {
        let filter = prefix_filter(&prefixes()).unwrap();
        assert!(filter.is_match("registry.example.com/a/foo"));
        assert!(!filter.is_match("mirror.io/registry.example.com/a/foo"));
        assert!(!filter.is_match("registryXexample.com/a/foo"));
    }

    #[tokio::test]
    async fn rewrites_matching_images_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let foo = write(dir.path(), "jobs/foo.yaml", FOO);
        let bar = write(dir.path(), "jobs/nested/bar.yml", BAR);
        let other = write(
            dir.path(),
            "jobs/other.yaml",
            "image: quay.io/other/tool:v20230101-111111\n",
        );

        let targets = ScanTargets {
            included: vec![dir.path().join("jobs")],
            ..ScanTargets::default()
        };
        let mut resolver = pinned("v20230601-222222");
        let outcome = scan(&targets, &prefix_filter(&prefixes()).unwrap(), &mut resolver)
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(&foo).unwrap(),
            "image: registry.example.com/a/foo:v20230601-222222\n"
        );
        assert_eq!(
            fs::read_to_string(&bar).unwrap(),
            "containers:\n  - image: registry.example.com/a/bar:v20230601-222222 # keep comment\n"
        );
        assert_eq!(
            fs::read_to_string(&other).unwrap(),
            "image: quay.io/other/tool:v20230101-111111\n"
        );

        assert_eq!(outcome.replacements.len(), 2);
        assert_eq!(
            outcome.replacements["registry.example.com/a/foo:v20230101-111111"],
            "v20230601-222222"
        );
        assert_eq!(
            outcome.replacements["registry.example.com/a/bar:v20230101-111111"],
            "v20230601-222222"
        );
        assert_eq!(outcome.touched_files, vec![foo, bar]);
    }

    #[tokio::test]
    async fn excluded_paths_win_and_extra_files_are_always_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let excluded = write(dir.path(), "jobs/legacy/foo.yaml", FOO);
        let not_yaml = write(dir.path(), "jobs/foo.txt", FOO);
        let extra = write(dir.path(), "templates/foo.tmpl", FOO);
        let extra_unmatched = write(dir.path(), "templates/none.tmpl", "nothing to see\n");

        let targets = ScanTargets {
            included: vec![dir.path().join("jobs"), excluded.clone()],
            excluded: vec![dir.path().join("jobs/legacy")],
            extra: vec![extra.clone(), extra_unmatched.clone()],
        };
        let mut resolver = pinned("v20230601-222222");
        let outcome = scan(&targets, &prefix_filter(&prefixes()).unwrap(), &mut resolver)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&excluded).unwrap(), FOO);
        assert_eq!(fs::read_to_string(&not_yaml).unwrap(), FOO);
        assert_eq!(
            fs::read_to_string(&extra).unwrap(),
            "image: registry.example.com/a/foo:v20230601-222222\n"
        );
        assert_eq!(fs::read_to_string(&extra_unmatched).unwrap(), "nothing to see\n");
        assert_eq!(outcome.touched_files, vec![extra]);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "foo.yaml", FOO);
        let targets = ScanTargets {
            included: vec![dir.path().to_path_buf()],
            ..ScanTargets::default()
        };
        let filter = prefix_filter(&prefixes()).unwrap();

        let first = scan(&targets, &filter, &mut pinned("v20230601-222222")).await.unwrap();
        assert_eq!(first.replacements.len(), 1);
        let second = scan(&targets, &filter, &mut pinned("v20230601-222222")).await.unwrap();
        assert!(second.replacements.is_empty());
        assert!(second.touched_files.is_empty());
    }

    #[tokio::test]
    async fn resolver_errors_skip_only_that_image() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "both.yaml", &format!("{FOO}{BAR}"));
        let registry = MockRegistry::with_latest(&[("registry.example.com/a/bar:v20230101-111111", "v20230701-333333")]);
        let mut resolver = TagResolver::new(TagPicker::Latest, registry);
        let targets = ScanTargets {
            included: vec![file.clone()],
            ..ScanTargets::default()
        };

        let outcome = scan(&targets, &prefix_filter(&prefixes()).unwrap(), &mut resolver)
            .await
            .unwrap();
        assert_eq!(outcome.replacements.len(), 1);
        let content = fs::read_to_string(&file).unwrap();
        assert!(content.contains("registry.example.com/a/foo:v20230101-111111"));
        assert!(content.contains("registry.example.com/a/bar:v20230701-333333"));
    }

    #[tokio::test]
    async fn missing_upstream_tags_keep_the_other_bumps() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "both.yaml", &format!("{FOO}{BAR}"));
        let registry = MockRegistry::with_tags(&[
            ("registry.example.com/a/foo", &["v20230101-111111", "v20230601-222222"]),
            ("registry.example.com/a/bar", &["v20230101-111111"]),
        ]);
        let picker = TagPicker::Upstream(vec![("registry.example.com/a".to_string(), "v20230601-222222".to_string())]);
        let mut resolver = TagResolver::new(picker, registry);
        let targets = ScanTargets {
            included: vec![file.clone()],
            ..ScanTargets::default()
        };

        let outcome = scan(&targets, &prefix_filter(&prefixes()).unwrap(), &mut resolver)
            .await
            .unwrap();
        assert_eq!(
            outcome.replacements,
            ReplacementMap::from([(
                "registry.example.com/a/foo:v20230101-111111".to_string(),
                "v20230601-222222".to_string()
            )])
        );
        assert_eq!(outcome.touched_files, vec![file.clone()]);
        assert_eq!(outcome.unresolved.len(), 1);
        let err = outcome.unresolved_error().unwrap();
        assert!(err.to_string().contains("image tag v20230601-222222 does not exist for a/bar"), "{err}");

        let content = fs::read_to_string(&file).unwrap();
        assert!(content.contains("registry.example.com/a/foo:v20230601-222222"));
        assert!(content.contains("registry.example.com/a/bar:v20230101-111111"));
    }

    #[tokio::test]
    async fn non_utf8_files_are_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("latin1.tmpl");
        let mut content = b"# caf\xe9\n".to_vec();
        content.extend_from_slice(FOO.as_bytes());
        fs::write(&extra, &content).unwrap();

        let targets = ScanTargets {
            extra: vec![extra.clone()],
            ..ScanTargets::default()
        };
        let outcome = scan(&targets, &prefix_filter(&prefixes()).unwrap(), &mut pinned("v20230601-222222"))
            .await
            .unwrap();

        assert_eq!(outcome.replacements.len(), 1);
        let mut expected = b"# caf\xe9\n".to_vec();
        expected.extend_from_slice(b"image: registry.example.com/a/foo:v20230601-222222\n");
        assert_eq!(fs::read(&extra).unwrap(), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_directories_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let foo = write(dir.path(), "jobs/foo.yaml", FOO);
        let outside = tempfile::tempdir().unwrap();
        let outside_file = write(outside.path(), "bar.yaml", BAR);
        std::os::unix::fs::symlink(dir.path().join("jobs"), dir.path().join("jobs/loop")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("jobs/outside")).unwrap();

        let targets = ScanTargets {
            included: vec![dir.path().join("jobs")],
            ..ScanTargets::default()
        };
        let outcome = scan(&targets, &prefix_filter(&prefixes()).unwrap(), &mut pinned("v20230601-222222"))
            .await
            .unwrap();

        assert_eq!(outcome.touched_files, vec![foo]);
        assert_eq!(fs::read_to_string(&outside_file).unwrap(), BAR);
    }

    #[tokio::test]
    async fn missing_included_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let targets = ScanTargets {
            included: vec![dir.path().join("missing")],
            ..ScanTargets::default()
        };
        let mut resolver = pinned("v20230601-222222");
        assert!(scan(&targets, &prefix_filter(&prefixes()).unwrap(), &mut resolver)
            .await
            .is_err());
    }
}
