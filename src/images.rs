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
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Matches `host/name:tag` image references inside arbitrary file content.
///
/// The host needs at least one dot so that plain `key: value` pairs are not mistaken for images.
/// Works on bytes so files that are not valid UTF-8 can still be rewritten.
pub static IMAGE_REGEX: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
    regex::bytes::Regex::new(r"\b((?:[a-z0-9-]+\.)+[a-z0-9-]+(?::[0-9]+)?)/([a-z0-9][a-zA-Z0-9_./-]*):([a-zA-Z0-9_][a-zA-Z0-9_.-]*)\b")
        .expect("image regex must compile")
});

// vYYYYMMDD-COMMIT, vYYYYMMDD-vX.Y.Z-gCOMMIT or latest, followed by an optional -variant
static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(v?\d{8}-(?:v\d(?:[.-]\d+)*-g)?[0-9a-f]{6,10}|latest)(-.+)?").expect("tag regex must compile")
});

#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageRef {
    pub host: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(host: &str, name: &str, tag: &str) -> Self {
        Self {
            host: host.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Splits a full `host/name:tag` string. Returns `None` when there is no tag.
    pub fn parse(full: &str) -> Option<Self> {
        let (path, tag) = full.rsplit_once(':')?;
        // a colon followed by a slash belongs to a registry port, not to a tag
        if tag.contains('/') || tag.is_empty() {
            return None;
        }
        let (host, name) = path.split_once('/')?;
        Some(Self::new(host, name, tag))
    }

    /// `host/name` without the tag.
    pub fn path(&self) -> String {
        format!("{}/{}", self.host, self.name)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.name, self.tag)
    }
}

/// Deduplicates and sorts image strings.
pub fn unique_images(images: impl IntoIterator<Item = String>) -> Vec<String> {
    images.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagParts {
    pub date: String,
    pub commit: String,
    pub variant: String,
}

/// Separates a tag into its `vDATE-COMMIT-VARIANT` components.
///
/// COMMIT may still be in the `vX.Y.Z-N-gCOMMIT` describe form, see [`commit_to_ref`].
pub fn deconstruct_tag(tag: &str) -> Option<TagParts> {
    let captures = TAG_REGEX.captures(tag)?;
    let version = captures.get(1)?.as_str();
    let variant = captures.get(2).map_or("", |m| m.as_str()).to_string();
    if version == "latest" {
        return Some(TagParts {
            date: String::new(),
            commit: version.to_string(),
            variant,
        });
    }

    let parts: Vec<&str> = version.split('-').collect();
    Some(TagParts {
        date: parts[0].trim_start_matches('v').to_string(),
        commit: parts[parts.len() - 1].to_string(),
        variant,
    })
}

/// Returns the version part of a tag (`latest` or `vDATE-COMMIT`) together with the variant suffix.
pub fn tag_version_and_variant(tag: &str) -> Option<(&str, &str)> {
    let captures = TAG_REGEX.captures(tag)?;
    Some((captures.get(1)?.as_str(), captures.get(2).map_or("", |m| m.as_str())))
}

/// Strips the `g` git describe puts in front of abbreviated hashes.
pub fn commit_to_ref(commit: &str) -> &str {
    match commit.strip_prefix('g') {
        Some(hash) if !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit()) => hash,
        _ => commit,
    }
}

pub fn format_tag_date(date: &str) -> String {
    if date.len() != 8 || !date.is_ascii() {
        return date.to_string();
    }
    // &#x2011; is a non-breaking hyphen so the markdown table does not wrap dates
    format!("{}&#x2011;{}&#x2011;{}", &date[0..4], &date[4..6], &date[6..8])
}

pub fn format_variant(variant: &str) -> String {
    if variant.is_empty() {
        return String::new();
    }
    format!("({})", variant.trim_start_matches('-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_images_in_yaml() {
        let content = "spec:\n  image: registry.example.com/a/foo:v20230101-111111\n  other: not/an:image\n";
        let captures: Vec<_> = IMAGE_REGEX.captures_iter(content.as_bytes()).collect();
        assert_eq!(captures.len(), 1);
        assert_eq!(&captures[0][1], b"registry.example.com");
        assert_eq!(&captures[0][2], b"a/foo");
        assert_eq!(&captures[0][3], b"v20230101-111111");
    }

    #[test]
    fn finds_images_with_registry_port() {
        let captures: Vec<_> = IMAGE_REGEX
            .captures_iter(b"image: localhost.localdomain:5000/team/tool:v1.2.3")
            .collect();
        assert_eq!(&captures[0][1], b"localhost.localdomain:5000");
        assert_eq!(&captures[0][2], b"team/tool");
        assert_eq!(&captures[0][3], b"v1.2.3");
    }

    #[test]
    fn parse_image_ref() {
        let image = ImageRef::parse("europe-docker.pkg.dev/kyma-project/prod/buildpack-go:v20230601-222222").unwrap();
        assert_eq!(image.host, "europe-docker.pkg.dev");
        assert_eq!(image.name, "kyma-project/prod/buildpack-go");
        assert_eq!(image.tag, "v20230601-222222");
        assert_eq!(image.path(), "europe-docker.pkg.dev/kyma-project/prod/buildpack-go");
        assert_eq!(
            image.to_string(),
            "europe-docker.pkg.dev/kyma-project/prod/buildpack-go:v20230601-222222"
        );

        assert_eq!(ImageRef::parse("registry.example.com:5000/foo"), None);
        assert_eq!(
            ImageRef::parse("registry.example.com:5000/foo:v1").map(|i| i.host),
            Some("registry.example.com:5000".to_string())
        );
    }

    #[test]
    fn unique_images_sorts_and_dedups() {
        let images = unique_images(vec!["b".to_string(), "a".to_string(), "b".to_string()]);
        assert_eq!(images, vec!["a", "b"]);
    }

    #[test]
    fn deconstruct_tags() {
        assert_eq!(
            deconstruct_tag("v20230101-abcdef"),
            Some(TagParts {
                date: "20230101".to_string(),
                commit: "abcdef".to_string(),
                variant: String::new(),
            })
        );
        assert_eq!(
            deconstruct_tag("v20230101-v0.0.30-14-gdeadbeef-alpine"),
            Some(TagParts {
                date: "20230101".to_string(),
                commit: "gdeadbeef".to_string(),
                variant: "-alpine".to_string(),
            })
        );
        assert_eq!(deconstruct_tag("latest-experimental").unwrap().variant, "-experimental");
        assert_eq!(deconstruct_tag("1.2.3"), None);
    }

    #[test]
    fn tag_formatting() {
        assert_eq!(commit_to_ref("gdeadbeef"), "deadbeef");
        assert_eq!(commit_to_ref("abcdef"), "abcdef");
        assert_eq!(commit_to_ref("go"), "go");
        assert_eq!(format_tag_date("20230601"), "2023&#x2011;06&#x2011;01");
        assert_eq!(format_tag_date("2023"), "2023");
        assert_eq!(format_variant("-alpine"), "(alpine)");
        assert_eq!(format_variant(""), "");
    }
}
