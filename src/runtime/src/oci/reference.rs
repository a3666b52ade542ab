//! Registry image reference parsing.
//!
//! `nginx`, `nginx:1.25`, `ghcr.io/org/app:v1`, `host:5000/app@sha256:…`.

use squash_core::error::{Result, SquashError};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_NAMESPACE: &str = "library";
const DEFAULT_TAG: &str = "latest";

/// A parsed `registry/repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference, filling in Docker Hub defaults.
    ///
    /// A reference without tag or digest gets `latest`.
    pub fn parse(reference: &str) -> Result<Self> {
        let input = reference.trim();
        let invalid = |message: &str| SquashError::InvalidReference {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (remainder, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                let valid = digest
                    .split_once(':')
                    .map_or(false, |(algo, hex)| !algo.is_empty() && !hex.is_empty());
                if !valid {
                    return Err(invalid("digest must look like algorithm:hex"));
                }
                (name, Some(digest.to_string()))
            }
            None => (input, None),
        };

        let (name, tag) = split_tag(remainder);
        if tag.map_or(false, str::is_empty) {
            return Err(invalid("tag is empty"));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest)) if looks_like_host(host) => (host.to_string(), rest.to_string()),
            _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            _ => (
                DEFAULT_REGISTRY.to_string(),
                format!("{}/{}", DEFAULT_NAMESPACE, name),
            ),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("repository is empty"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical `registry/repository[:tag][@digest]` form.
    pub fn full_reference(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_reference())
    }
}

/// Split `name:tag`. Only a colon after the last `/` starts a tag, so a
/// registry port is never mistaken for one.
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let last_segment = name.rfind('/').map_or(0, |i| i + 1);
    match name[last_segment..].rfind(':') {
        Some(i) => {
            let at = last_segment + i;
            (&name[..at], Some(&name[at + 1..]))
        }
        None => (name, None),
    }
}

fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}
