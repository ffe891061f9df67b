//! Image reference helpers.

use stagehand_core::DockerConfig;

use crate::engine::RegistryAuth;

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// Split `repo[:tag]` into repository and tag.
///
/// A colon inside the registry host (`host:5000/repo`) is not a tag separator.
/// Digest references (`repo@sha256:...`) are returned whole with no tag.
pub fn split(reference: &str) -> (&str, Option<&str>) {
    if reference.contains('@') {
        return (reference, None);
    }
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let at = name_start + i;
            (&reference[..at], Some(&reference[at + 1..]))
        }
        None => (reference, None),
    }
}

/// Registry host an image reference resolves to.
pub fn registry_host(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            canonical_host(first)
        }
        _ => DEFAULT_REGISTRY,
    }
}

/// Host part of a configured registry, which may carry a scheme or path.
pub fn configured_host(registry: &str) -> &str {
    let without_scheme = registry
        .split_once("://")
        .map_or(registry, |(_, rest)| rest);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    canonical_host(host)
}

fn canonical_host(host: &str) -> &str {
    match host {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => DEFAULT_REGISTRY,
        other => other,
    }
}

/// Credentials for `image`, only when its registry is the configured one.
pub fn credentials_for(image: &str, docker: &DockerConfig) -> Option<RegistryAuth> {
    let registry = docker.registry.as_deref().filter(|r| !r.is_empty())?;
    if configured_host(registry) != registry_host(image) {
        return None;
    }
    Some(RegistryAuth {
        username: docker.username.clone().unwrap_or_default(),
        password: docker.password.clone().unwrap_or_default(),
        server_address: registry.to_owned(),
    })
}
