//! Image reference helpers.

/// Splits `registry/repo:tag@digest` into `(repository, tag)`, dropping any digest.
#[must_use]
pub fn split_reference(image: &str) -> (&str, Option<&str>) {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_slash = without_digest.rfind('/').map_or(0, |i| i + 1);
    match without_digest[last_slash..].rfind(':') {
        Some(i) => {
            let colon = last_slash + i;
            (&without_digest[..colon], Some(&without_digest[colon + 1..]))
        }
        None => (without_digest, None),
    }
}

/// Keeps the repository and swaps the tag.
#[must_use]
pub fn with_tag(image: &str, tag: &str) -> String {
    let (repository, _) = split_reference(image);
    format!("{repository}:{tag}")
}

/// Registry host of an image reference, `docker.io` when none is named.
#[must_use]
pub fn registry_host(image: &str) -> String {
    let (repository, _) = split_reference(image);
    match repository.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first.to_ascii_lowercase()
        }
        _ => "docker.io".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("nginx:1.25"), ("nginx", Some("1.25")));
        assert_eq!(split_reference("nginx"), ("nginx", None));
        assert_eq!(
            split_reference("registry.local:5000/team/app:v2"),
            ("registry.local:5000/team/app", Some("v2"))
        );
        assert_eq!(
            split_reference("registry.local:5000/team/app"),
            ("registry.local:5000/team/app", None)
        );
        assert_eq!(split_reference("nginx:1.25@sha256:abc"), ("nginx", Some("1.25")));
    }

    #[test]
    fn test_with_tag() {
        assert_eq!(with_tag("nginx:1.25", "1.27"), "nginx:1.27");
        assert_eq!(with_tag("ghcr.io/acme/api", "v3"), "ghcr.io/acme/api:v3");
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("nginx:1.25"), "docker.io");
        assert_eq!(registry_host("library/nginx"), "docker.io");
        assert_eq!(registry_host("ghcr.io/acme/api:v1"), "ghcr.io");
        assert_eq!(registry_host("localhost:5000/app"), "localhost:5000");
        assert_eq!(registry_host("localhost/app"), "localhost");
    }
}
