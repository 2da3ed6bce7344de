//! Registry credential selection.

use std::collections::BTreeMap;

use crate::agent::types::RegistryAuth;
use crate::compose::image::{registry_host, split_reference};
use crate::crypto::Crypto;
use crate::error::Result;
use crate::rbac::{Specificity, matches_pattern, pattern_specificity};
use crate::types::RegistryCredential;

/// Reduces a registry URL to a bare lowercase host, folding Docker Hub aliases.
#[must_use]
pub fn normalize_registry_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_ascii_lowercase();

    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            "docker.io".to_string()
        }
        _ => host,
    }
}

fn image_matches(credential: &RegistryCredential, image: &str) -> bool {
    match credential.image_pattern.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(pattern) => {
            let (repository, _) = split_reference(image);
            matches_pattern(repository, pattern) || matches_pattern(image, pattern)
        }
    }
}

fn rank(credential: &RegistryCredential) -> (Specificity, bool, usize) {
    let has_image_pattern = credential
        .image_pattern
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    (
        pattern_specificity(&credential.stack_pattern),
        has_image_pattern,
        credential.stack_pattern.len(),
    )
}

/// Picks the credential for pulling `image` into `stack`, most specific stack pattern first.
#[must_use]
pub fn select_credential<'a>(
    credentials: &'a [RegistryCredential],
    stack: &str,
    image: &str,
) -> Option<&'a RegistryCredential> {
    let host = registry_host(image);
    credentials
        .iter()
        .filter(|c| matches_pattern(stack, &c.stack_pattern))
        .filter(|c| normalize_registry_url(&c.registry_url) == host)
        .filter(|c| image_matches(c, image))
        .max_by_key(|c| rank(c))
}

/// One credential per registry host for everything `stack` may pull.
#[must_use]
pub fn credentials_for_stack<'a>(
    credentials: &'a [RegistryCredential],
    stack: &str,
) -> Vec<&'a RegistryCredential> {
    let mut best: BTreeMap<String, &RegistryCredential> = BTreeMap::new();
    for credential in credentials
        .iter()
        .filter(|c| matches_pattern(stack, &c.stack_pattern))
    {
        let host = normalize_registry_url(&credential.registry_url);
        match best.get(&host) {
            Some(current) if rank(current) >= rank(credential) => {}
            _ => {
                best.insert(host, credential);
            }
        }
    }
    best.into_values().collect()
}

/// Decrypts credentials into the shape agents accept.
pub fn to_registry_auth<'a>(
    crypto: &Crypto,
    credentials: impl IntoIterator<Item = &'a RegistryCredential>,
) -> Result<Vec<RegistryAuth>> {
    let mut auths: Vec<RegistryAuth> = Vec::new();
    for credential in credentials {
        let auth = RegistryAuth {
            registry_url: normalize_registry_url(&credential.registry_url),
            username: credential.username.clone(),
            password: crypto.decrypt(&credential.encrypted_password)?,
        };
        if !auths.contains(&auth) {
            auths.push(auth);
        }
    }
    Ok(auths)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn credential(id: i64, stack_pattern: &str, registry_url: &str) -> RegistryCredential {
        RegistryCredential {
            id,
            server_id: 1,
            stack_pattern: stack_pattern.into(),
            registry_url: registry_url.into(),
            image_pattern: None,
            username: format!("user{id}"),
            encrypted_password: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_registry_url() {
        assert_eq!(normalize_registry_url("https://GHCR.io/"), "ghcr.io");
        assert_eq!(normalize_registry_url("registry.local:5000/v2/"), "registry.local:5000");
        assert_eq!(normalize_registry_url("https://index.docker.io/v1/"), "docker.io");
    }

    #[test]
    fn test_prefers_specific_stack_pattern() {
        let creds = vec![
            credential(1, "*", "ghcr.io"),
            credential(2, "web-*", "https://ghcr.io"),
            credential(3, "web-api", "ghcr.io"),
            credential(4, "web-api", "docker.io"),
        ];

        let picked = select_credential(&creds, "web-api", "ghcr.io/acme/api:1").unwrap();
        assert_eq!(picked.id, 3);

        let picked = select_credential(&creds, "web-ui", "ghcr.io/acme/ui:1").unwrap();
        assert_eq!(picked.id, 2);

        let picked = select_credential(&creds, "db", "ghcr.io/acme/db:1").unwrap();
        assert_eq!(picked.id, 1);

        let picked = select_credential(&creds, "web-api", "nginx:1.25").unwrap();
        assert_eq!(picked.id, 4);

        assert!(select_credential(&creds, "db", "quay.io/x/y").is_none());
    }

    #[test]
    fn test_image_pattern_narrows() {
        let mut scoped = credential(2, "*", "ghcr.io");
        scoped.image_pattern = Some("ghcr.io/acme/*".into());
        let creds = vec![credential(1, "*", "ghcr.io"), scoped];

        assert_eq!(select_credential(&creds, "s", "ghcr.io/acme/app").unwrap().id, 2);
        assert_eq!(select_credential(&creds, "s", "ghcr.io/other/app").unwrap().id, 1);
    }

    #[test]
    fn test_one_credential_per_host() {
        let creds = vec![
            credential(1, "*", "ghcr.io"),
            credential(2, "web-*", "ghcr.io"),
            credential(3, "*", "docker.io"),
            credential(4, "db", "quay.io"),
        ];
        let mut ids: Vec<i64> = credentials_for_stack(&creds, "web-api")
            .iter()
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_decrypts_into_agent_format() {
        let crypto = Crypto::new("0123456789abcdef-test");
        let mut cred = credential(1, "*", "https://ghcr.io/");
        cred.encrypted_password = crypto.encrypt("s3cret").unwrap();

        let auths = to_registry_auth(&crypto, [&cred, &cred]).unwrap();
        assert_eq!(
            auths,
            vec![RegistryAuth {
                registry_url: "ghcr.io".into(),
                username: "user1".into(),
                password: "s3cret".into(),
            }]
        );
    }
}
