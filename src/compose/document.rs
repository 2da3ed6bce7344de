use std::collections::BTreeSet;

use serde_yaml::{Mapping, Value};

use super::volumes::named_volume;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Networks,
    Volumes,
    Secrets,
    Configs,
}

impl ResourceKind {
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            ResourceKind::Networks => "networks",
            ResourceKind::Volumes => "volumes",
            ResourceKind::Secrets => "secrets",
            ResourceKind::Configs => "configs",
        }
    }

    #[must_use]
    pub fn singular(self) -> &'static str {
        match self {
            ResourceKind::Networks => "network",
            ResourceKind::Volumes => "volume",
            ResourceKind::Secrets => "secret",
            ResourceKind::Configs => "config",
        }
    }
}

/// A compose file as an ordered YAML tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeDocument {
    root: Mapping,
}

fn key_name(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Names listed either as a sequence of strings (or `{source}` objects) or as map keys.
fn referenced_names(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Mapping(m) => m.get("source").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        Some(Value::Mapping(map)) => map.keys().filter_map(key_name).collect(),
        _ => Vec::new(),
    }
}

/// Removes a key without disturbing the order of the others.
fn remove_key(map: &mut Mapping, name: &str) {
    *map = std::mem::take(map)
        .into_iter()
        .filter(|(k, _)| k.as_str() != Some(name))
        .collect();
}

fn rename_key(map: &mut Mapping, old: &str, new: &str) {
    *map = std::mem::take(map)
        .into_iter()
        .map(|(k, v)| {
            if k.as_str() == Some(old) {
                (Value::String(new.to_string()), v)
            } else {
                (k, v)
            }
        })
        .collect();
}

impl ComposeDocument {
    pub fn parse(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Compose(format!("invalid compose YAML: {e}")))?;
        match value {
            Value::Mapping(root) => Ok(Self { root }),
            Value::Null => Ok(Self {
                root: Mapping::new(),
            }),
            _ => Err(Error::Compose("compose file must be a mapping".into())),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.root)
            .map_err(|e| Error::Compose(format!("failed to serialize compose file: {e}")))
    }

    fn section(&self, key: &str) -> Option<&Mapping> {
        self.root.get(key).and_then(Value::as_mapping)
    }

    /// Runs `f` on the named top-level section, creating it (or replacing a null) first.
    fn with_section<R>(&mut self, key: &str, f: impl FnOnce(&mut Mapping) -> R) -> R {
        if let Some(slot) = self.root.get_mut(key) {
            if !slot.is_mapping() {
                *slot = Value::Mapping(Mapping::new());
            }
            if let Value::Mapping(map) = slot {
                return f(map);
            }
        }

        let mut map = Mapping::new();
        let out = f(&mut map);
        self.root.insert(key.into(), Value::Mapping(map));
        out
    }

    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.section("services")
            .map(|s| s.keys().filter_map(key_name).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn service(&self, name: &str) -> Option<&Mapping> {
        self.section("services")?.get(name)?.as_mapping()
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Mapping> {
        self.root
            .get_mut("services")?
            .as_mapping_mut()?
            .get_mut(name)?
            .as_mapping_mut()
    }

    pub fn insert_service(&mut self, name: &str, definition: Value) {
        self.with_section("services", |services| {
            services.insert(Value::String(name.to_string()), definition);
        });
    }

    pub fn remove_service(&mut self, name: &str) -> bool {
        if self.service(name).is_none() {
            return false;
        }
        self.with_section("services", |services| remove_key(services, name));
        true
    }

    /// Renames a service in place, keeping its position and fixing `depends_on`.
    pub fn rename_service(&mut self, old: &str, new: &str) {
        self.with_section("services", |services| {
            rename_key(services, old, new);

            for (_, service) in services.iter_mut() {
                let Some(depends_on) = service
                    .as_mapping_mut()
                    .and_then(|s| s.get_mut("depends_on"))
                else {
                    continue;
                };
                match depends_on {
                    Value::Sequence(items) => {
                        for item in items.iter_mut() {
                            if item.as_str() == Some(old) {
                                *item = Value::String(new.to_string());
                            }
                        }
                    }
                    Value::Mapping(map) => rename_key(map, old, new),
                    _ => {}
                }
            }
        });
    }

    #[must_use]
    pub fn has_resource(&self, kind: ResourceKind, name: &str) -> bool {
        self.section(kind.key())
            .is_some_and(|s| s.contains_key(name))
    }

    pub fn set_resource(&mut self, kind: ResourceKind, name: &str, definition: Value) {
        self.with_section(kind.key(), |section| {
            section.insert(Value::String(name.to_string()), definition);
        });
    }

    pub fn remove_resource(&mut self, kind: ResourceKind, name: &str) -> bool {
        if !self.has_resource(kind, name) {
            return false;
        }
        let now_empty = self.with_section(kind.key(), |section| {
            remove_key(section, name);
            section.is_empty()
        });
        if now_empty {
            remove_key(&mut self.root, kind.key());
        }
        true
    }

    fn service_references(service: &Mapping, kind: ResourceKind) -> Vec<String> {
        match kind {
            ResourceKind::Volumes => match service.get("volumes") {
                Some(Value::Sequence(items)) => items.iter().filter_map(named_volume).collect(),
                _ => Vec::new(),
            },
            _ => referenced_names(service.get(kind.key())),
        }
    }

    /// The first service referencing the resource, if any.
    #[must_use]
    pub fn first_user_of(&self, kind: ResourceKind, name: &str) -> Option<String> {
        let services = self.section("services")?;
        services.iter().find_map(|(service_name, service)| {
            let service = service.as_mapping()?;
            Self::service_references(service, kind)
                .iter()
                .any(|r| r == name)
                .then(|| key_name(service_name))
                .flatten()
        })
    }

    /// Structural checks run before any write.
    pub fn validate(&self) -> Result<()> {
        let services = self
            .section("services")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Compose("compose file has no services".into()))?;
        let names: BTreeSet<String> = services.keys().filter_map(key_name).collect();

        for (name, service) in services {
            let name = key_name(name).unwrap_or_default();
            let service = service
                .as_mapping()
                .ok_or_else(|| Error::Compose(format!("service '{name}' must be an object")))?;

            // `extends` inherits image or build from the base service.
            if !["image", "build", "extends"]
                .iter()
                .any(|key| service.contains_key(*key))
            {
                return Err(Error::Compose(format!(
                    "service '{name}' needs an image, a build section or extends"
                )));
            }

            for kind in [
                ResourceKind::Networks,
                ResourceKind::Volumes,
                ResourceKind::Secrets,
                ResourceKind::Configs,
            ] {
                for reference in Self::service_references(service, kind) {
                    let implicit = kind == ResourceKind::Networks && reference == "default";
                    if !implicit && !self.has_resource(kind, &reference) {
                        return Err(Error::Compose(format!(
                            "service '{name}' uses undefined {} '{reference}'",
                            kind.singular()
                        )));
                    }
                }
            }

            for dependency in referenced_names(service.get("depends_on")) {
                if !names.contains(&dependency) {
                    return Err(Error::Compose(format!(
                        "service '{name}' depends on unknown service '{dependency}'"
                    )));
                }
            }
        }
        Ok(())
    }
}
