use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use super::document::{ComposeDocument, ResourceKind};
use super::image::with_tag;
use super::ports::{PortInput, normalize_ports};
use super::volumes::{VolumeInput, normalize_volumes};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RestartPolicy {
    #[serde(rename = "no")]
    No,
    #[serde(rename = "always")]
    Always,
    #[serde(rename = "on-failure")]
    OnFailure,
    #[serde(rename = "unless-stopped")]
    UnlessStopped,
}

impl RestartPolicy {
    fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandPatch {
    pub values: Vec<String>,
}

/// A map value where `null` means "remove this key".
pub type KeyChanges = BTreeMap<String, Option<serde_json::Value>>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicePatch {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub restart: Option<RestartPolicy>,
    #[serde(default)]
    pub environment: Option<KeyChanges>,
    #[serde(default)]
    pub labels: Option<KeyChanges>,
    #[serde(default)]
    pub ports: Option<Vec<PortInput>>,
    #[serde(default)]
    pub volumes: Option<Vec<VolumeInput>>,
    #[serde(default)]
    pub networks: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub command: Option<CommandPatch>,
    #[serde(default)]
    pub entrypoint: Option<CommandPatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComposeChanges {
    #[serde(default)]
    pub service_changes: BTreeMap<String, ServicePatch>,
    #[serde(default)]
    pub add_services: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub delete_services: Vec<String>,
    #[serde(default)]
    pub rename_services: BTreeMap<String, String>,
    #[serde(default)]
    pub network_changes: BTreeMap<String, Option<serde_json::Value>>,
    #[serde(default)]
    pub volume_changes: BTreeMap<String, Option<serde_json::Value>>,
    #[serde(default)]
    pub secret_changes: BTreeMap<String, Option<serde_json::Value>>,
    #[serde(default)]
    pub config_changes: BTreeMap<String, Option<serde_json::Value>>,
}

impl ComposeChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.service_changes.is_empty()
            && self.add_services.is_empty()
            && self.delete_services.is_empty()
            && self.rename_services.is_empty()
            && self.network_changes.is_empty()
            && self.volume_changes.is_empty()
            && self.secret_changes.is_empty()
            && self.config_changes.is_empty()
    }
}

/// Legacy image bump: either a full reference or a new tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceImageUpdate {
    pub service_name: String,
    #[serde(default)]
    pub new_image: Option<String>,
    #[serde(default)]
    pub new_tag: Option<String>,
}

fn to_yaml(value: serde_json::Value) -> Result<Value> {
    serde_yaml::to_value(value).map_err(|e| Error::Compose(format!("invalid value: {e}")))
}

fn scalar_string(key: &str, value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(Error::Compose(format!("value for '{key}' must be a scalar"))),
    }
}

pub fn validate_service_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Compose(format!("invalid service name '{name}'")))
    }
}

/// Applies `changes` to a copy of `doc`. The input is never modified.
pub fn apply(doc: &ComposeDocument, changes: &ComposeChanges) -> Result<ComposeDocument> {
    let mut next = doc.clone();

    for (old, new) in &changes.rename_services {
        rename_service(&mut next, old, new)?;
    }

    for name in &changes.delete_services {
        if !next.remove_service(name) {
            return Err(Error::Compose(format!("service '{name}' not found")));
        }
    }
    if !changes.delete_services.is_empty() && next.service_names().is_empty() {
        return Err(Error::Compose("cannot delete every service".into()));
    }

    for (name, definition) in &changes.add_services {
        validate_service_name(name)?;
        if next.service(name).is_some() {
            return Err(Error::Compose(format!("service '{name}' already exists")));
        }
        let definition = to_yaml(definition.clone())?;
        if !definition.is_mapping() {
            return Err(Error::Compose(format!("service '{name}' must be an object")));
        }
        next.insert_service(name, definition);
    }

    for (name, patch) in &changes.service_changes {
        let service = next
            .service_mut(name)
            .ok_or_else(|| Error::Compose(format!("service '{name}' not found")))?;
        patch_service(service, patch)?;
    }

    for (kind, resource_changes) in [
        (ResourceKind::Networks, &changes.network_changes),
        (ResourceKind::Volumes, &changes.volume_changes),
        (ResourceKind::Secrets, &changes.secret_changes),
        (ResourceKind::Configs, &changes.config_changes),
    ] {
        apply_resource_changes(&mut next, kind, resource_changes)?;
    }

    next.validate()?;
    Ok(next)
}

fn rename_service(doc: &mut ComposeDocument, old: &str, new: &str) -> Result<()> {
    validate_service_name(new)?;
    if doc.service(old).is_none() {
        return Err(Error::Compose(format!("service '{old}' not found")));
    }
    if doc.service(new).is_some() {
        return Err(Error::Compose(format!("service '{new}' already exists")));
    }
    doc.rename_service(old, new);
    Ok(())
}

fn patch_service(service: &mut Mapping, patch: &ServicePatch) -> Result<()> {
    if let Some(image) = &patch.image {
        if image.trim().is_empty() {
            return Err(Error::Compose("image cannot be empty".into()));
        }
        service.insert("image".into(), Value::String(image.clone()));
    }

    if let Some(restart) = patch.restart {
        service.insert("restart".into(), restart.as_str().into());
    }

    if let Some(changes) = &patch.environment {
        patch_key_values(service, "environment", changes)?;
    }
    if let Some(changes) = &patch.labels {
        patch_key_values(service, "labels", changes)?;
    }

    if let Some(ports) = &patch.ports {
        let ports = normalize_ports(ports.clone())?;
        set_or_remove(
            service,
            "ports",
            Value::Sequence(ports.iter().map(|p| p.to_yaml()).collect()),
        );
    }

    if let Some(volumes) = &patch.volumes {
        let mounts = normalize_volumes(volumes.clone())?;
        set_or_remove(
            service,
            "volumes",
            Value::Sequence(mounts.iter().map(|m| m.to_yaml()).collect()),
        );
    }

    if let Some(networks) = &patch.networks {
        let mut map = Mapping::new();
        for (name, attach) in networks {
            let attach = match attach {
                serde_json::Value::Null => Value::Mapping(Mapping::new()),
                other => to_yaml(other.clone())?,
            };
            if !attach.is_mapping() {
                return Err(Error::Compose(format!(
                    "network attachment '{name}' must be an object"
                )));
            }
            map.insert(Value::String(name.clone()), attach);
        }
        set_or_remove(service, "networks", Value::Mapping(map));
    }

    if let Some(command) = &patch.command {
        set_command(service, "command", command);
    }
    if let Some(entrypoint) = &patch.entrypoint {
        set_command(service, "entrypoint", entrypoint);
    }

    Ok(())
}

fn set_command(service: &mut Mapping, key: &str, patch: &CommandPatch) {
    let values = patch.values.iter().cloned().map(Value::String).collect();
    set_or_remove(service, key, Value::Sequence(values));
}

/// Writes `value`, or drops the key when it is an empty list or map.
fn set_or_remove(service: &mut Mapping, key: &str, value: Value) {
    let empty = match &value {
        Value::Sequence(s) => s.is_empty(),
        Value::Mapping(m) => m.is_empty(),
        _ => false,
    };
    if empty {
        service.shift_remove(key);
    } else {
        service.insert(key.into(), value);
    }
}

/// Reads `KEY=VALUE` lists or maps into an ordered map.
fn key_values(value: Option<&Value>) -> Vec<(String, Value)> {
    match value {
        Some(Value::Mapping(map)) => map
            .iter()
            .filter_map(|(k, v)| {
                let key = match k {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some((key, v.clone()))
            })
            .collect(),
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), Value::String(v.to_string())),
                None => (item.to_string(), Value::Null),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn patch_key_values(
    service: &mut Mapping,
    field: &str,
    changes: &KeyChanges,
) -> Result<()> {
    let mut entries = key_values(service.get(field));

    for (key, change) in changes {
        if key.is_empty() {
            return Err(Error::Compose(format!("{field} keys cannot be empty")));
        }
        match change {
            None | Some(serde_json::Value::Null) => entries.retain(|(k, _)| k != key),
            Some(value) => {
                let value = Value::String(scalar_string(key, value)?);
                match entries.iter_mut().find(|(k, _)| k == key) {
                    Some(entry) => entry.1 = value,
                    None => entries.push((key.clone(), value)),
                }
            }
        }
    }

    let map: Mapping = entries
        .into_iter()
        .map(|(k, v)| (Value::String(k), v))
        .collect();
    set_or_remove(service, field, Value::Mapping(map));
    Ok(())
}

fn apply_resource_changes(
    doc: &mut ComposeDocument,
    kind: ResourceKind,
    changes: &BTreeMap<String, Option<serde_json::Value>>,
) -> Result<()> {
    for (name, change) in changes {
        match change {
            Some(serde_json::Value::Null) | None => {
                if kind == ResourceKind::Networks && name == "default" {
                    return Err(Error::Compose("cannot delete default network".into()));
                }
                if let Some(user) = doc.first_user_of(kind, name) {
                    return Err(Error::Compose(format!(
                        "{} '{name}' is still used by service '{user}'",
                        kind.singular()
                    )));
                }
                if !doc.remove_resource(kind, name) {
                    return Err(Error::Compose(format!(
                        "{} '{name}' not found",
                        kind.singular()
                    )));
                }
            }
            Some(definition) => {
                let definition = to_yaml(definition.clone())?;
                if !definition.is_mapping() {
                    return Err(Error::Compose(format!(
                        "{} '{name}' must be an object",
                        kind.singular()
                    )));
                }
                doc.set_resource(kind, name, definition);
            }
        }
    }
    Ok(())
}

/// Applies legacy image updates to a copy of `doc`.
pub fn apply_image_updates(
    doc: &ComposeDocument,
    updates: &[ServiceImageUpdate],
) -> Result<ComposeDocument> {
    let mut next = doc.clone();
    for update in updates {
        let service = next
            .service_mut(&update.service_name)
            .ok_or_else(|| Error::Compose(format!("service '{}' not found", update.service_name)))?;

        let image = match (&update.new_image, &update.new_tag) {
            (Some(image), _) if !image.trim().is_empty() => image.clone(),
            (_, Some(tag)) if !tag.trim().is_empty() => {
                let current = service
                    .get("image")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::Compose(format!(
                            "service '{}' has no image to retag",
                            update.service_name
                        ))
                    })?;
                with_tag(current, tag)
            }
            _ => {
                return Err(Error::Compose(format!(
                    "update for '{}' needs new_image or new_tag",
                    update.service_name
                )));
            }
        };
        service.insert("image".into(), Value::String(image));
    }
    next.validate()?;
    Ok(next)
}
