//! Service volume mounts, normalized to the long object form.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountType {
    Bind,
    Volume,
}

impl MountType {
    fn as_str(self) -> &'static str {
        match self {
            MountType::Bind => "bind",
            MountType::Volume => "volume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    #[serde(rename = "type")]
    pub mount_type: MountType,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VolumeInput {
    Short(String),
    Long {
        #[serde(rename = "type")]
        mount_type: MountType,
        source: String,
        target: String,
        #[serde(default)]
        read_only: Option<bool>,
    },
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

/// Parses `source:target[:ro|rw]`.
pub fn parse_volume(spec: &str) -> Result<VolumeMount> {
    let parts: Vec<&str> = spec.trim().split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [source, target] => (*source, *target, None),
        [source, target, mode] => (*source, *target, Some(*mode)),
        _ => return Err(Error::Compose(format!("invalid volume '{spec}'"))),
    };

    let read_only = match mode {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => {
            return Err(Error::Compose(format!("unsupported volume mode '{other}'")));
        }
    };

    build(
        if is_host_path(source) {
            MountType::Bind
        } else {
            MountType::Volume
        },
        source,
        target,
        read_only,
    )
}

fn build(mount_type: MountType, source: &str, target: &str, read_only: bool) -> Result<VolumeMount> {
    if source.is_empty() {
        return Err(Error::Compose("volume source is required".into()));
    }
    if !target.starts_with('/') {
        return Err(Error::Compose(format!(
            "volume target '{target}' must be an absolute path"
        )));
    }
    if mount_type == MountType::Volume && is_host_path(source) {
        return Err(Error::Compose(format!(
            "named volume '{source}' cannot be a path"
        )));
    }

    Ok(VolumeMount {
        mount_type,
        source: source.to_string(),
        target: target.to_string(),
        read_only,
    })
}

impl VolumeInput {
    pub fn normalize(self) -> Result<VolumeMount> {
        match self {
            VolumeInput::Short(spec) => parse_volume(&spec),
            VolumeInput::Long {
                mount_type,
                source,
                target,
                read_only,
            } => build(mount_type, &source, &target, read_only.unwrap_or(false)),
        }
    }
}

impl VolumeMount {
    #[must_use]
    pub fn to_yaml(&self) -> Value {
        let mut map = Mapping::new();
        map.insert("type".into(), self.mount_type.as_str().into());
        map.insert("source".into(), Value::String(self.source.clone()));
        map.insert("target".into(), Value::String(self.target.clone()));
        if self.read_only {
            map.insert("read_only".into(), Value::Bool(true));
        }
        Value::Mapping(map)
    }
}

/// Normalizes a replacement list. Two mounts may not share a target.
pub fn normalize_volumes(inputs: Vec<VolumeInput>) -> Result<Vec<VolumeMount>> {
    let mut mounts: Vec<VolumeMount> = Vec::with_capacity(inputs.len());
    for input in inputs {
        let mount = input.normalize()?;
        if mounts.iter().any(|m| m.target == mount.target) {
            return Err(Error::Compose(format!(
                "mount target '{}' is listed twice",
                mount.target
            )));
        }
        mounts.push(mount);
    }
    Ok(mounts)
}

/// Named volume referenced by one entry of a service's `volumes` list, if any.
pub fn named_volume(entry: &Value) -> Option<String> {
    match entry {
        Value::String(spec) => {
            let source = spec.split(':').next()?;
            (spec.contains(':') && !source.is_empty() && !is_host_path(source))
                .then(|| source.to_string())
        }
        Value::Mapping(map) => {
            let is_volume = map.get("type").and_then(Value::as_str) == Some("volume");
            let source = map.get("source").and_then(Value::as_str)?;
            (is_volume && !source.is_empty()).then(|| source.to_string())
        }
        _ => None,
    }
}
