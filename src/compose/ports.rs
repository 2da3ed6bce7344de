//! Port mappings, normalized to the long object form.

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    pub protocol: String,
}

/// Accepts `"8080:80"`, `80`, or `{target, published, host_ip, protocol}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortInput {
    Number(u64),
    Short(String),
    Long {
        #[serde(deserialize_with = "string_or_number")]
        target: String,
        #[serde(default, deserialize_with = "opt_string_or_number")]
        published: Option<String>,
        #[serde(default)]
        host_ip: Option<String>,
        #[serde(default)]
        protocol: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Num(u64),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Num(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Scalar::deserialize(d).map(Scalar::into_string)
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(Scalar::into_string))
}

fn is_port_spec(value: &str) -> bool {
    !value.is_empty()
        && value
            .split('-')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

fn check_protocol(protocol: &str) -> Result<String> {
    match protocol {
        "tcp" | "udp" | "sctp" => Ok(protocol.to_string()),
        other => Err(Error::Compose(format!("unsupported port protocol '{other}'"))),
    }
}

/// Parses the short syntax `[[host_ip:]published:]target[/protocol]`.
pub fn parse_port(spec: &str) -> Result<PortMapping> {
    let spec = spec.trim();
    let (body, protocol) = match spec.rsplit_once('/') {
        Some((body, protocol)) => (body, check_protocol(protocol)?),
        None => (spec, "tcp".to_string()),
    };

    let (host_ip, rest) = if let Some(stripped) = body.strip_prefix('[') {
        let (ip, rest) = stripped
            .split_once("]:")
            .ok_or_else(|| Error::Compose(format!("invalid port '{spec}'")))?;
        (Some(ip.to_string()), rest)
    } else {
        match body.matches(':').count() {
            0 | 1 => (None, body),
            2 => {
                let (ip, rest) = body
                    .split_once(':')
                    .ok_or_else(|| Error::Compose(format!("invalid port '{spec}'")))?;
                (Some(ip.to_string()), rest)
            }
            _ => return Err(Error::Compose(format!("invalid port '{spec}'"))),
        }
    };

    let (published, target) = match rest.split_once(':') {
        Some((published, target)) => (
            (!published.is_empty()).then(|| published.to_string()),
            target,
        ),
        None => (None, rest),
    };

    if !is_port_spec(target) {
        return Err(Error::Compose(format!("invalid container port in '{spec}'")));
    }
    if let Some(published) = &published {
        if !is_port_spec(published) {
            return Err(Error::Compose(format!("invalid published port in '{spec}'")));
        }
    }

    Ok(PortMapping {
        target: target.to_string(),
        published,
        host_ip: host_ip.filter(|ip| !ip.is_empty()),
        protocol,
    })
}

impl PortInput {
    pub fn normalize(self) -> Result<PortMapping> {
        match self {
            PortInput::Number(n) => parse_port(&n.to_string()),
            PortInput::Short(s) => parse_port(&s),
            PortInput::Long {
                target,
                published,
                host_ip,
                protocol,
            } => {
                if !is_port_spec(&target) {
                    return Err(Error::Compose(format!("invalid container port '{target}'")));
                }
                let published = published.filter(|p| !p.is_empty());
                if let Some(p) = &published {
                    if !is_port_spec(p) {
                        return Err(Error::Compose(format!("invalid published port '{p}'")));
                    }
                }
                Ok(PortMapping {
                    target,
                    published,
                    host_ip: host_ip.filter(|ip| !ip.is_empty()),
                    protocol: check_protocol(protocol.as_deref().unwrap_or("tcp"))?,
                })
            }
        }
    }
}

impl PortMapping {
    #[must_use]
    pub fn to_yaml(&self) -> Value {
        let mut map = Mapping::new();
        let target = self
            .target
            .parse::<u64>()
            .map_or_else(|_| Value::String(self.target.clone()), Value::from);
        map.insert("target".into(), target);
        if let Some(published) = &self.published {
            map.insert("published".into(), Value::String(published.clone()));
        }
        if let Some(ip) = &self.host_ip {
            map.insert("host_ip".into(), Value::String(ip.clone()));
        }
        map.insert("protocol".into(), Value::String(self.protocol.clone()));
        Value::Mapping(map)
    }
}

/// Normalizes a full replacement list, rejecting duplicate `(target, published)` pairs.
pub fn normalize_ports(inputs: Vec<PortInput>) -> Result<Vec<PortMapping>> {
    let mut ports: Vec<PortMapping> = Vec::with_capacity(inputs.len());
    for input in inputs {
        let port = input.normalize()?;
        if ports
            .iter()
            .any(|p| p.target == port.target && p.published == port.published)
        {
            return Err(Error::Compose(format!(
                "port {}:{} is listed twice",
                port.published.as_deref().unwrap_or(""),
                port.target
            )));
        }
        ports.push(port);
    }
    Ok(ports)
}
