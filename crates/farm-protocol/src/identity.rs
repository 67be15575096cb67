/// Device identity and group requirement matching.
///
/// Identity is a flat attribute map derived from device properties.
/// Matching is a pure function of `(identity, requirements)`.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Property keys read from the device, and the identity attribute each
/// one becomes.
const PROPERTY_MAP: &[(&str, &str)] = &[
    ("ro.product.manufacturer", "manufacturer"),
    ("ro.product.model", "model"),
    ("ro.build.version.release", "version"),
    ("ro.build.version.sdk", "sdk"),
    ("ro.product.cpu.abi", "abi"),
    ("ro.product.name", "product"),
];

/// Structured description of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    attributes: BTreeMap<String, String>,
}

impl Identity {
    /// Build an identity from raw device properties. `serial` and
    /// `platform` are always present; `platform` defaults to Android
    /// unless the backend reports one.
    pub fn from_properties(serial: &str, properties: &HashMap<String, String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("serial".to_string(), serial.to_string());
        attributes.insert(
            "platform".to_string(),
            properties
                .get("platform")
                .map(String::as_str)
                .unwrap_or("Android")
                .to_string(),
        );
        for (key, attr) in PROPERTY_MAP {
            if let Some(value) = properties.get(*key) {
                attributes.insert(attr.to_string(), value.clone());
            }
        }
        Self { attributes }
    }

    /// Set or replace one attribute.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

/// How a requirement compares its value with the identity attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementKind {
    /// Byte-for-byte equality.
    Exact,
    /// Shell-style pattern (`*`, `?`, `[...]`).
    Glob,
}

/// One constraint of a GROUP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub value: String,
    pub kind: RequirementKind,
}

impl Requirement {
    pub fn exact(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind: RequirementKind::Exact,
        }
    }

    pub fn glob(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: pattern.into(),
            kind: RequirementKind::Glob,
        }
    }

    /// A missing attribute never satisfies. An invalid pattern never
    /// satisfies either.
    pub fn is_satisfied_by(&self, identity: &Identity) -> bool {
        let Some(actual) = identity.get(&self.name) else {
            return false;
        };
        match self.kind {
            RequirementKind::Exact => actual == self.value,
            RequirementKind::Glob => match glob::Pattern::new(&self.value) {
                Ok(pattern) => pattern.matches(actual),
                Err(e) => {
                    tracing::debug!("requirement {}: bad pattern {:?}: {e}", self.name, self.value);
                    false
                }
            },
        }
    }
}

/// Does `identity` satisfy every requirement?
///
/// Before the first probe there is no identity; only an empty requirement
/// list matches then.
pub fn matches(identity: Option<&Identity>, requirements: &[Requirement]) -> bool {
    match identity {
        Some(identity) => requirements.iter().all(|r| r.is_satisfied_by(identity)),
        None => requirements.is_empty(),
    }
}
