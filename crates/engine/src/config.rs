//! Target configuration as assembled by the outer config layer (YAML or CLI flags).

use std::collections::{BTreeSet, HashSet};

use objwatch_core::{WatchEventKind, WatchTarget};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Watch,
    Pull,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    /// Logical name; defaults to `resource`.
    #[serde(default)]
    pub name: Option<String>,
    /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment".
    pub resource: String,
    /// Empty watches cluster-wide.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub field_selector: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub exclude_watch_type: Vec<String>,
    /// Persist this target's hash cache in the configured store.
    #[serde(default = "default_true")]
    pub storage: bool,
}

impl TargetConfig {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            name: None,
            resource: resource.into(),
            namespaces: Vec::new(),
            mode: Mode::Watch,
            field_selector: None,
            label_selector: None,
            resource_version: None,
            exclude_watch_type: Vec::new(),
            storage: true,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.resource)
    }

    fn excluded_kinds(&self) -> Result<BTreeSet<WatchEventKind>, ConfigError> {
        self.exclude_watch_type.iter().map(|s| s.parse::<WatchEventKind>().map_err(ConfigError::from)).collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid { target: self.name().to_string(), reason: reason.to_string() };
        let parts: Vec<&str> = self.resource.split('/').collect();
        if !(2..=3).contains(&parts.len()) || parts[parts.len() - 2..].iter().any(|p| p.is_empty()) {
            return Err(invalid("resource must look like v1/Kind or group/v1/Kind"));
        }
        if self.mode == Mode::Pull {
            return Err(ConfigError::UnsupportedMode(self.name().to_string()));
        }
        if self.namespaces.iter().any(|ns| ns.is_empty()) {
            return Err(invalid("empty namespace"));
        }
        self.excluded_kinds()?;
        Ok(())
    }
}

/// A watch target plus whether its cache is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTarget {
    pub target: WatchTarget,
    pub persist: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl EngineConfig {
    pub fn from_yaml(s: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
        Self::from_yaml(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for t in &self.targets {
            t.validate()?;
            if !seen.insert(t.name()) {
                return Err(ConfigError::DuplicateName(t.name().to_string()));
            }
        }
        Ok(())
    }

    /// One watch target per (config entry, namespace). Per-namespace targets
    /// get their own store key, `name/namespace`, so their caches never overlap.
    pub fn plan(&self) -> Result<Vec<PlannedTarget>, ConfigError> {
        self.validate()?;
        let mut out = Vec::new();
        for t in &self.targets {
            let excluded_kinds = t.excluded_kinds()?;
            let base = WatchTarget {
                name: t.name().to_string(),
                resource: t.resource.clone(),
                namespace: None,
                field_selector: t.field_selector.clone(),
                label_selector: t.label_selector.clone(),
                starting_resource_version: t.resource_version.clone(),
                excluded_kinds,
            };
            if t.namespaces.is_empty() {
                out.push(PlannedTarget { target: base, persist: t.storage });
            } else {
                for ns in &t.namespaces {
                    let mut target = base.clone().with_namespace(ns.clone());
                    target.name = format!("{}/{}", base.name, ns);
                    out.push(PlannedTarget { target, persist: t.storage });
                }
            }
        }
        // Expanded names double as store keys: "a" in namespace "x" must not meet a target named "a/x".
        let mut keys = HashSet::new();
        for p in &out {
            if !keys.insert(p.target.store_key()) {
                return Err(ConfigError::DuplicateName(p.target.store_key().to_string()));
            }
        }
        Ok(out)
    }
}
