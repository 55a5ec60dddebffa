//! Layered YAML loading: `base → <env> → local`, then env var overrides.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::error::ConfigError;

/// Prefix for every config override variable.
pub const ENV_PREFIX: &str = "ALICE__";

/// Nesting separator inside override variable names.
pub const ENV_SEPARATOR: &str = "__";

/// Loads YAML documents from a layered config directory.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    root: PathBuf,
    env: String,
    overrides: Vec<(String, String)>,
}

impl ConfigLoader {
    /// Create a loader rooted at `root` for the given environment name.
    ///
    /// Environment overrides are not read until [`with_process_env`] or
    /// [`with_overrides`] is called.
    ///
    /// [`with_process_env`]: Self::with_process_env
    /// [`with_overrides`]: Self::with_overrides
    pub fn new(root: impl Into<PathBuf>, env: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            env: env.into(),
            overrides: Vec::new(),
        }
    }

    /// Snapshot `ALICE__*` variables from the process environment.
    pub fn with_process_env(mut self) -> Self {
        self.overrides = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        self
    }

    /// Use an explicit list of override variables.
    pub fn with_overrides(mut self, vars: Vec<(String, String)>) -> Self {
        self.overrides = vars;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    fn layer_dirs(&self) -> [PathBuf; 3] {
        [
            self.root.join("base"),
            self.root.join(&self.env),
            self.root.join("local"),
        ]
    }

    /// Load and merge every layer of `<name>.yaml` into one value.
    pub fn load_value(&self, name: &str) -> Result<Value, ConfigError> {
        let mut merged = Value::Mapping(Mapping::new());

        for dir in self.layer_dirs() {
            let path = dir.join(format!("{}.yaml", name));
            if !path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let layer: Value = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            if layer.is_null() {
                continue;
            }
            tracing::debug!("Merging config layer {}", path.display());
            deep_merge(&mut merged, layer);
        }

        apply_overrides(&mut merged, name, &self.overrides);
        Ok(merged)
    }

    /// Load `<name>.yaml` into a typed document.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConfigError> {
        let value = self.load_value(name)?;
        serde_yaml::from_value(value).map_err(|e| ConfigError::Parse {
            path: format!("{}/{{base,{},local}}/{}.yaml", self.root.display(), self.env, name),
            reason: e.to_string(),
        })
    }
}

/// Recursively merge `overlay` into `base`.
///
/// Mappings merge key by key; every other value in `overlay` replaces the
/// value in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `ALICE__<DOC>__<KEY>__<SUBKEY>=value` overrides addressed to `doc`.
///
/// Keys are lowercased. Values are parsed as YAML scalars so `true`, `42`
/// and `[a, b]` keep their types.
pub fn apply_overrides(target: &mut Value, doc: &str, vars: &[(String, String)]) {
    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let mut segments = rest
            .split(ENV_SEPARATOR)
            .map(|s| s.to_lowercase())
            .collect::<Vec<_>>();
        if segments.len() < 2 || segments[0] != doc {
            continue;
        }
        segments.remove(0);

        let value = serde_yaml::from_str::<Value>(raw).unwrap_or(Value::String(raw.clone()));
        set_path(target, &segments, value);
    }
}

fn set_path(target: &mut Value, path: &[String], value: Value) {
    let Some((head, tail)) = path.split_first() else {
        *target = value;
        return;
    };
    if !target.is_mapping() {
        *target = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(map) = target {
        let key = Value::String(head.clone());
        let slot = map
            .entry(key)
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        set_path(slot, tail, value);
    }
}
