//! Slicer configuration derived from a quality preset plus caller overrides.
//!
//! | preset | lineHeight | roof/floorLayerCount | numberOfShells |
//! |--------|------------|----------------------|----------------|
//! | low    | 0.34       | 3                    | 2              |
//! | medium | 0.27       | 5                    | 2              |
//! | high   | 0.1        | 7                    | 4              |
//!
//! Overrides are deep-merged over the computed settings and win at every
//! nesting level.

use makeme_shared::QualityPreset;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to write slicer config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to encode slicer config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Slicer base config {path} is not a JSON object")]
    BaseNotObject { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionProfile {
    #[serde(serialize_with = "whole_as_integer")]
    pub temperature: f64,
    pub feedrate: u32,
}

/// Write `230.0` as `230`; the slicer's own documents use integer temperatures.
fn whole_as_integer<S: serde::Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// Layer settings computed from a preset, before overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceSettings {
    pub line_height: f64,
    pub roof_layer_count: u32,
    pub floor_layer_count: u32,
    pub number_of_shells: u32,
    pub extrusion_profiles: BTreeMap<String, ExtrusionProfile>,
}

const SHELL_FEEDRATE: u32 = 80;
const EDGE_FEEDRATE: u32 = 50;

impl SliceSettings {
    pub fn for_preset(preset: QualityPreset, temperature: f64) -> Self {
        let (line_height, layers, shells) = match preset {
            QualityPreset::Low => (0.34, 3, 2),
            QualityPreset::Medium => (0.27, 5, 2),
            QualityPreset::High => (0.1, 7, 4),
        };
        let profile = |feedrate| ExtrusionProfile { temperature, feedrate };
        let extrusion_profiles = BTreeMap::from([
            ("insets".to_string(), profile(SHELL_FEEDRATE)),
            ("infill".to_string(), profile(SHELL_FEEDRATE)),
            ("firstlayer".to_string(), profile(EDGE_FEEDRATE)),
            ("outlines".to_string(), profile(EDGE_FEEDRATE)),
        ]);
        Self {
            line_height,
            roof_layer_count: layers,
            floor_layer_count: layers,
            number_of_shells: shells,
            extrusion_profiles,
        }
    }
}

/// Merge `overlay` into `base`. Objects merge key by key; anything else replaces.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Final slicer document.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceConfig {
    document: Value,
}

impl SliceConfig {
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// JSON pointer lookup, e.g. `/extrusionProfiles/infill/feedrate`.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.document.pointer(pointer)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.document)
    }

    /// Overwrite `path` with this config. Keys are emitted in sorted order.
    pub fn persist(&self, path: &Path) -> Result<(), PersistError> {
        let mut json = self.to_json()?;
        json.push('\n');
        let io_err = |source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        tracing::debug!("Wrote slicer config to {}", path.display());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SliceConfigBuilder {
    base: Value,
}

impl Default for SliceConfigBuilder {
    fn default() -> Self {
        Self {
            base: Value::Object(Map::new()),
        }
    }
}

impl SliceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every config from `base` (the slicer's full default document).
    pub fn with_base(base: Map<String, Value>) -> Self {
        Self {
            base: Value::Object(base),
        }
    }

    pub fn from_base_file(path: &Path) -> Result<Self, PersistError> {
        let content = std::fs::read_to_string(path).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match serde_json::from_str(&content)? {
            Value::Object(base) => Ok(Self::with_base(base)),
            _ => Err(PersistError::BaseNotObject {
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn build(&self, preset: QualityPreset, overrides: &Map<String, Value>, temperature: f64) -> SliceConfig {
        let settings = SliceSettings::for_preset(preset, temperature);
        let mut document = self.base.clone();
        match serde_json::to_value(&settings) {
            Ok(computed) => deep_merge(&mut document, &computed),
            Err(e) => tracing::error!("Failed to encode slice settings: {}", e),
        }
        deep_merge(&mut document, &Value::Object(overrides.clone()));
        SliceConfig { document }
    }
}
