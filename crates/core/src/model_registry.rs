use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{UpscaleMode, UpscalePreset};

const GENERAL_X4V3_URL: &str = "https://huggingface.co/JoPmt/Real_Esrgan_x2_Onnx_Tflite_Tfjs/resolve/main/ano_test/realesr-general-x4v3.onnx";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelRuntime {
    Neural,
    Classical,
}

/// Numeric range a model expects on its input tensor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputRange {
    /// `[0, 1]`
    #[default]
    Unit,
    /// `[0, 255]`
    Byte,
}

impl InputRange {
    pub fn scale(self) -> f32 {
        match self {
            Self::Unit => 1.0,
            Self::Byte => 255.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub id: String,
    pub mode: UpscaleMode,
    pub preset: UpscalePreset,
    pub scale: u32,
    pub runtime: ModelRuntime,
    #[serde(default)]
    pub url: Option<String>,
    /// Lowercase hex SHA-256 of the artifact; verified after download when present.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default = "default_channels")]
    pub expected_channels: u32,
    #[serde(default)]
    pub input_range: InputRange,
}

fn default_channels() -> u32 {
    3
}

impl ModelDescriptor {
    pub fn is_neural(&self) -> bool {
        self.runtime == ModelRuntime::Neural && self.url.is_some()
    }

    fn neural(mode: UpscaleMode, scale: u32, url: &str) -> Self {
        Self {
            id: format!("onnx-{mode}-{scale}x"),
            mode,
            preset: UpscalePreset::Balanced,
            scale,
            runtime: ModelRuntime::Neural,
            url: Some(url.to_string()),
            sha256: None,
            expected_channels: 3,
            input_range: InputRange::Unit,
        }
    }

    fn classical(mode: UpscaleMode, scale: u32) -> Self {
        Self {
            id: format!("classic-{mode}-balanced-{scale}x"),
            mode,
            preset: UpscalePreset::Balanced,
            scale,
            runtime: ModelRuntime::Classical,
            url: None,
            sha256: None,
            expected_channels: 3,
            input_range: InputRange::Unit,
        }
    }

    /// Descriptor used when the table is empty.
    pub fn generic_classical() -> Self {
        Self {
            id: "classic-generic".to_string(),
            ..Self::classical(UpscaleMode::Photo, 2)
        }
    }
}

fn builtin_table() -> Vec<ModelDescriptor> {
    use UpscaleMode::{Anime, Photo, Text};

    let mut table = Vec::new();
    for mode in [Photo, Anime, Text] {
        for scale in [2, 4] {
            table.push(ModelDescriptor::neural(mode, scale, GENERAL_X4V3_URL));
        }
    }
    for mode in [Photo, Anime, Text] {
        for scale in [2, 4] {
            table.push(ModelDescriptor::classical(mode, scale));
        }
    }
    table
}

/// Static descriptor table with fallback lookup.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: Vec<ModelDescriptor>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        Self {
            entries: builtin_table(),
        }
    }

    pub fn from_entries(entries: Vec<ModelDescriptor>) -> Self {
        Self { entries }
    }

    pub fn list(&self) -> &[ModelDescriptor] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Exact `(mode, preset, scale)` match, then `(mode, scale)`, then the first
    /// entry. An empty table yields [`ModelDescriptor::generic_classical`].
    pub fn resolve(
        &self,
        mode: UpscaleMode,
        preset: UpscalePreset,
        scale: u32,
    ) -> ModelDescriptor {
        let found = self
            .entries
            .iter()
            .find(|e| e.mode == mode && e.preset == preset && e.scale == scale)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| e.mode == mode && e.scale == scale)
            })
            .or_else(|| self.entries.first());

        match found {
            Some(entry) => {
                debug!(model = %entry.id, %mode, %preset, scale, "Resolved model descriptor");
                entry.clone()
            }
            None => ModelDescriptor::generic_classical(),
        }
    }

    /// Merges descriptors from a JSON catalog; ids already present are kept.
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<ModelDescriptor> =
            serde_json::from_str(json).context("Failed to parse model catalog JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.id == entry.id) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_has_neural_and_classical_entries() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.list().len(), 12);
        let neural = registry
            .list()
            .iter()
            .filter(|e| e.runtime == ModelRuntime::Neural)
            .count();
        assert_eq!(neural, 6);
        assert!(registry.list().iter().all(|e| e.expected_channels == 3));
    }

    #[test]
    fn resolve_exact_match() {
        let registry = ModelRegistry::builtin();
        let model = registry.resolve(UpscaleMode::Anime, UpscalePreset::Balanced, 4);
        assert_eq!(model.id, "onnx-anime-4x");
        assert!(model.is_neural());
    }

    #[test]
    fn builtin_neural_entries_share_the_general_model() {
        let registry = ModelRegistry::builtin();
        for entry in registry.list().iter().filter(|e| e.is_neural()) {
            assert_eq!(entry.url.as_deref(), Some(GENERAL_X4V3_URL), "{}", entry.id);
            assert_eq!(entry.input_range, InputRange::Unit, "{}", entry.id);
        }
    }

    #[test]
    fn resolve_falls_back_to_mode_and_scale() {
        let registry = ModelRegistry::builtin();
        let model = registry.resolve(UpscaleMode::Text, UpscalePreset::High, 2);
        assert_eq!(model.id, "onnx-text-2x");
    }

    #[test]
    fn resolve_falls_back_to_first_entry() {
        let registry = ModelRegistry::builtin();
        let model = registry.resolve(UpscaleMode::Photo, UpscalePreset::Fast, 8);
        assert_eq!(model.id, registry.list()[0].id);
    }

    #[test]
    fn resolve_on_empty_table_is_generic_classical() {
        let registry = ModelRegistry::from_entries(Vec::new());
        let model = registry.resolve(UpscaleMode::Photo, UpscalePreset::Balanced, 2);
        assert_eq!(model.runtime, ModelRuntime::Classical);
        assert!(!model.is_neural());
    }

    #[test]
    fn load_json_keeps_existing_ids() {
        let mut registry = ModelRegistry::from_entries(vec![ModelDescriptor::generic_classical()]);
        let json = r#"[
            {"id":"classic-generic","mode":"anime","preset":"high","scale":4,"runtime":"classical"},
            {"id":"custom-2x","mode":"photo","preset":"fast","scale":2,"runtime":"neural",
             "url":"https://example.com/custom.onnx","sha256":"abc"},
            {"id":"byte-4x","mode":"anime","preset":"high","scale":4,"runtime":"neural",
             "url":"https://example.com/byte.onnx","input_range":"byte"}
        ]"#;
        registry.load_json(json).expect("load catalog");
        assert_eq!(registry.list().len(), 3);
        assert_eq!(
            registry.get("byte-4x").map(|e| e.input_range),
            Some(InputRange::Byte)
        );
        assert_eq!(
            registry.get("classic-generic").map(|e| e.mode),
            Some(UpscaleMode::Photo)
        );
        let custom = registry.get("custom-2x").expect("custom entry");
        assert_eq!(custom.expected_channels, 3);
        assert_eq!(custom.input_range, InputRange::Unit);
        assert!(registry.load_json("not json").is_err());
    }

    #[test]
    fn catalog_json_roundtrip() {
        let registry = ModelRegistry::builtin();
        let json = registry.to_json().expect("serialize");
        let mut restored = ModelRegistry::from_entries(Vec::new());
        restored.load_json(&json).expect("parse");
        assert_eq!(restored.list(), registry.list());
    }
}
