//! Parameter overrides and template merging.
//!
//! A [`ParameterStore`] collects typed overrides for the fields returned
//! by [`extract_editable_fields`](crate::template::extract_editable_fields).
//! [`merge`] writes them into a deep copy of the template right before
//! submission; the loaded template itself is never modified.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::CoreError;
use crate::template::{EditableField, FieldKind, JobTemplate};
use crate::types::RemoteAsset;

/// Input keys checked, in order, when injecting an uploaded capture.
const IMAGE_INJECT_KEYS: &[&str] = &["image", "filename", "image_path"];

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Value of an override. The variant must match the field's [`FieldKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    /// Local file awaiting upload. `remote_name` is filled once uploaded.
    ImagePath {
        local: PathBuf,
        remote_name: Option<String>,
    },
}

/// A caller-chosen value for one editable field.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterOverride {
    pub node_id: String,
    pub field_name: String,
    pub value: OverrideValue,
}

/// Overrides for the editable fields of one loaded template.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    fields: Vec<EditableField>,
    overrides: Vec<ParameterOverride>,
}

// ---------------------------------------------------------------------------
// OverrideValue
// ---------------------------------------------------------------------------

impl OverrideValue {
    /// The field kind this value belongs to.
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Integer(_) => FieldKind::Integer,
            Self::Float(_) => FieldKind::Float,
            Self::String(_) => FieldKind::String,
            Self::Boolean(_) => FieldKind::Boolean,
            Self::ImagePath { .. } => FieldKind::ImagePath,
        }
    }

    /// JSON value to write into the template, if any.
    ///
    /// An image that has not been uploaded yet has nothing to write.
    fn to_value(&self) -> Option<Value> {
        match self {
            Self::Integer(i) => Some(Value::from(*i)),
            Self::Float(f) => Some(Value::from(*f)),
            Self::String(s) => Some(Value::String(s.clone())),
            Self::Boolean(b) => Some(Value::Bool(*b)),
            Self::ImagePath { remote_name, .. } => remote_name.clone().map(Value::String),
        }
    }
}

impl ParameterOverride {
    /// Local image file, if this is an image override whose file exists.
    pub fn local_image(&self) -> Option<&Path> {
        match &self.value {
            OverrideValue::ImagePath { local, .. } if local.is_file() => Some(local.as_path()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ParameterStore
// ---------------------------------------------------------------------------

impl ParameterStore {
    pub fn new(fields: Vec<EditableField>) -> Self {
        Self {
            fields,
            overrides: Vec::new(),
        }
    }

    /// Fields this store accepts overrides for.
    pub fn fields(&self) -> &[EditableField] {
        &self.fields
    }

    pub fn overrides(&self) -> &[ParameterOverride] {
        &self.overrides
    }

    pub fn get(&self, node_id: &str, field_name: &str) -> Option<&OverrideValue> {
        self.overrides
            .iter()
            .find(|o| o.node_id == node_id && o.field_name == field_name)
            .map(|o| &o.value)
    }

    /// Set or replace the override for a field.
    ///
    /// Float fields accept integer values, widened.
    pub fn set(
        &mut self,
        node_id: &str,
        field_name: &str,
        value: OverrideValue,
    ) -> Result<(), CoreError> {
        let field = self
            .fields
            .iter()
            .find(|f| f.node_id == node_id && f.field_name == field_name)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Node '{node_id}' has no editable field '{field_name}'"
                ))
            })?;

        let value = match (field.kind, value) {
            (FieldKind::Float, OverrideValue::Integer(i)) => OverrideValue::Float(i as f64),
            (kind, value) if value.kind() == kind => value,
            (kind, value) => {
                return Err(CoreError::Validation(format!(
                    "Field '{field_name}' of node '{node_id}' expects {kind:?}, got {:?}",
                    value.kind()
                )))
            }
        };

        match self
            .overrides
            .iter_mut()
            .find(|o| o.node_id == node_id && o.field_name == field_name)
        {
            Some(existing) => existing.value = value,
            None => self.overrides.push(ParameterOverride {
                node_id: node_id.to_string(),
                field_name: field_name.to_string(),
                value,
            }),
        }
        Ok(())
    }

    /// Record the server-side name of an uploaded image override.
    ///
    /// Returns `false` if no image override exists for the field.
    pub fn resolve_upload(&mut self, node_id: &str, field_name: &str, remote: &str) -> bool {
        let slot = self
            .overrides
            .iter_mut()
            .find(|o| o.node_id == node_id && o.field_name == field_name);
        match slot.map(|o| &mut o.value) {
            Some(OverrideValue::ImagePath { remote_name, .. }) => {
                *remote_name = Some(remote.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.overrides.clear();
    }

    pub fn has_any_local_image_override(&self) -> bool {
        has_any_local_image_override(&self.overrides)
    }

    pub fn merge(&self, template: &JobTemplate) -> JobTemplate {
        merge(template, &self.overrides)
    }
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Apply overrides to a deep copy of `template`.
///
/// Overrides naming a node that is not in the template are skipped with
/// a warning. Image overrides that have not been uploaded leave the field
/// untouched.
pub fn merge(template: &JobTemplate, overrides: &[ParameterOverride]) -> JobTemplate {
    let mut merged = template.clone();

    for o in overrides {
        let Some(node) = merged.node_mut(&o.node_id) else {
            tracing::warn!(
                node_id = %o.node_id,
                field = %o.field_name,
                "Override targets a node missing from the template, skipping",
            );
            continue;
        };
        if let Some(value) = o.value.to_value() {
            node.inputs.insert(o.field_name.clone(), value);
        }
    }

    merged
}

/// Whether any image override points at an existing local file.
pub fn has_any_local_image_override(overrides: &[ParameterOverride]) -> bool {
    overrides.iter().any(|o| o.local_image().is_some())
}

/// Point the input node at an uploaded image.
///
/// Writes the remote name into the first of `image`, `filename`,
/// `image_path` present on the node (or `image` if none is), and sets
/// `subfolder` and `type` alongside. Returns `false` when the node does
/// not exist.
pub fn inject_uploaded_image(
    template: &mut JobTemplate,
    node_id: &str,
    asset: &RemoteAsset,
) -> bool {
    let Some(node) = template.node_mut(node_id) else {
        return false;
    };

    let key = IMAGE_INJECT_KEYS
        .iter()
        .find(|k| node.inputs.contains_key(**k))
        .copied()
        .unwrap_or(IMAGE_INJECT_KEYS[0]);

    node.inputs
        .insert(key.to_string(), Value::String(asset.name.clone()));
    node.inputs
        .insert("subfolder".to_string(), Value::String(asset.subfolder.clone()));
    node.inputs
        .insert("type".to_string(), Value::String(asset.kind.clone()));
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{extract_editable_fields, parse_template};
    use serde_json::json;

    fn sample() -> JobTemplate {
        parse_template(&json!({
            "1": {
                "class_type": "LoadImage",
                "inputs": { "image": "render.png" }
            },
            "2": {
                "class_type": "KSampler",
                "inputs": { "seed": 42, "cfg": 7.5, "denoise": true, "model": ["4", 0] }
            },
            "3": {
                "class_type": "Preview3D",
                "inputs": { "model_file": "mesh.glb" },
                "_meta": { "title": "Preview 3D" }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "model.safetensors" }
            }
        }))
        .unwrap()
    }

    fn store() -> ParameterStore {
        ParameterStore::new(extract_editable_fields(&sample()))
    }

    fn override_of(node_id: &str, field_name: &str, value: OverrideValue) -> ParameterOverride {
        ParameterOverride {
            node_id: node_id.into(),
            field_name: field_name.into(),
            value,
        }
    }

    // -- merge ----------------------------------------------------------------

    #[test]
    fn merge_with_no_overrides_is_identity() {
        let template = sample();
        assert_eq!(merge(&template, &[]), template);
    }

    #[test]
    fn merge_does_not_mutate_input() {
        let template = sample();
        let before = template.clone();
        let merged = merge(
            &template,
            &[override_of("2", "seed", OverrideValue::Integer(7))],
        );
        assert_eq!(template, before);
        assert_eq!(merged.node("2").unwrap().inputs["seed"], json!(7));
    }

    #[test]
    fn merge_preserves_links() {
        let merged = merge(
            &sample(),
            &[override_of("2", "cfg", OverrideValue::Float(3.0))],
        );
        assert_eq!(merged.node("2").unwrap().inputs["model"], json!(["4", 0]));
        assert_eq!(merged.node("2").unwrap().inputs["cfg"], json!(3.0));
    }

    #[test]
    fn merge_skips_missing_nodes() {
        let template = sample();
        let merged = merge(
            &template,
            &[override_of("99", "seed", OverrideValue::Integer(1))],
        );
        assert_eq!(merged, template);
    }

    #[test]
    fn merge_leaves_blacklisted_nodes_unchanged() {
        let template = sample();
        let merged = merge(
            &template,
            &[override_of("2", "seed", OverrideValue::Integer(1))],
        );
        assert_eq!(merged.node("3"), template.node("3"));
        assert_eq!(merged.to_value()["3"], template.to_value()["3"]);
    }

    #[test]
    fn merge_writes_uploaded_image_name_only() {
        let pending = override_of(
            "1",
            "image",
            OverrideValue::ImagePath { local: "/tmp/in.png".into(), remote_name: None },
        );
        let merged = merge(&sample(), &[pending]);
        assert_eq!(merged.node("1").unwrap().inputs["image"], json!("render.png"));

        let uploaded = override_of(
            "1",
            "image",
            OverrideValue::ImagePath {
                local: "/tmp/in.png".into(),
                remote_name: Some("in (1).png".into()),
            },
        );
        let merged = merge(&sample(), &[uploaded]);
        assert_eq!(merged.node("1").unwrap().inputs["image"], json!("in (1).png"));
    }

    // -- ParameterStore -------------------------------------------------------

    #[test]
    fn set_rejects_unknown_field() {
        let mut store = store();
        let err = store
            .set("2", "model", OverrideValue::String("x".into()))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn set_rejects_blacklisted_node_fields() {
        let mut store = store();
        assert!(store
            .set("3", "model_file", OverrideValue::String("x.glb".into()))
            .is_err());
    }

    #[test]
    fn set_rejects_kind_mismatch() {
        let mut store = store();
        assert!(store.set("2", "denoise", OverrideValue::Integer(1)).is_err());
        assert!(store.set("2", "seed", OverrideValue::Float(1.5)).is_err());
    }

    #[test]
    fn set_widens_integer_for_float_field() {
        let mut store = store();
        store.set("2", "cfg", OverrideValue::Integer(8)).unwrap();
        assert_eq!(store.get("2", "cfg"), Some(&OverrideValue::Float(8.0)));
    }

    #[test]
    fn set_replaces_existing_override() {
        let mut store = store();
        store.set("2", "seed", OverrideValue::Integer(1)).unwrap();
        store.set("2", "seed", OverrideValue::Integer(2)).unwrap();
        assert_eq!(store.overrides().len(), 1);
        assert_eq!(store.get("2", "seed"), Some(&OverrideValue::Integer(2)));
    }

    #[test]
    fn resolve_upload_fills_remote_name() {
        let mut store = store();
        store
            .set(
                "1",
                "image",
                OverrideValue::ImagePath { local: "/tmp/x.png".into(), remote_name: None },
            )
            .unwrap();
        assert!(store.resolve_upload("1", "image", "x.png"));
        assert!(!store.resolve_upload("2", "seed", "x.png"));

        let merged = store.merge(&sample());
        assert_eq!(merged.node("1").unwrap().inputs["image"], json!("x.png"));
    }

    #[test]
    fn local_image_detection_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("in.png");
        std::fs::write(&present, b"png").unwrap();

        let missing = override_of(
            "1",
            "image",
            OverrideValue::ImagePath { local: dir.path().join("gone.png"), remote_name: None },
        );
        assert!(!has_any_local_image_override(&[missing.clone()]));

        let found = override_of(
            "1",
            "image",
            OverrideValue::ImagePath { local: present, remote_name: None },
        );
        assert!(has_any_local_image_override(&[missing, found]));
    }

    #[test]
    fn clear_removes_all_overrides() {
        let mut store = store();
        store.set("2", "seed", OverrideValue::Integer(1)).unwrap();
        store.clear();
        assert!(store.overrides().is_empty());
    }

    // -- inject_uploaded_image ------------------------------------------------

    fn asset() -> RemoteAsset {
        RemoteAsset {
            name: "capture.png".into(),
            subfolder: "renders".into(),
            kind: "input".into(),
        }
    }

    #[test]
    fn inject_uses_existing_image_key() {
        let mut template = sample();
        assert!(inject_uploaded_image(&mut template, "1", &asset()));
        let inputs = &template.node("1").unwrap().inputs;
        assert_eq!(inputs["image"], json!("capture.png"));
        assert_eq!(inputs["subfolder"], json!("renders"));
        assert_eq!(inputs["type"], json!("input"));
    }

    #[test]
    fn inject_prefers_filename_over_image_path() {
        let mut template = parse_template(&json!({
            "1": { "class_type": "LoadFile", "inputs": { "image_path": "a", "filename": "b" } }
        }))
        .unwrap();
        inject_uploaded_image(&mut template, "1", &asset());
        let inputs = &template.node("1").unwrap().inputs;
        assert_eq!(inputs["filename"], json!("capture.png"));
        assert_eq!(inputs["image_path"], json!("a"));
    }

    #[test]
    fn inject_defaults_to_image_key() {
        let mut template = parse_template(&json!({
            "1": { "class_type": "Custom", "inputs": {} }
        }))
        .unwrap();
        inject_uploaded_image(&mut template, "1", &asset());
        assert_eq!(template.node("1").unwrap().inputs["image"], json!("capture.png"));
    }

    #[test]
    fn inject_missing_node_returns_false() {
        let mut template = sample();
        assert!(!inject_uploaded_image(&mut template, "42", &asset()));
    }
}
