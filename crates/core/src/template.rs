//! ComfyUI workflow template parsing and field discovery.
//!
//! Parses API-format workflow JSON into ordered [`JobNode`]s, classifies
//! every input as a link, a scalar, or structural data, and derives the
//! list of [`EditableField`]s a user may override.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Input names that hold an image reference when their value is a string.
pub const IMAGE_FIELD_NAMES: &[&str] = &["image", "image_path", "filename"];

/// Node titles (substring match) that are never exposed for editing.
///
/// These nodes remain in the template and are still submitted.
pub const BLACKLISTED_TITLES: &[&str] = &["Preview 3D", "Preview 3D & Animation", "Animation"];

/// Title separators that encode a `group : title` pair, in priority order.
const TITLE_SEPARATORS: &[&str] = &[" : ", " | "];

/// File extension of workflow documents in a template library.
const TEMPLATE_EXTENSION: &str = "json";

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// A parsed workflow: nodes in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    nodes: Vec<JobNode>,
}

/// A single node of a workflow template.
#[derive(Debug, Clone, PartialEq)]
pub struct JobNode {
    /// Node ID (string key from the JSON object).
    pub id: String,
    /// ComfyUI class type (e.g. "LoadImage", "SaveImage").
    pub class_type: String,
    /// Display title from `_meta.title`, if any.
    pub title: Option<String>,
    /// Raw input values for this node.
    pub inputs: Map<String, Value>,
    /// Every other key of the node object (e.g. `_meta`), kept verbatim.
    extra: Map<String, Value>,
    /// Keys of the node object in document order.
    key_order: Vec<String>,
}

/// A scalar literal held by a node input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// Classification of a raw input value.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// Reference to another node's output slot: `["5", 0]`.
    Link { node_id: String, slot: u64 },
    /// A literal the user may override.
    Scalar(Scalar),
    /// Anything else (objects, null, arrays that are not links).
    Structural,
}

/// Editable field type, inferred from name and value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Float,
    String,
    Boolean,
    ImagePath,
}

/// A scalar node input exposed for override.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditableField {
    pub node_id: String,
    /// Full resolved node title (title or class type).
    pub node_title: String,
    /// Group parsed from the title, empty when ungrouped.
    pub group: String,
    /// Title with the group prefix removed.
    pub display_title: String,
    pub field_name: String,
    pub kind: FieldKind,
    /// Value found in the template.
    pub default: Scalar,
}

/// Best-effort guess of the input and output nodes of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointGuess {
    pub input: Option<String>,
    pub output: Option<String>,
}

/// Role a candidate node could play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Input,
    Output,
}

/// A scored endpoint candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidate {
    pub node_id: String,
    pub role: EndpointRole,
    /// Higher is more specific.
    pub score: u8,
}

/// Entry for manual node selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeChoice {
    pub node_id: String,
    /// `"{id}: {title} ({class_type})"`.
    pub label: String,
}

/// Editable fields of one node, for UI grouping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeFields {
    pub node_id: String,
    pub display_title: String,
    pub fields: Vec<EditableField>,
}

/// Editable fields grouped by the title-encoded group name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldGroups {
    /// Named groups, sorted by name.
    pub groups: BTreeMap<String, Vec<NodeFields>>,
    pub ungrouped: Vec<NodeFields>,
}

// ---------------------------------------------------------------------------
// JobTemplate / JobNode
// ---------------------------------------------------------------------------

impl JobTemplate {
    /// Nodes in document order.
    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<&JobNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut JobNode> {
        self.nodes.iter_mut().find(|n| n.id == node_id)
    }

    /// Serialize back to API-format JSON, suitable for `/prompt`.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::with_capacity(self.nodes.len());
        for node in &self.nodes {
            obj.insert(node.id.clone(), node.to_value());
        }
        Value::Object(obj)
    }
}

impl JobNode {
    /// Title from `_meta.title`, falling back to the class type.
    pub fn resolved_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.class_type)
    }

    /// Whether this node is hidden from the editable-field set.
    pub fn is_blacklisted(&self) -> bool {
        let title = self.resolved_title();
        BLACKLISTED_TITLES.iter().any(|b| title.contains(b))
    }

    fn to_value(&self) -> Value {
        let mut obj = Map::with_capacity(self.key_order.len());
        for key in &self.key_order {
            let value = match key.as_str() {
                "class_type" => Value::String(self.class_type.clone()),
                "inputs" => Value::Object(self.inputs.clone()),
                other => match self.extra.get(other) {
                    Some(value) => value.clone(),
                    None => continue,
                },
            };
            obj.insert(key.clone(), value);
        }
        Value::Object(obj)
    }
}

// ---------------------------------------------------------------------------
// Scalar classification
// ---------------------------------------------------------------------------

impl Scalar {
    /// Classify a JSON literal. Booleans are checked before numbers, and
    /// integral numbers before floats.
    pub fn classify(value: &Value) -> Option<Scalar> {
        match value {
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            // Integers above i64::MAX fall through to Float rather than wrap.
            Value::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            Value::String(s) => Some(Scalar::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => Value::from(*f),
            Scalar::String(s) => Value::String(s.clone()),
        }
    }
}

impl InputValue {
    /// Classify a raw input value.
    ///
    /// ComfyUI encodes links as `[source_node_id, output_index]`; the
    /// source id may be a string or an integer.
    pub fn classify(value: &Value) -> InputValue {
        if let Some(arr) = value.as_array() {
            if arr.len() == 2 {
                let node_id = if let Some(s) = arr[0].as_str() {
                    Some(s.to_string())
                } else {
                    arr[0].as_u64().map(|n| n.to_string())
                };
                if let (Some(node_id), Some(slot)) = (node_id, arr[1].as_u64()) {
                    return InputValue::Link { node_id, slot };
                }
            }
            return InputValue::Structural;
        }

        match Scalar::classify(value) {
            Some(scalar) => InputValue::Scalar(scalar),
            None => InputValue::Structural,
        }
    }
}

/// Infer the editable kind of a scalar input.
pub fn infer_field_kind(field_name: &str, value: &Scalar) -> FieldKind {
    match value {
        Scalar::String(_) if IMAGE_FIELD_NAMES.contains(&field_name) => FieldKind::ImagePath,
        Scalar::Bool(_) => FieldKind::Boolean,
        Scalar::Int(_) => FieldKind::Integer,
        Scalar::Float(_) => FieldKind::Float,
        Scalar::String(_) => FieldKind::String,
    }
}

/// Split a node title into `(group, title)`.
///
/// ` : ` takes precedence; ` | ` is only considered when ` : ` is absent.
/// Both halves are trimmed. Without a separator the group is empty and
/// the title is returned unchanged.
pub fn split_title(title: &str) -> (String, String) {
    for sep in TITLE_SEPARATORS {
        if let Some((group, rest)) = title.split_once(sep) {
            return (group.trim().to_string(), rest.trim().to_string());
        }
    }
    (String::new(), title.to_string())
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Parse an API-format ComfyUI workflow.
///
/// The expected format is an object where each key is a node ID and each
/// value is an object with `class_type` and `inputs` fields:
///
/// ```json
/// {
///   "3": {
///     "class_type": "LoadImage",
///     "inputs": { "image": "photo.png" },
///     "_meta": { "title": "Input : Photo" }
///   }
/// }
/// ```
///
/// Any malformed node rejects the whole document.
pub fn parse_template(json: &Value) -> Result<JobTemplate, CoreError> {
    let obj = json.as_object().ok_or_else(|| {
        CoreError::InvalidTemplateFormat(
            "Workflow JSON must be an object keyed by node ID (use 'Save (API Format)')"
                .to_string(),
        )
    })?;

    let mut nodes = Vec::with_capacity(obj.len());

    for (node_id, node_value) in obj {
        let node_obj = node_value.as_object().ok_or_else(|| {
            CoreError::InvalidTemplateFormat(format!("Node '{node_id}' must be an object"))
        })?;

        let class_type = match node_obj.get("class_type").and_then(Value::as_str) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                return Err(CoreError::InvalidTemplateFormat(format!(
                    "Node '{node_id}' is missing required 'class_type' field"
                )))
            }
        };

        let inputs = node_obj
            .get("inputs")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| {
                CoreError::InvalidTemplateFormat(format!(
                    "Node '{node_id}' is missing required 'inputs' object"
                ))
            })?;

        let title = node_obj
            .get("_meta")
            .and_then(|m| m.get("title"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let extra = node_obj
            .iter()
            .filter(|(k, _)| k.as_str() != "class_type" && k.as_str() != "inputs")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        nodes.push(JobNode {
            id: node_id.clone(),
            class_type,
            title,
            inputs,
            extra,
            key_order: node_obj.keys().cloned().collect(),
        });
    }

    Ok(JobTemplate { nodes })
}

/// Parse workflow JSON text.
pub fn parse_template_str(text: &str) -> Result<JobTemplate, CoreError> {
    let json: Value = serde_json::from_str(text)
        .map_err(|e| CoreError::InvalidTemplateFormat(format!("Malformed JSON: {e}")))?;
    parse_template(&json)
}

/// Read and parse a workflow file from disk.
pub fn load_template_file(path: &Path) -> Result<JobTemplate, CoreError> {
    if !path.is_file() {
        return Err(CoreError::TemplateNotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    let template = parse_template_str(&text)?;
    tracing::info!(
        path = %path.display(),
        nodes = template.len(),
        "Loaded workflow template",
    );
    Ok(template)
}

/// List workflow documents (`*.json`) in a template library directory.
///
/// Non-recursive, sorted by file name. A missing directory yields an
/// empty list.
pub fn list_template_files(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(TEMPLATE_EXTENSION));
        if path.is_file() && is_json {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Discover every user-editable scalar input, in template order.
pub fn extract_editable_fields(template: &JobTemplate) -> Vec<EditableField> {
    let mut fields = Vec::new();

    for node in template.nodes() {
        if node.is_blacklisted() {
            continue;
        }

        let node_title = node.resolved_title();
        let (group, display_title) = split_title(node_title);

        for (field_name, raw) in &node.inputs {
            let InputValue::Scalar(default) = InputValue::classify(raw) else {
                continue;
            };
            fields.push(EditableField {
                node_id: node.id.clone(),
                node_title: node_title.to_string(),
                group: group.clone(),
                display_title: display_title.clone(),
                field_name: field_name.clone(),
                kind: infer_field_kind(field_name, &default),
                default,
            });
        }
    }

    fields
}

/// Score every node that could serve as the input or output endpoint.
///
/// Input: class type contains `loadimage` or title contains `load image`.
/// Output: class type contains `save`, `export` or `preview` (score 1);
/// Trellis mesh exporters score 2.
pub fn endpoint_candidates(template: &JobTemplate) -> Vec<EndpointCandidate> {
    let mut candidates = Vec::new();

    for node in template.nodes() {
        let class_type = node.class_type.to_lowercase();
        let title = node.title.as_deref().unwrap_or_default().to_lowercase();

        if class_type.contains("loadimage") || title.contains("load image") {
            candidates.push(EndpointCandidate {
                node_id: node.id.clone(),
                role: EndpointRole::Input,
                score: 1,
            });
        }

        if class_type.contains("save") || class_type.contains("export") || class_type.contains("preview")
        {
            let score = if class_type.contains("trellis") && class_type.contains("export") {
                2
            } else {
                1
            };
            candidates.push(EndpointCandidate {
                node_id: node.id.clone(),
                role: EndpointRole::Output,
                score,
            });
        }
    }

    candidates
}

/// Guess the input and output nodes.
///
/// The highest score wins; among equal scores the last node in template
/// order wins. `None` means the caller must pick manually.
pub fn infer_endpoints(template: &JobTemplate) -> EndpointGuess {
    let candidates = endpoint_candidates(template);
    let pick = |role: EndpointRole| {
        candidates
            .iter()
            .filter(|c| c.role == role)
            // max_by_key returns the last maximum, which is the tie-break.
            .max_by_key(|c| c.score)
            .map(|c| c.node_id.clone())
    };

    EndpointGuess {
        input: pick(EndpointRole::Input),
        output: pick(EndpointRole::Output),
    }
}

/// Selection entries for every node, in template order.
pub fn node_choices(template: &JobTemplate) -> Vec<NodeChoice> {
    template
        .nodes()
        .iter()
        .map(|node| NodeChoice {
            node_id: node.id.clone(),
            label: format!(
                "{}: {} ({})",
                node.id,
                node.resolved_title(),
                node.class_type
            ),
        })
        .collect()
}

/// Group editable fields by node, then by title-encoded group name.
///
/// Nodes keep their first-seen order inside each group.
pub fn group_fields(fields: &[EditableField]) -> FieldGroups {
    let mut out = FieldGroups::default();

    for field in fields {
        let bucket = if field.group.is_empty() {
            &mut out.ungrouped
        } else {
            out.groups.entry(field.group.clone()).or_default()
        };

        match bucket.iter_mut().find(|n| n.node_id == field.node_id) {
            Some(node) => node.fields.push(field.clone()),
            None => bucket.push(NodeFields {
                node_id: field.node_id.clone(),
                display_title: field.display_title.clone(),
                fields: vec![field.clone()],
            }),
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
