//! ComfyUI workflow documents (API format).
//!
//! A workflow is a JSON object keyed by node ID. Each node may carry an
//! `inputs` object and a `_meta` object with a human-readable `title`;
//! everything else (`class_type`, legacy top-level `title`, ...) is kept
//! verbatim so the document round-trips back to the server unchanged.
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "steps": 20 },
//!     "_meta": { "title": "KSampler" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Input field holding the filename of a server-side input image.
pub const IMAGE_INPUT: &str = "image";

/// Top-level node field used by older workflow exports for the title.
const LEGACY_TITLE_FIELD: &str = "title";

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Metadata attached to a node under the `_meta` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Kept as raw JSON; a non-string title reads as no title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single node definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Map<String, Value>>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMeta>,
    /// Every other field of the node, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a node's title is read from when matching parameter labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TitleSource {
    /// `_meta.title`, written by current ComfyUI API exports.
    #[default]
    Meta,
    /// The node's own top-level `title` field.
    Legacy,
}

/// A parsed workflow document: node ID -> node definition.
///
/// Node IDs are unique; [`Deserialize`] rejects a document that repeats
/// one instead of silently keeping the last definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Workflow {
    nodes: BTreeMap<String, WorkflowNode>,
}

// ---------------------------------------------------------------------------
// Node accessors
// ---------------------------------------------------------------------------

impl WorkflowNode {
    /// Look up an input value by field name.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.as_ref().and_then(|inputs| inputs.get(name))
    }

    /// Overwrite (or insert) an input value, creating the `inputs`
    /// object if the node has none.
    pub fn set_input(&mut self, name: &str, value: Value) {
        self.inputs
            .get_or_insert_with(Map::new)
            .insert(name.to_string(), value);
    }

    /// The node title from the requested source, if present and a string.
    pub fn title(&self, source: TitleSource) -> Option<&str> {
        match source {
            TitleSource::Meta => self
                .meta
                .as_ref()
                .and_then(|m| m.title.as_ref())
                .and_then(Value::as_str),
            TitleSource::Legacy => self.extra.get(LEGACY_TITLE_FIELD).and_then(Value::as_str),
        }
    }

    /// The `inputs.image` filename when it is a plain string (not a link
    /// to another node's output).
    pub fn image_input(&self) -> Option<&str> {
        self.input(IMAGE_INPUT).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

impl Workflow {
    /// Read and parse a workflow document from disk.
    pub fn from_path(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Parse a workflow document from a JSON string.
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let workflow: Workflow = serde_json::from_str(text)?;
        if workflow.nodes.is_empty() {
            return Err(CoreError::Validation(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }
        Ok(workflow)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    /// Iterate nodes in node-ID order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &WorkflowNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&str, &mut WorkflowNode)> {
        self.nodes.iter_mut().map(|(id, node)| (id.as_str(), node))
    }

    /// Distinct input image filenames referenced by `inputs.image`, in
    /// node-ID order of first appearance.
    pub fn input_images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = Vec::new();
        for (_, node) in self.nodes() {
            if let Some(filename) = node.image_input() {
                if !images.contains(&filename) {
                    images.push(filename);
                }
            }
        }
        images
    }

    /// Serialize back into a JSON value for submission.
    pub fn to_value(&self) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl<'de> Deserialize<'de> for Workflow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct WorkflowVisitor;

        impl<'de> Visitor<'de> for WorkflowVisitor {
            type Value = Workflow;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping node IDs to node definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Workflow, A::Error> {
                let mut nodes = BTreeMap::new();
                while let Some((id, node)) = map.next_entry::<String, WorkflowNode>()? {
                    if nodes.contains_key(&id) {
                        return Err(de::Error::custom(format!("duplicate node id '{id}'")));
                    }
                    nodes.insert(id, node);
                }
                Ok(Workflow { nodes })
            }
        }

        deserializer.deserialize_map(WorkflowVisitor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    const SAMPLE: &str = r#"{
        "3": {
            "class_type": "KSampler",
            "inputs": { "seed": 42, "model": ["4", 0] },
            "_meta": { "title": "KSampler" }
        },
        "10": {
            "class_type": "LoadImage",
            "inputs": { "image": "face.png", "upload": "image" }
        },
        "12": { "class_type": "PrimitiveNode", "title": "PromptTokenInput" }
    }"#;

    #[test]
    fn parses_optional_fields() {
        let wf = Workflow::from_json_str(SAMPLE).unwrap();
        assert_eq!(wf.len(), 3);

        let sampler = wf.node("3").unwrap();
        assert_eq!(sampler.title(TitleSource::Meta), Some("KSampler"));
        assert_eq!(sampler.input("seed"), Some(&json!(42)));

        let legacy = wf.node("12").unwrap();
        assert!(legacy.inputs.is_none());
        assert!(legacy.meta.is_none());
        assert_eq!(legacy.title(TitleSource::Legacy), Some("PromptTokenInput"));
        assert_eq!(legacy.title(TitleSource::Meta), None);
    }

    #[test]
    fn non_string_title_reads_as_untitled() {
        let text = r#"{
            "1": {"inputs": {"value": 0}, "_meta": {"title": 7}},
            "2": {"inputs": {"value": 0}, "_meta": {"title": {"text": "x"}}, "title": ["x"]}
        }"#;
        let wf = Workflow::from_json_str(text).unwrap();

        assert_eq!(wf.node("1").unwrap().title(TitleSource::Meta), None);
        assert_eq!(wf.node("2").unwrap().title(TitleSource::Meta), None);
        assert_eq!(wf.node("2").unwrap().title(TitleSource::Legacy), None);
        assert_eq!(wf.to_value().unwrap(), serde_json::from_str::<Value>(text).unwrap());
    }

    #[test]
    fn round_trips_unknown_fields() {
        let wf = Workflow::from_json_str(SAMPLE).unwrap();
        let original: Value = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(wf.to_value().unwrap(), original);
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let text = r#"{"1": {"inputs": {}}, "1": {"inputs": {"seed": 1}}}"#;
        let err = Workflow::from_json_str(text).unwrap_err();
        assert_matches!(err, CoreError::Json(_));
        assert!(err.to_string().contains("duplicate node id '1'"));
    }

    #[test]
    fn rejects_non_object_documents() {
        assert_matches!(Workflow::from_json_str("[1, 2]"), Err(CoreError::Json(_)));
        assert_matches!(
            Workflow::from_json_str(r#"{"1": "not a node"}"#),
            Err(CoreError::Json(_))
        );
    }

    #[test]
    fn rejects_empty_workflow() {
        assert_matches!(Workflow::from_json_str("{}"), Err(CoreError::Validation(_)));
    }

    #[test]
    fn input_images_skips_links_and_duplicates() {
        let text = r#"{
            "1": {"inputs": {"image": "a.png"}},
            "2": {"inputs": {"image": ["1", 0]}},
            "3": {"inputs": {"image": "a.png"}},
            "4": {"inputs": {"image": "b.png"}}
        }"#;
        let wf = Workflow::from_json_str(text).unwrap();
        assert_eq!(wf.input_images(), vec!["a.png", "b.png"]);
    }

    #[test]
    fn set_input_creates_inputs_object() {
        let mut node = WorkflowNode::default();
        node.set_input("value", json!("x"));
        assert_eq!(node.input("value"), Some(&json!("x")));
    }

    #[test]
    fn from_path_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = Workflow::from_path(&missing).unwrap_err();
        assert_matches!(err, CoreError::Io { ref path, .. } if path == &missing);
    }
}
