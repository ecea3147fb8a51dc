//! ComfyUI history records.
//!
//! `GET /history/{prompt_id}` returns `{}` while the prompt is queued or
//! running, and `{"<prompt_id>": {...}}` once it has finished. This
//! module deserializes the finished record and extracts the final output
//! images from it.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

/// Image folder type of final results. Previews are saved as `"temp"`.
pub const OUTPUT_FOLDER_TYPE: &str = "output";

/// Status string ComfyUI reports for a failed execution.
const STATUS_ERROR: &str = "error";

/// Status message name carrying the exception details.
const EXECUTION_ERROR_MESSAGE: &str = "execution_error";

/// Full response body of the history endpoint, keyed by prompt ID.
pub type HistoryResponse = HashMap<String, HistoryRecord>;

/// History of one finished prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryRecord {
    /// Outputs per node ID.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    /// Execution status; missing on older servers.
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
}

/// Output produced by a single node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageDescriptor>,
}

/// Reference to an image stored on the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageDescriptor {
    /// Server-side filename; may contain `\` or `/` separators.
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Folder type: `"output"`, `"temp"`, `"input"`.
    #[serde(rename = "type")]
    pub folder_type: String,
}

/// The `status` block of a history record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
    /// `[name, data]` pairs, e.g. `["execution_error", {...}]`.
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

impl ImageDescriptor {
    pub fn is_output(&self) -> bool {
        self.folder_type == OUTPUT_FOLDER_TYPE
    }
}

impl ExecutionStatus {
    pub fn is_error(&self) -> bool {
        self.status_str.as_deref() == Some(STATUS_ERROR)
    }

    /// The `exception_message` of the first `execution_error` message.
    pub fn error_message(&self) -> Option<String> {
        self.messages.iter().find_map(|message| {
            let pair = message.as_array()?;
            if pair.first()?.as_str()? != EXECUTION_ERROR_MESSAGE {
                return None;
            }
            let data = pair.get(1)?;
            let text = data.get("exception_message")?.as_str()?;
            match data.get("node_id").and_then(|v| v.as_str()) {
                Some(node_id) => Some(format!("node {node_id}: {text}")),
                None => Some(text.to_string()),
            }
        })
    }
}

impl HistoryRecord {
    /// Whether the server reported the execution as failed.
    pub fn is_failed(&self) -> bool {
        self.status.as_ref().is_some_and(ExecutionStatus::is_error)
    }

    /// Whether the server explicitly reported the execution as still
    /// incomplete (and not failed).
    pub fn is_incomplete(&self) -> bool {
        !self.is_failed()
            && self
                .status
                .as_ref()
                .is_some_and(|status| status.completed == Some(false))
    }
}

/// Collect the final images of a record, per node.
///
/// Only descriptors of type `"output"` are kept; nodes left with no
/// images (e.g. preview nodes that only write `"temp"` files) are
/// dropped.
pub fn output_images(record: &HistoryRecord) -> BTreeMap<String, Vec<ImageDescriptor>> {
    record
        .outputs
        .iter()
        .filter_map(|(node_id, output)| {
            let images: Vec<ImageDescriptor> = output
                .images
                .iter()
                .filter(|image| image.is_output())
                .cloned()
                .collect();
            (!images.is_empty()).then(|| (node_id.clone(), images))
        })
        .collect()
}
