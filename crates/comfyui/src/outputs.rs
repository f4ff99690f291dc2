//! Output discovery in ComfyUI execution history.
//!
//! A history record carries an `outputs` object keyed by node id. Output
//! nodes publish lists of file references under well-known keys:
//! `images` for image nodes, `gifs` (VideoHelperSuite) or `videos` for
//! video nodes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of artifact an output node produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Video,
    Image,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Video => f.write_str("video"),
            OutputKind::Image => f.write_str("image"),
        }
    }
}

/// Location of one file in a ComfyUI store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Store the file lives in (`output`, `input` or `temp`).
    #[serde(rename = "type", default = "default_store")]
    pub store: String,
}

fn default_store() -> String {
    "output".to_string()
}

/// History keys recognised per output kind, in priority order.
const OUTPUT_KEYS: &[(&str, OutputKind)] = &[
    ("gifs", OutputKind::Video),
    ("videos", OutputKind::Video),
    ("images", OutputKind::Image),
];

/// Collect the first output reference of each kind from a history record.
///
/// Nodes are scanned in node-id order. An empty map is a valid result;
/// callers decide whether a missing kind is an error.
pub fn extract_outputs(history: &serde_json::Value) -> BTreeMap<OutputKind, OutputRef> {
    let mut found = BTreeMap::new();

    let Some(nodes) = history.get("outputs").and_then(|o| o.as_object()) else {
        tracing::warn!("History record has no outputs object");
        return found;
    };

    for (node_id, node_output) in nodes {
        for (key, kind) in OUTPUT_KEYS {
            if found.contains_key(kind) {
                continue;
            }
            let Some(entries) = node_output.get(*key).and_then(|v| v.as_array()) else {
                continue;
            };
            let first = entries
                .iter()
                .find_map(|entry| serde_json::from_value::<OutputRef>(entry.clone()).ok());
            if let Some(output) = first {
                tracing::debug!(
                    node_id = %node_id,
                    kind = %kind,
                    filename = %output.filename,
                    "Found output",
                );
                found.insert(*kind, output);
            }
        }
    }

    if found.is_empty() {
        tracing::warn!("No outputs found in history");
    }

    found
}
