//! Turning a finished stage tree into a report document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureCause, ReportResult};
use crate::ids::sanitize_name;
use crate::stage::{
    Attachment, PropertyKey, PropertyValue, StageId, StageKind, StageNode, StageStatus, StageTree,
};

/// Exports a stage tree to some report format
pub trait ReportSerializer: Send + Sync {
    /// File name (relative to the report root) for the root stage's report
    fn file_name(&self, root: &StageNode) -> String;

    fn serialize(&self, tree: &StageTree) -> ReportResult<Vec<u8>>;
}

/// Version of the JSON document layout
pub const FORMAT_VERSION: u32 = 1;

/// Top-level JSON report document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub format_version: u32,
    pub host: String,
    pub generated_at: DateTime<Utc>,
    pub test: StageRecord,
}

/// Owned, nested snapshot of one stage and its subtree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: String,
    pub execution_id: String,
    pub kind: StageKind,
    pub title: String,
    pub display_title: String,
    pub status: StageStatus,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<PropertyKey, PropertyValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<StageRecord>,
}

impl StageRecord {
    /// Snapshot the subtree rooted at `id`
    pub fn from_tree(tree: &StageTree, id: StageId) -> Self {
        let node = tree.node(id);
        let collect = |ids: &[StageId]| -> Vec<StageRecord> {
            ids.iter().map(|child| StageRecord::from_tree(tree, *child)).collect()
        };
        Self {
            id: node.id().to_string(),
            execution_id: node.execution_id().to_string(),
            kind: node.kind(),
            title: node.title().to_string(),
            display_title: node.display_title().to_string(),
            status: node.status(),
            start: node.start_time(),
            stop: node.end_time(),
            duration_ms: (node.end_time() - node.start_time()).num_milliseconds(),
            failure: node.failure_cause().cloned(),
            properties: node.properties().clone(),
            parameters: node.parameters().clone(),
            attachments: node.attachments().to_vec(),
            before: collect(node.before_children()),
            steps: collect(node.test_children()),
            after: collect(node.after_children()),
        }
    }

    /// Depth-first pre-order walk yielding each record with its depth
    pub fn walk(&self) -> Vec<(usize, &StageRecord)> {
        let mut out = Vec::new();
        let mut pending = vec![(0, self)];
        while let Some((depth, record)) = pending.pop() {
            out.push((depth, record));
            let children: Vec<&StageRecord> = record
                .before
                .iter()
                .chain(&record.steps)
                .chain(&record.after)
                .collect();
            for child in children.into_iter().rev() {
                pending.push((depth + 1, child));
            }
        }
        out
    }
}

/// Writes [`ReportDocument`]s as JSON
#[derive(Debug, Clone)]
pub struct JsonSerializer {
    pub pretty: bool,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self { pretty: true }
    }

    pub fn compact() -> Self {
        Self { pretty: false }
    }

    pub fn document(&self, tree: &StageTree) -> ReportDocument {
        ReportDocument {
            format_version: FORMAT_VERSION,
            host: host_name(),
            generated_at: Utc::now(),
            test: StageRecord::from_tree(tree, tree.root_id()),
        }
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSerializer for JsonSerializer {
    fn file_name(&self, root: &StageNode) -> String {
        format!("{}-result.json", sanitize_name(root.id()))
    }

    fn serialize(&self, tree: &StageTree) -> ReportResult<Vec<u8>> {
        let document = self.document(tree);
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(&document)?
        } else {
            serde_json::to_vec(&document)?
        };
        Ok(bytes)
    }
}

fn host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    fn sample_tree() -> StageTree {
        let storage = MemoryStorage::new();
        let mut tree = StageTree::new("checkout", Some("CASE-7".to_string()));
        tree.root_mut().set_property(PropertyKey::Severity, "critical");
        let before = tree.open(StageKind::Before, "launch", None).unwrap();
        tree.node_mut(before).pass(&storage).unwrap();
        tree.close(before).unwrap();
        let step = tree.open(StageKind::Step, "pay", None).unwrap();
        tree.node_mut(step).set_parameter("card", "visa");
        tree.node_mut(step).attach(Attachment::new(
            "receipt",
            "screenshots/receipt.png",
            "image/png",
            true,
        ));
        tree.node_mut(step).fail(FailureCause::new("declined")).unwrap();
        tree.close(step).unwrap();
        tree.propagate_failure(&FailureCause::new("declined"), |_| {}).unwrap();
        tree
    }

    #[test]
    fn test_record_mirrors_tree() {
        let tree = sample_tree();
        let record = StageRecord::from_tree(&tree, tree.root_id());

        assert_eq!(record.id, "CASE-7");
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(record.before.len(), 1);
        assert_eq!(record.before[0].status, StageStatus::Passed);
        assert_eq!(record.steps[0].parameters.get("card").map(String::as_str), Some("visa"));
        assert_eq!(record.steps[0].failure.as_ref().unwrap().message, "declined");
        assert!(record.after.is_empty());

        let titles: Vec<(usize, &str)> = record
            .walk()
            .into_iter()
            .map(|(depth, r)| (depth, r.title.as_str()))
            .collect();
        assert_eq!(titles, vec![(0, "checkout"), (1, "launch"), (1, "pay")]);
    }

    #[test]
    fn test_json_document_reads_back() {
        let tree = sample_tree();
        let serializer = JsonSerializer::compact();
        let bytes = serializer.serialize(&tree).unwrap();
        let document: ReportDocument = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(document.format_version, FORMAT_VERSION);
        assert_eq!(document.test, StageRecord::from_tree(&tree, tree.root_id()));

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["test"]["properties"]["severity"], "critical");
        assert_eq!(value["test"]["steps"][0]["status"], "failed");
        assert!(value["test"].get("after").is_none());
    }

    #[test]
    fn test_file_name_uses_sanitized_id() {
        let tree = StageTree::new("t", Some("suite/CASE 7".to_string()));
        assert_eq!(
            JsonSerializer::new().file_name(tree.root()),
            "suite_CASE_7-result.json"
        );
    }
}
