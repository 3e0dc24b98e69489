//! A single reportable unit of test work and its lifecycle rules.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::tree::StageId;
use crate::error::{FailureCause, ReportError, ReportResult};
use crate::ids;
use crate::storage::Storage;

/// What kind of work a stage represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Test,
    Step,
    Scenario,
    Before,
    After,
}

/// What the orchestrator is allowed to do with a stage of a given kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_attach: bool,
    pub can_screenshot: bool,
    pub can_nest: bool,
}

impl StageKind {
    /// Capability set for this kind.
    ///
    /// Scenarios only group steps: they hold attachments handed to them
    /// explicitly but never receive screenshots resolved from the stack.
    pub fn capabilities(self) -> Capabilities {
        match self {
            StageKind::Test | StageKind::Step | StageKind::Before | StageKind::After => {
                Capabilities {
                    can_attach: true,
                    can_screenshot: true,
                    can_nest: true,
                }
            }
            StageKind::Scenario => Capabilities {
                can_attach: true,
                can_screenshot: false,
                can_nest: true,
            },
        }
    }

    /// Which child list of the parent a stage of this kind is filed under
    pub fn child_list(self) -> ChildList {
        match self {
            StageKind::Before => ChildList::Before,
            StageKind::After => ChildList::After,
            StageKind::Test | StageKind::Step | StageKind::Scenario => ChildList::Test,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Test => "test",
            StageKind::Step => "step",
            StageKind::Scenario => "scenario",
            StageKind::Before => "before",
            StageKind::After => "after",
        };
        f.write_str(name)
    }
}

/// Setup, body and teardown children are kept apart so reports can tell them apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildList {
    Before,
    Test,
    After,
}

/// Execution status. Everything except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Passed,
    Failed,
    Skipped,
    Ignored,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StageStatus::Running)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageStatus::Running => "running",
            StageStatus::Passed => "passed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Ignored => "ignored",
        };
        f.write_str(name)
    }
}

/// Keys for open-ended stage metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKey {
    /// Overrides the title shown in reports
    DisplayTitle,
    /// Overrides the stage id (e.g. a test-management case id)
    ExternalId,
    Description,
    Severity,
    Owner,
    Links,
    Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Text(String),
    List(Vec<String>),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        PropertyValue::List(value)
    }
}

/// A captured artifact referenced from a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub description: String,
    /// Path relative to the report root
    pub relative_path: PathBuf,
    pub mime_type: String,
    /// Whether the artifact survives a passing stage
    pub keep_on_success: bool,
}

impl Attachment {
    pub fn new(
        description: impl Into<String>,
        relative_path: impl Into<PathBuf>,
        mime_type: impl Into<String>,
        keep_on_success: bool,
    ) -> Self {
        Self {
            description: description.into(),
            relative_path: relative_path.into(),
            mime_type: mime_type.into(),
            keep_on_success,
        }
    }
}

/// One stage of the report tree.
///
/// Children are referenced by [`StageId`] and live in the owning
/// [`StageTree`](super::StageTree).
#[derive(Debug, Clone)]
pub struct StageNode {
    execution_id: String,
    external_id: Option<String>,
    kind: StageKind,
    title: String,
    status: StageStatus,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    failure_cause: Option<FailureCause>,
    properties: BTreeMap<PropertyKey, PropertyValue>,
    parameters: BTreeMap<String, String>,
    attachments: Vec<Attachment>,
    before_children: Vec<StageId>,
    test_children: Vec<StageId>,
    after_children: Vec<StageId>,
}

impl StageNode {
    /// Create a running stage. An explicit `id` outlives [`reset`](Self::reset_local).
    pub fn new(kind: StageKind, title: impl Into<String>, id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: ids::next_execution_id(),
            external_id: id,
            kind,
            title: title.into(),
            status: StageStatus::Running,
            start_time: now,
            end_time: now,
            failure_cause: None,
            properties: BTreeMap::new(),
            parameters: BTreeMap::new(),
            attachments: Vec::new(),
            before_children: Vec::new(),
            test_children: Vec::new(),
            after_children: Vec::new(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// The `ExternalId` property when set, then the id given at creation,
    /// otherwise the execution id
    pub fn id(&self) -> &str {
        match self.properties.get(&PropertyKey::ExternalId) {
            Some(PropertyValue::Text(id)) => id,
            _ => self.external_id.as_deref().unwrap_or(&self.execution_id),
        }
    }

    /// Display title override when one was set, otherwise the title
    pub fn display_title(&self) -> &str {
        match self.properties.get(&PropertyKey::DisplayTitle) {
            Some(PropertyValue::Text(title)) => title,
            _ => &self.title,
        }
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn failure_cause(&self) -> Option<&FailureCause> {
        self.failure_cause.as_ref()
    }

    pub fn properties(&self) -> &BTreeMap<PropertyKey, PropertyValue> {
        &self.properties
    }

    pub fn property(&self, key: PropertyKey) -> Option<&PropertyValue> {
        self.properties.get(&key)
    }

    pub fn set_property(&mut self, key: PropertyKey, value: impl Into<PropertyValue>) {
        self.properties.insert(key, value.into());
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(name.into(), value.into());
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn attach(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    /// Remove an attachment from the list. Storage is left untouched.
    pub fn detach(&mut self, attachment: &Attachment) -> bool {
        match self.attachments.iter().position(|a| a == attachment) {
            Some(index) => {
                self.attachments.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn children(&self, list: ChildList) -> &[StageId] {
        match list {
            ChildList::Before => &self.before_children,
            ChildList::Test => &self.test_children,
            ChildList::After => &self.after_children,
        }
    }

    pub fn before_children(&self) -> &[StageId] {
        &self.before_children
    }

    pub fn test_children(&self) -> &[StageId] {
        &self.test_children
    }

    pub fn after_children(&self) -> &[StageId] {
        &self.after_children
    }

    /// All children, setup first, then body, then teardown
    pub fn all_children(&self) -> impl Iterator<Item = StageId> + '_ {
        self.before_children
            .iter()
            .chain(&self.test_children)
            .chain(&self.after_children)
            .copied()
    }

    pub(crate) fn push_child(&mut self, list: ChildList, child: StageId) {
        match list {
            ChildList::Before => self.before_children.push(child),
            ChildList::Test => self.test_children.push(child),
            ChildList::After => self.after_children.push(child),
        }
    }

    /// Mark passed and drop every attachment not kept on success.
    pub fn pass(&mut self, storage: &dyn Storage) -> ReportResult<()> {
        self.finish(StageStatus::Passed)?;
        self.prune_attachments(storage);
        Ok(())
    }

    /// Mark failed. Attachments are kept as failure evidence.
    pub fn fail(&mut self, cause: FailureCause) -> ReportResult<()> {
        self.finish(StageStatus::Failed)?;
        self.failure_cause = Some(cause);
        Ok(())
    }

    pub fn skip(&mut self) -> ReportResult<()> {
        self.finish(StageStatus::Skipped)
    }

    pub fn ignore(&mut self) -> ReportResult<()> {
        self.finish(StageStatus::Ignored)
    }

    fn finish(&mut self, status: StageStatus) -> ReportResult<()> {
        if self.status.is_terminal() {
            return Err(ReportError::InvalidState {
                stage: self.title.clone(),
                status: self.status,
            });
        }
        self.status = status;
        self.end_time = Utc::now();
        debug!(stage = %self.title, kind = %self.kind, %status, "stage finished");
        Ok(())
    }

    fn prune_attachments(&mut self, storage: &dyn Storage) {
        self.attachments.retain(|attachment| {
            if attachment.keep_on_success {
                return true;
            }
            delete_attachment(storage, &attachment.relative_path);
            false
        });
    }

    /// Clear this node back to a fresh running state, deleting its own
    /// attachments. Children must already have been reset by the caller.
    pub(crate) fn reset_local(&mut self, storage: &dyn Storage) {
        for attachment in self.attachments.drain(..) {
            delete_attachment(storage, &attachment.relative_path);
        }
        self.before_children.clear();
        self.test_children.clear();
        self.after_children.clear();
        self.properties.clear();
        self.parameters.clear();
        self.status = StageStatus::Running;
        let now = Utc::now();
        self.start_time = now;
        self.end_time = now;
        self.failure_cause = None;
    }
}

fn delete_attachment(storage: &dyn Storage, path: &Path) {
    if !storage.delete(path) {
        warn!(path = %path.display(), "attachment could not be deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    fn attachment(name: &str, keep: bool) -> Attachment {
        Attachment::new(name, format!("screenshots/{}.png", name), "image/png", keep)
    }

    #[test]
    fn test_new_stage_is_running() {
        let node = StageNode::new(StageKind::Step, "Open settings", None);
        assert_eq!(node.status(), StageStatus::Running);
        assert_eq!(node.start_time(), node.end_time());
        assert_eq!(node.id(), node.execution_id());
        assert!(node.failure_cause().is_none());
    }

    #[test]
    fn test_explicit_id_and_display_title() {
        let mut node = StageNode::new(StageKind::Test, "login", Some("CASE-12".to_string()));
        assert_eq!(node.id(), "CASE-12");
        assert_eq!(node.display_title(), "login");
        node.set_property(PropertyKey::DisplayTitle, "Login with valid password");
        assert_eq!(node.display_title(), "Login with valid password");
        node.set_property(PropertyKey::ExternalId, "JIRA-7");
        assert_eq!(node.id(), "JIRA-7");
    }

    #[test]
    fn test_reset_keeps_creation_id_and_drops_override() {
        let storage = MemoryStorage::new();
        let mut node = StageNode::new(StageKind::Test, "login", Some("CASE-12".to_string()));
        node.set_property(PropertyKey::ExternalId, "JIRA-7");
        node.fail(FailureCause::new("boom")).unwrap();

        node.reset_local(&storage);

        assert_eq!(node.id(), "CASE-12");
        assert!(node.properties().is_empty());
    }

    #[test]
    fn test_second_transition_is_rejected() {
        let storage = MemoryStorage::new();
        let mut node = StageNode::new(StageKind::Step, "tap", None);
        node.pass(&storage).unwrap();
        let end = node.end_time();

        let err = node.fail(FailureCause::new("late")).unwrap_err();
        assert!(matches!(
            err,
            ReportError::InvalidState { status: StageStatus::Passed, .. }
        ));
        assert!(node.skip().is_err());
        assert!(node.ignore().is_err());
        assert!(node.pass(&storage).is_err());
        assert_eq!(node.end_time(), end);
        assert_eq!(node.status(), StageStatus::Passed);
        assert!(node.failure_cause().is_none());
    }

    #[test]
    fn test_pass_prunes_attachments_not_kept() {
        let storage = MemoryStorage::new();
        let a = attachment("a", false);
        let b = attachment("b", true);
        storage.insert(&a.relative_path, b"a".to_vec());
        storage.insert(&b.relative_path, b"b".to_vec());

        let mut node = StageNode::new(StageKind::Step, "step", None);
        node.attach(a.clone());
        node.attach(b.clone());
        node.pass(&storage).unwrap();

        assert_eq!(node.attachments(), &[b.clone()]);
        assert_eq!(storage.deleted(), vec![a.relative_path.clone()]);
        assert!(storage.contains(&b.relative_path));
    }

    #[test]
    fn test_fail_skip_ignore_never_prune() {
        let storage = MemoryStorage::new();
        let a = attachment("a", false);
        let b = attachment("b", true);

        let mut failed = StageNode::new(StageKind::Step, "failed", None);
        failed.attach(a.clone());
        failed.attach(b.clone());
        failed.fail(FailureCause::new("boom")).unwrap();
        assert_eq!(failed.attachments(), &[a.clone(), b.clone()]);
        assert_eq!(failed.failure_cause().unwrap().message, "boom");

        let mut skipped = StageNode::new(StageKind::Step, "skipped", None);
        skipped.attach(a.clone());
        skipped.skip().unwrap();
        assert_eq!(skipped.attachments().len(), 1);

        let mut ignored = StageNode::new(StageKind::Test, "ignored", None);
        ignored.attach(a);
        ignored.ignore().unwrap();
        assert_eq!(ignored.attachments().len(), 1);

        assert!(storage.deleted().is_empty());
    }

    #[test]
    fn test_detach_removes_only_matching() {
        let mut node = StageNode::new(StageKind::Step, "step", None);
        let a = attachment("a", false);
        node.attach(a.clone());
        assert!(node.detach(&a));
        assert!(!node.detach(&a));
        assert!(node.attachments().is_empty());
    }

    #[test]
    fn test_capabilities_per_kind() {
        assert!(StageKind::Step.capabilities().can_screenshot);
        assert!(!StageKind::Scenario.capabilities().can_screenshot);
        assert!(StageKind::Scenario.capabilities().can_nest);
        assert_eq!(StageKind::Before.child_list(), ChildList::Before);
        assert_eq!(StageKind::After.child_list(), ChildList::After);
        assert_eq!(StageKind::Scenario.child_list(), ChildList::Test);
    }
}
