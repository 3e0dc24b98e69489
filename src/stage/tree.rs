//! Arena holding a test's stage tree together with its active-stage stack.

use tracing::{debug, info};

use super::node::{StageKind, StageNode, StageStatus};
use super::stack::ActiveStageStack;
use crate::error::{FailureCause, ReportError, ReportResult};
use crate::storage::Storage;

/// Index of a stage inside its [`StageTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub(crate) usize);

impl StageId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A root Test stage, its descendants, and the stack of open stages.
///
/// The root is created running and pushed onto the stack. Children are
/// filed under whichever stage is on top of the stack when they open.
#[derive(Debug, Clone)]
pub struct StageTree {
    nodes: Vec<StageNode>,
    stack: ActiveStageStack,
}

const ROOT: StageId = StageId(0);

impl StageTree {
    pub fn new(title: impl Into<String>, id: Option<String>) -> Self {
        let mut stack = ActiveStageStack::new();
        stack.push(ROOT);
        Self {
            nodes: vec![StageNode::new(StageKind::Test, title, id)],
            stack,
        }
    }

    pub fn root_id(&self) -> StageId {
        ROOT
    }

    pub fn root(&self) -> &StageNode {
        &self.nodes[ROOT.0]
    }

    pub fn root_mut(&mut self) -> &mut StageNode {
        &mut self.nodes[ROOT.0]
    }

    pub fn get(&self, id: StageId) -> Option<&StageNode> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: StageId) -> Option<&mut StageNode> {
        self.nodes.get_mut(id.0)
    }

    /// Node by id. Ids only come from this tree, so a miss is a caller bug.
    pub fn node(&self, id: StageId) -> &StageNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: StageId) -> &mut StageNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stack(&self) -> &ActiveStageStack {
        &self.stack
    }

    /// Innermost open stage
    pub fn current(&self) -> Option<StageId> {
        self.stack.top()
    }

    /// Innermost open stage that accepts screenshots
    pub fn screenshot_target(&self) -> Option<StageId> {
        self.stack
            .iter_from_top()
            .find(|id| self.node(*id).kind().capabilities().can_screenshot)
    }

    /// Innermost open stage that accepts attachments
    pub fn attach_target(&self) -> Option<StageId> {
        self.stack
            .iter_from_top()
            .find(|id| self.node(*id).kind().capabilities().can_attach)
    }

    /// Create a stage under the current one and push it onto the stack.
    pub fn open(
        &mut self,
        kind: StageKind,
        title: impl Into<String>,
        id: Option<String>,
    ) -> ReportResult<StageId> {
        let parent = self.current().ok_or(ReportError::NoActiveStage)?;
        let parent_kind = self.node(parent).kind();
        if !parent_kind.capabilities().can_nest {
            return Err(ReportError::NestingNotAllowed { kind: parent_kind });
        }

        let child = StageId(self.nodes.len());
        self.nodes.push(StageNode::new(kind, title, id));
        self.nodes[parent.0].push_child(kind.child_list(), child);
        self.stack.push(child);
        debug!(stage = %self.node(child).title(), %kind, depth = self.stack.len(), "stage opened");
        Ok(child)
    }

    /// Pop `id` off the stack. It must be the innermost open stage.
    pub fn close(&mut self, id: StageId) -> ReportResult<()> {
        match self.stack.top() {
            Some(top) if top == id => {
                self.stack.pop();
                Ok(())
            }
            Some(top) => Err(ReportError::UnbalancedStack {
                closing: self.node(id).title().to_string(),
                top: self.node(top).title().to_string(),
            }),
            None => Err(ReportError::NoActiveStage),
        }
    }

    /// Fail every open stage after an error escaped the whole test body.
    ///
    /// Pops the stack until empty, failing each popped stage that is still
    /// running with `cause`, then fails the root if it is still running.
    /// `on_failed` sees each stage this call failed, innermost first.
    pub fn propagate_failure(
        &mut self,
        cause: &FailureCause,
        mut on_failed: impl FnMut(&StageNode),
    ) -> ReportResult<()> {
        while let Some(id) = self.stack.pop() {
            let node = &mut self.nodes[id.0];
            if node.status() == StageStatus::Running {
                node.fail(cause.clone())?;
                on_failed(node);
            }
        }
        let root = &mut self.nodes[ROOT.0];
        if root.status() == StageStatus::Running {
            root.fail(cause.clone())?;
            on_failed(root);
        }
        info!(test = %self.root().title(), cause = %cause, "failure propagated to open stages");
        Ok(())
    }

    /// Pop whatever is still open without touching statuses.
    pub(crate) fn unwind_stack(&mut self) {
        while self.stack.pop().is_some() {}
    }

    /// Reset the whole tree for another execution of the same logical test.
    ///
    /// Every stage is reset depth-first, deleting attachments from storage.
    /// Afterwards only the (running) root remains and it is back on the stack.
    pub fn reset(&mut self, storage: &dyn Storage) {
        self.reset_subtree(ROOT, storage);
        self.nodes.truncate(1);
        self.stack.clear();
        self.stack.push(ROOT);
    }

    fn reset_subtree(&mut self, id: StageId, storage: &dyn Storage) {
        let children: Vec<StageId> = self.node(id).all_children().collect();
        for child in children {
            self.reset_subtree(child, storage);
        }
        self.nodes[id.0].reset_local(storage);
    }

    /// Depth-first pre-order walk yielding each stage with its depth
    pub fn walk(&self) -> Vec<(usize, StageId)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut pending = vec![(0, ROOT)];
        while let Some((depth, id)) = pending.pop() {
            out.push((depth, id));
            let children: Vec<StageId> = self.node(id).all_children().collect();
            for child in children.into_iter().rev() {
                pending.push((depth + 1, child));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Attachment, ChildList};
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_children_land_in_matching_lists() {
        let mut tree = StageTree::new("login", None);
        let before = tree.open(StageKind::Before, "launch app", None).unwrap();
        tree.close(before).unwrap();
        let step = tree.open(StageKind::Step, "type password", None).unwrap();
        tree.close(step).unwrap();
        let after = tree.open(StageKind::After, "clear data", None).unwrap();
        tree.close(after).unwrap();

        let root = tree.root();
        assert_eq!(root.children(ChildList::Before), &[before]);
        assert_eq!(root.children(ChildList::Test), &[step]);
        assert_eq!(root.children(ChildList::After), &[after]);
        assert_eq!(tree.current(), Some(tree.root_id()));
    }

    #[test]
    fn test_nested_stage_attaches_to_top_of_stack() {
        let mut tree = StageTree::new("test", None);
        let scenario = tree.open(StageKind::Scenario, "log in", None).unwrap();
        let step = tree.open(StageKind::Step, "enter name", None).unwrap();

        assert_eq!(tree.node(scenario).test_children(), &[step]);
        assert!(tree.root().test_children() == [scenario]);
        assert_eq!(tree.screenshot_target(), Some(step));

        tree.close(step).unwrap();
        // scenario cannot take screenshots, so the root receives them
        assert_eq!(tree.screenshot_target(), Some(tree.root_id()));
        assert_eq!(tree.attach_target(), Some(scenario));
    }

    #[test]
    fn test_close_out_of_order_is_rejected() {
        let mut tree = StageTree::new("test", None);
        let outer = tree.open(StageKind::Step, "outer", None).unwrap();
        let _inner = tree.open(StageKind::Step, "inner", None).unwrap();
        assert!(matches!(
            tree.close(outer),
            Err(ReportError::UnbalancedStack { .. })
        ));
    }

    #[test]
    fn test_propagate_failure_fails_every_open_stage() {
        let mut tree = StageTree::new("root", None);
        let child = tree.open(StageKind::Step, "child", None).unwrap();
        let grandchild = tree.open(StageKind::Step, "grandchild", None).unwrap();
        let cause = FailureCause::new("E");

        let mut notified = Vec::new();
        tree.propagate_failure(&cause, |node| notified.push(node.title().to_string()))
            .unwrap();

        for id in [tree.root_id(), child, grandchild] {
            assert_eq!(tree.node(id).status(), StageStatus::Failed);
            assert_eq!(tree.node(id).failure_cause(), Some(&cause));
        }
        assert!(tree.stack().is_empty());
        assert_eq!(notified, vec!["grandchild", "child", "root"]);
    }

    #[test]
    fn test_propagate_failure_skips_finished_stages() {
        let storage = MemoryStorage::new();
        let mut tree = StageTree::new("root", None);
        let done = tree.open(StageKind::Step, "done", None).unwrap();
        tree.node_mut(done).pass(&storage).unwrap();
        tree.close(done).unwrap();

        tree.propagate_failure(&FailureCause::new("late"), |_| {}).unwrap();
        assert_eq!(tree.node(done).status(), StageStatus::Passed);
        assert_eq!(tree.root().status(), StageStatus::Failed);
    }

    #[test]
    fn test_reset_clears_everything() {
        let storage = MemoryStorage::new();
        let mut tree = StageTree::new("root", Some("CASE-1".to_string()));
        let step = tree.open(StageKind::Step, "step", None).unwrap();
        tree.node_mut(step)
            .attach(Attachment::new("shot", "screenshots/step.png", "image/png", true));
        tree.root_mut().set_parameter("user", "alice");
        tree.root_mut()
            .attach(Attachment::new("video", "video/root.mp4", "video/mp4", true));
        tree.propagate_failure(&FailureCause::new("boom"), |_| {}).unwrap();

        tree.reset(&storage);

        let root = tree.root();
        assert_eq!(root.status(), StageStatus::Running);
        assert_eq!(root.id(), "CASE-1");
        assert!(root.before_children().is_empty());
        assert!(root.test_children().is_empty());
        assert!(root.after_children().is_empty());
        assert!(root.attachments().is_empty());
        assert!(root.properties().is_empty());
        assert!(root.parameters().is_empty());
        assert!(root.failure_cause().is_none());
        assert_eq!(root.start_time(), root.end_time());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.stack().history(), &[tree.root_id()]);
        // child attachments are deleted before the root's own
        assert_eq!(
            storage.deleted(),
            vec![
                std::path::PathBuf::from("screenshots/step.png"),
                std::path::PathBuf::from("video/root.mp4"),
            ]
        );
    }

    #[test]
    fn test_walk_is_preorder() {
        let mut tree = StageTree::new("root", None);
        let a = tree.open(StageKind::Step, "a", None).unwrap();
        let a1 = tree.open(StageKind::Step, "a1", None).unwrap();
        tree.close(a1).unwrap();
        tree.close(a).unwrap();
        let b = tree.open(StageKind::After, "b", None).unwrap();
        tree.close(b).unwrap();

        let walked: Vec<(usize, &str)> = tree
            .walk()
            .into_iter()
            .map(|(depth, id)| (depth, tree.node(id).title()))
            .collect();
        assert_eq!(walked, vec![(0, "root"), (1, "a"), (2, "a1"), (1, "b")]);
    }
}
