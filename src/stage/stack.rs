//! LIFO record of stages that are currently mid-execution.

use super::tree::StageId;

/// Stages currently open, innermost last, plus everything ever pushed.
#[derive(Debug, Clone, Default)]
pub struct ActiveStageStack {
    active: Vec<StageId>,
    history: Vec<StageId>,
}

impl ActiveStageStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: StageId) {
        self.active.push(id);
        self.history.push(id);
    }

    pub fn pop(&mut self) -> Option<StageId> {
        self.active.pop()
    }

    /// Innermost open stage
    pub fn top(&self) -> Option<StageId> {
        self.active.last().copied()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Open stages from innermost to outermost
    pub fn iter_from_top(&self) -> impl Iterator<Item = StageId> + '_ {
        self.active.iter().rev().copied()
    }

    /// Every stage pushed since the last clear, in push order
    pub fn history(&self) -> &[StageId] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_with_history() {
        let mut stack = ActiveStageStack::new();
        stack.push(StageId(0));
        stack.push(StageId(1));
        assert_eq!(stack.pop(), Some(StageId(1)));
        stack.push(StageId(2));

        assert_eq!(stack.top(), Some(StageId(2)));
        assert_eq!(stack.iter_from_top().collect::<Vec<_>>(), vec![StageId(2), StageId(0)]);
        assert_eq!(stack.history(), &[StageId(0), StageId(1), StageId(2)]);

        stack.clear();
        assert!(stack.is_empty());
        assert!(stack.history().is_empty());
        assert_eq!(stack.pop(), None);
    }
}
