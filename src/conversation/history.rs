//! Bounded conversation history

use std::collections::VecDeque;

use crate::chat::ConversationTurn;

/// The most recent turns of a conversation
///
/// Oldest turns are dropped once the limit is reached. Requests receive a
/// copy, so the history is never touched by an in-flight request.
#[derive(Debug, Clone)]
pub struct History {
    turns: VecDeque<ConversationTurn>,
    limit: usize,
}

impl History {
    /// Create a history keeping at most `limit` turns
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    /// Append a turn, evicting the oldest beyond the limit
    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        self.trim();
    }

    /// Change the limit, evicting immediately if it shrank
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.trim();
    }

    /// Copy of the turns, oldest first
    #[must_use]
    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    fn trim(&mut self) {
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_most_recent_turns() {
        let mut history = History::new(3);
        for i in 0..5 {
            history.push(ConversationTurn::user(format!("turn {i}")));
        }

        let texts: Vec<_> = history.turns().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4"]);
    }

    #[test]
    fn shrinking_the_limit_evicts() {
        let mut history = History::new(10);
        history.push(ConversationTurn::user("a"));
        history.push(ConversationTurn::assistant("b"));
        history.set_limit(1);
        assert_eq!(history.len(), 1);
        assert_eq!(history.turns()[0].text, "b");
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let mut history = History::new(0);
        history.push(ConversationTurn::user("a"));
        assert!(history.is_empty());
    }
}
