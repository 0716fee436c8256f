//! Bounded conversation history sent as context with every reply request.
//!
//! [`ConversationHistory`] always starts with exactly one system turn (the
//! persona prompt) followed by at most `max_turns` user/assistant turns.
//! Appending past the cap evicts the oldest non-system turns first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ConversationTurn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in the dialogue.  Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    role: Role,
    text: String,
    created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// ---------------------------------------------------------------------------
// ConversationHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("system turns cannot be appended; the system prompt is fixed at construction")]
    SystemTurnRejected,
}

/// System prompt plus a FIFO window of user/assistant turns.
///
/// # Example
/// ```rust
/// use voice_turn::llm::{ConversationHistory, ConversationTurn};
///
/// let mut history = ConversationHistory::new("You are Solomon.", 2);
/// history.append(ConversationTurn::user("hello")).unwrap();
/// history.append(ConversationTurn::assistant("peace be with you")).unwrap();
/// history.append(ConversationTurn::user("thanks")).unwrap();
///
/// let context = history.as_context();
/// assert_eq!(context.len(), 3);
/// assert_eq!(context[1].text(), "peace be with you");
/// ```
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    system: ConversationTurn,
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationHistory {
    /// Create a history holding `system_prompt` and up to `max_turns`
    /// non-system turns.
    pub fn new(system_prompt: impl Into<String>, max_turns: usize) -> Self {
        Self {
            system: ConversationTurn::system(system_prompt),
            turns: VecDeque::with_capacity(max_turns + 1),
            max_turns,
        }
    }

    /// Append a user or assistant turn, evicting the oldest turns beyond
    /// the cap.
    pub fn append(&mut self, turn: ConversationTurn) -> Result<(), HistoryError> {
        if turn.role() == Role::System {
            return Err(HistoryError::SystemTurnRejected);
        }

        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
        Ok(())
    }

    /// Ordered context: the system turn first, then oldest to newest.
    pub fn as_context(&self) -> Vec<ConversationTurn> {
        std::iter::once(&self.system)
            .chain(self.turns.iter())
            .cloned()
            .collect()
    }

    /// Context with `pending` appended, without committing it.
    ///
    /// Used to ask for a reply before the user turn is known to be kept.
    pub fn context_with(&self, pending: &ConversationTurn) -> Vec<ConversationTurn> {
        let mut context = self.as_context();
        context.push(pending.clone());
        context
    }

    /// Drop every non-system turn.
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn system_prompt(&self) -> &str {
        self.system.text()
    }

    /// Number of non-system turns.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
