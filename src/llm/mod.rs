//! Reply generation and the dialogue context it is given.
//!
//! * [`ConversationHistory`] / [`ConversationTurn`]: bounded, ordered context.
//! * [`ResponseGenerator`]: async trait implemented by reply backends.
//! * [`ChatCompletionResponder`]: OpenAI-compatible chat-completions backend.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use voice_turn::config::AppConfig;
//! use voice_turn::llm::{ChatCompletionResponder, ConversationHistory, ConversationTurn, ResponseGenerator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AppConfig::default();
//!     let responder = ChatCompletionResponder::from_config(&config.openai, &config.persona);
//!     let mut history = ConversationHistory::new(&config.persona.system_prompt, 10);
//!
//!     let question = ConversationTurn::user("I feel anxious about tomorrow.");
//!     let reply = responder.complete(&history.context_with(&question)).await.unwrap();
//!
//!     history.append(question).unwrap();
//!     history.append(ConversationTurn::assistant(&reply)).unwrap();
//!     println!("{reply}");
//! }
//! ```

pub mod history;
pub mod responder;

pub use history::{ConversationHistory, ConversationTurn, HistoryError, Role};
pub use responder::{ChatCompletionResponder, GenerationError, ResponseGenerator};

#[cfg(test)]
pub use responder::MockResponder;
