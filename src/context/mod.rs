//! Conversation context
//!
//! Per-session turn window plus the host-owned registry that hands out one
//! serialized session per id.

pub mod registry;
pub mod store;

pub use registry::{LastResolution, Session, SessionRegistry};
pub use store::{detect_actions, ActiveContext, ConversationContext, ConversationTurn};
