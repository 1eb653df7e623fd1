//! 记忆层：LLM 消息与问答历史窗口

pub mod conversation;

pub use conversation::{
    recent_window, ConversationMemory, ConversationStore, ConversationTurn, Message, Role,
};
