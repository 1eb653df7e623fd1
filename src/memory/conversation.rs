//! 短期记忆：LLM 消息与问答历史
//!
//! 历史以「问题 + 回答」为一轮保存，只保留最近 N 轮；生成管道时按原顺序折叠进 Prompt，
//! 用于解析「上面那个部门」「那家供应商」这类指代。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 一轮历史问答（请求体 conversation_history 的元素）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    #[serde(default)]
    pub answer: String,
}

impl ConversationTurn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// 最近 N 轮问答；超出时丢弃最旧的一轮
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// 按时间顺序（旧 → 新）返回快照
    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// 服务端按 conversation_id 保存的会话历史（HTTP 入口共享）
#[derive(Clone, Debug)]
pub struct ConversationStore {
    sessions: Arc<Mutex<HashMap<String, ConversationMemory>>>,
    max_turns: usize,
}

impl ConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            max_turns,
        }
    }

    pub fn history(&self, conversation_id: &str) -> Vec<ConversationTurn> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(conversation_id).map(ConversationMemory::turns))
            .unwrap_or_default()
    }

    pub fn record(&self, conversation_id: &str, turn: ConversationTurn) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions
                .entry(conversation_id.to_string())
                .or_insert_with(|| ConversationMemory::new(self.max_turns))
                .push(turn);
        }
    }

    /// 清空一个会话；未指定时清空全部。返回被清空的会话数
    pub fn reset(&self, conversation_id: Option<&str>) -> usize {
        let Ok(mut sessions) = self.sessions.lock() else {
            return 0;
        };
        match conversation_id {
            Some(id) => usize::from(sessions.remove(id).is_some()),
            None => {
                let n = sessions.len();
                sessions.clear();
                n
            }
        }
    }
}

/// 取 history 末尾的最多 max_turns 轮，保持原顺序
pub fn recent_window(history: &[ConversationTurn], max_turns: usize) -> Vec<ConversationTurn> {
    let skip = history.len().saturating_sub(max_turns);
    history[skip..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_keeps_most_recent_turns() {
        let mut memory = ConversationMemory::new(2);
        memory.push(ConversationTurn::new("q1", "a1"));
        memory.push(ConversationTurn::new("q2", "a2"));
        memory.push(ConversationTurn::new("q3", "a3"));

        let turns = memory.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].question, "q2");
        assert_eq!(turns[1].question, "q3");
    }

    #[test]
    fn test_store_keeps_sessions_apart_and_resets() {
        let store = ConversationStore::new(2);
        store.record("a", ConversationTurn::new("q1", "a1"));
        store.record("a", ConversationTurn::new("q2", "a2"));
        store.record("a", ConversationTurn::new("q3", "a3"));
        store.record("b", ConversationTurn::new("other", "x"));

        let a = store.history("a");
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].question, "q2");
        assert_eq!(store.history("b").len(), 1);
        assert!(store.history("missing").is_empty());

        assert_eq!(store.reset(Some("a")), 1);
        assert!(store.history("a").is_empty());
        assert_eq!(store.reset(Some("a")), 0);
        assert_eq!(store.reset(None), 1);
        assert!(store.history("b").is_empty());
    }

    #[test]
    fn test_recent_window_preserves_order() {
        let history = vec![
            ConversationTurn::new("q1", "a1"),
            ConversationTurn::new("q2", "a2"),
            ConversationTurn::new("q3", "a3"),
        ];
        let window = recent_window(&history, 2);
        assert_eq!(window, history[1..].to_vec());
        assert_eq!(recent_window(&history, 10).len(), 3);
        assert!(recent_window(&history, 0).is_empty());
    }
}
