//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按脚本依次返回预设结果，并记录每次收到的消息与请求选项，便于断言「第二次生成是否带上了上次的错误」。
//! 脚本耗尽后进入离线模式：生成请求返回计数管道，其余请求报错（总结器会降级为模板回答）。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, RequestOptions};
use crate::memory::Message;
use crate::pipeline::prompts::PIPELINE_TASK_MARKER;

/// 离线模式下对生成请求的固定回复
const OFFLINE_PIPELINE: &str = r#"[{"$count": "count"}]"#;

/// Mock 客户端：脚本回复 + 调用记录
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    options: Mutex<Vec<RequestOptions>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定结果
    pub fn scripted<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 已收到的全部请求（每次调用的完整消息列表）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 每次调用携带的请求选项，与 calls() 一一对应
    pub fn options(&self) -> Vec<RequestOptions> {
        self.options.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn offline_reply(messages: &[Message]) -> Result<String, LlmError> {
        if messages.iter().any(|m| m.content.contains(PIPELINE_TASK_MARKER)) {
            Ok(OFFLINE_PIPELINE.to_string())
        } else {
            Err(LlmError::Api("mock client has no scripted reply".to_string()))
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], options: &RequestOptions) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        if let Ok(mut recorded) = self.options.lock() {
            recorded.push(*options);
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(reply) => reply,
            None => Self::offline_reply(messages),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
