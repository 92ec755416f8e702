//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 有预置回复时按顺序返回；预置用完后交替输出：先调用 echo 回显任务，再给出 final_answer。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置回复，按顺序消费
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .responses
            .lock()
            .map_err(|e| LlmError::Request(e.to_string()))?
            .pop_front();
        if let Some(reply) = scripted {
            return Ok(reply);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let preview: String = last_user.chars().take(80).collect();

        let reply = if n % 2 == 0 {
            serde_json::json!({"tool": "echo", "args": {"text": format!("Echo from Mock: {preview}")}})
        } else {
            serde_json::json!({"final_answer": "Mock run finished"})
        };
        Ok(reply.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_then_alternating() {
        let mock = MockLlmClient::with_responses(["first"]);
        let msgs = [Message::user("hello")];
        assert_eq!(mock.complete(&msgs).await.unwrap(), "first");
        let second = mock.complete(&msgs).await.unwrap();
        assert!(second.contains("final_answer"));
        let third = mock.complete(&msgs).await.unwrap();
        assert!(third.contains("\"echo\""));
        assert_eq!(mock.calls(), 3);
    }
}
