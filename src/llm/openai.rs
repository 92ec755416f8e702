//! OpenAI 兼容 chat-completion 客户端（async-openai）
//!
//! base_url 可配置，DeepSeek、OpenAI 或自建代理都走这一个实现；DeepSeek 预设见 [`OpenAiClient::deepseek`]。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// 累计 token 计数
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl TokenUsage {
    pub fn record(&self, prompt: u64, completion: u64) {
        self.prompt.fetch_add(prompt, Ordering::Relaxed);
        self.completion.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn totals(&self) -> (u64, u64, u64) {
        let prompt = self.prompt.load(Ordering::Relaxed);
        let completion = self.completion.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
    request_timeout: Duration,
    usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 为空时读取 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            usage: TokenUsage::default(),
        }
    }

    /// DeepSeek：DEEPSEEK_API_KEY 优先，模型取参数、DEEPSEEK_MODEL 或 deepseek-chat
    pub fn deepseek(model: Option<&str>) -> Self {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        let model = model
            .map(String::from)
            .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
            .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
        Self::new(Some(DEEPSEEK_BASE_URL), &model, api_key.as_deref())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// 决策输出需要稳定时可调低
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn to_request_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    messages
        .iter()
        .map(|m| -> Result<ChatCompletionRequestMessage, OpenAIError> {
            let content = m.content.clone();
            Ok(match m.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
            })
        })
        .collect()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request_err = |e: OpenAIError| LlmError::Request(e.to_string());
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(to_request_messages(messages).map_err(request_err)?);
        if let Some(temperature) = self.temperature {
            args.temperature(temperature);
        }
        let request = args.build().map_err(request_err)?;

        let started = Instant::now();
        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout(self.request_timeout.as_secs()))?
            .map_err(request_err)?;

        if let Some(usage) = &response.usage {
            self.usage
                .record(u64::from(usage.prompt_tokens), u64::from(usage.completion_tokens));
        }
        tracing::debug!(
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat completion finished"
        );

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.totals()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_totals() {
        let usage = TokenUsage::default();
        usage.record(10, 5);
        usage.record(1, 1);
        assert_eq!(usage.totals(), (11, 6, 17));
    }

    #[test]
    fn test_request_messages_keep_roles() {
        let converted = to_request_messages(&[
            Message::system("s"),
            Message::user("u"),
            Message::assistant("a"),
        ])
        .unwrap();
        assert_eq!(converted.len(), 3);
        assert!(matches!(converted[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(converted[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(converted[2], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn test_client_options() {
        let client = OpenAiClient::new(Some("http://localhost:1"), "test-model", Some("sk-test"))
            .with_temperature(0.2)
            .with_request_timeout(Duration::from_secs(5));
        assert_eq!(client.model(), "test-model");
        assert_eq!(client.temperature, Some(0.2));
        assert_eq!(client.token_usage(), (0, 0, 0));
    }
}
