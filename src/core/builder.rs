//! 编排器构建器：统一的引擎初始化逻辑
//!
//! 嵌入方用 OrchestratorBuilder 手动组装（注册表、推理端、存储、阶段判定）；
//! CLI 用 build_from_config 从 AppConfig 组装内置工具、LLM 推理端与存储后端。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::orchestrator::{Engine, EngineConfig, Orchestrator};
use crate::core::supervisor::ExecutionSupervisor;
use crate::core::{AnySuccess, EngineError, EventBus, PhaseEvaluator, PlanManager};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::reasoning::{LlmReasoningClient, ReasoningClient};
use crate::store::{ExecutionStore, InMemoryExecutionStore};
use crate::tools::{EchoTool, HttpGetTool, ShellTool, ToolDispatcher, ToolRegistry};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// 编排器构建器
pub struct OrchestratorBuilder {
    registry: ToolRegistry,
    reasoning: Option<Arc<dyn ReasoningClient>>,
    store: Option<Arc<dyn ExecutionStore>>,
    evaluator: Arc<dyn PhaseEvaluator>,
    config: EngineConfig,
    default_tool_timeout: Duration,
    tool_timeouts: HashMap<String, Duration>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            registry: ToolRegistry::new(),
            reasoning: None,
            store: None,
            evaluator: Arc::new(AnySuccess),
            config: EngineConfig::default(),
            default_tool_timeout: DEFAULT_TOOL_TIMEOUT,
            tool_timeouts: HashMap::new(),
        }
    }

    /// 工具注册表（build 之后只读）
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_reasoning(mut self, reasoning: Arc<dyn ReasoningClient>) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    /// 默认内存存储
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 默认 AnySuccess（任意成功推进阶段）
    pub fn with_evaluator(mut self, evaluator: impl PhaseEvaluator + 'static) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_default_tool_timeout(mut self, timeout: Duration) -> Self {
        self.default_tool_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, tool_name: impl Into<String>, timeout: Duration) -> Self {
        self.tool_timeouts.insert(tool_name.into(), timeout);
        self
    }

    pub fn build(self) -> Result<Orchestrator, EngineError> {
        let reasoning = self
            .reasoning
            .ok_or_else(|| EngineError::Config("reasoning client not set".to_string()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryExecutionStore::new()));

        let tool_definitions = self.registry.list_definitions();
        let mut dispatcher = ToolDispatcher::new(Arc::new(self.registry), self.default_tool_timeout);
        for (name, timeout) in self.tool_timeouts {
            dispatcher = dispatcher.with_tool_timeout(name, timeout);
        }
        tracing::info!(
            tools = tool_definitions.len(),
            max_iterations = self.config.max_iterations,
            "orchestrator built"
        );

        Ok(Orchestrator::from_engine(Engine {
            dispatcher,
            reasoning,
            store,
            evaluator: self.evaluator,
            plans: PlanManager::new(),
            events: EventBus::new(self.config.event_buffer),
            supervisor: ExecutionSupervisor::new(),
            tool_definitions,
            config: self.config,
        }))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 内置工具注册表：echo、shell（白名单）、http_get（域名白名单）
pub fn build_tool_registry(cfg: &AppConfig) -> Result<ToolRegistry, EngineError> {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool)?;
    tools.register(ShellTool::new(cfg.tools.shell.allowed_commands.clone()))?;
    tools.register(HttpGetTool::new(
        cfg.tools.http.allowed_domains.clone(),
        cfg.tools.http.timeout_secs,
        cfg.tools.http.max_result_chars,
    ))?;
    Ok(tools)
}

/// 按 [llm] 配置创建客户端；缺少 API Key 时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.llm.request_timeout_secs);
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();

    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        "deepseek" if has_deepseek_key || has_openai_key => {
            let client = OpenAiClient::deepseek(cfg.llm.model.as_deref()).with_request_timeout(timeout);
            tracing::info!("Using DeepSeek LLM ({})", client.model());
            Arc::new(client)
        }
        "openai" if has_openai_key => {
            let model = cfg.llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            tracing::info!("Using OpenAI LLM ({})", model);
            Arc::new(
                OpenAiClient::new(cfg.llm.base_url.as_deref(), &model, None)
                    .with_request_timeout(timeout),
            )
        }
        other => {
            tracing::warn!(provider = %other, "No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 按 [store] 配置创建存储后端
pub async fn create_store_from_config(
    cfg: &AppConfig,
) -> Result<Arc<dyn ExecutionStore>, EngineError> {
    match cfg.store.backend.to_lowercase().as_str() {
        #[cfg(feature = "async-sqlite")]
        "sqlite" => {
            let store = crate::store::SqliteExecutionStore::open(&cfg.store.sqlite_path).await?;
            tracing::info!(path = %cfg.store.sqlite_path.display(), "Using SQLite execution store");
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(InMemoryExecutionStore::new())),
        other => {
            tracing::warn!(backend = %other, "Store backend unavailable, using in-memory store");
            Ok(Arc::new(InMemoryExecutionStore::new()))
        }
    }
}

/// 从配置组装完整编排器（内置工具 + LLM 推理端 + 配置的存储）
pub async fn build_from_config(cfg: &AppConfig) -> Result<Orchestrator, EngineError> {
    let registry = build_tool_registry(cfg)?;
    let reasoning = Arc::new(LlmReasoningClient::new(create_llm_from_config(cfg)));
    let store = create_store_from_config(cfg).await?;

    let mut builder = OrchestratorBuilder::new()
        .with_registry(registry)
        .with_reasoning(reasoning)
        .with_store(store)
        .with_engine_config(EngineConfig::from(&cfg.engine))
        .with_default_tool_timeout(Duration::from_secs(cfg.tools.tool_timeout_secs));
    for (name, secs) in &cfg.tools.timeouts {
        builder = builder.with_tool_timeout(name.clone(), Duration::from_secs(*secs));
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_reasoning() {
        let err = OrchestratorBuilder::new().build().err();
        assert!(matches!(err, Some(EngineError::Config(_))));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = build_tool_registry(&AppConfig::default()).unwrap();
        assert_eq!(registry.tool_names(), vec!["echo", "http_get", "shell"]);
    }

    #[tokio::test]
    async fn test_build_from_config_with_mock_llm() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        let orchestrator = build_from_config(&cfg).await.unwrap();
        assert_eq!(orchestrator.tool_definitions().len(), 3);
    }
}
