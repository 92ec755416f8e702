//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / invoke），启动时显式注册到 ToolRegistry，
//! 之后只读，可被多个执行循环并发查找。名称唯一，重复注册返回 DuplicateTool。

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::EngineError;
use crate::tools::schema::check_schema;

/// 传给工具处理函数的调用上下文：取消令牌与截止时间
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub execution_id: String,
    pub iteration_index: usize,
    /// 执行被取消或调用超时后触发
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl ToolContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// 工具 trait：名称、描述（供推理端理解）、参数 JSON Schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（Decision::ToolCall 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供推理端理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认接受任意对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；args 已通过 schema 校验。返回结构化结果，引擎不解释其内容
    async fn invoke(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, String>;
}

/// 工具定义（拼进 DecisionContext 供推理端选择）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 闭包工具：用 register_fn 注册，适合嵌入方的轻量工具与测试
pub struct FnTool<F, Fut> {
    name: String,
    description: String,
    schema: Value,
    handler: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnTool<F, Fut>
where
    F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F, Fut>
where
    F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn invoke(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, String> {
        (self.handler)(ctx, args).await
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；名称重复返回 DuplicateTool，schema 不是对象 schema 返回 InvalidSchema
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), EngineError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), EngineError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(EngineError::DuplicateTool(name));
        }
        check_schema(&tool.parameters_schema()).map_err(|reason| EngineError::InvalidSchema {
            tool: name.clone(),
            reason,
        })?;
        tracing::debug!(tool = %name, "tool registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// 以闭包注册工具
    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register(FnTool::new(name, description, schema, handler))
    }

    /// 按名查找；不存在返回 ToolNotFound
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, EngineError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ToolNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 工具定义列表（按名称排序，保证提示内容稳定）
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .iter()
            .map(|(name, tool)| ToolDefinition {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 工具定义 JSON（CLI 展示用）
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.list_definitions()).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn("noop", "does nothing", json!({"type": "object"}), |_ctx, _args| async {
                Ok(Value::Null)
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = noop_registry();
        let err = registry
            .register_fn("noop", "again", json!({"type": "object"}), |_ctx, _args| async {
                Ok(Value::Null)
            })
            .unwrap_err();
        assert_eq!(err, EngineError::DuplicateTool("noop".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_missing() {
        let registry = noop_registry();
        assert!(registry.resolve("noop").is_ok());
        assert!(matches!(
            registry.resolve("ghost"),
            Err(EngineError::ToolNotFound(name)) if name == "ghost"
        ));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let mut registry = ToolRegistry::new();
        let err = registry
            .register_fn("bad", "bad schema", json!("string"), |_ctx, _args| async {
                Ok(Value::Null)
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchema { .. }));
    }

    #[test]
    fn test_definitions_sorted() {
        let mut registry = noop_registry();
        registry
            .register_fn("alpha", "first", json!({"type": "object"}), |_ctx, _args| async {
                Ok(Value::Null)
            })
            .unwrap();
        let names: Vec<_> = registry
            .list_definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha", "noop"]);
        assert!(registry.to_schema_json().contains("does nothing"));
    }
}
