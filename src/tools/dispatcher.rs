//! 工具分发器
//!
//! execute(ctx, tool_name, args)：查找 -> 参数校验 -> 带超时与取消执行 -> 统一成 ToolOutcome。
//! 处理函数的任何结局（成功、返回错误、panic、超时、取消）都被归一化，调用方永远拿到一个结果，不会拿到异常。
//! 每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{FailureKind, ToolOutcome};
use crate::tools::schema::validate_args;
use crate::tools::{ToolContext, ToolRegistry};

/// 单次分发的上下文：所属执行、迭代序号、取消令牌、可选超时覆盖
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub execution_id: String,
    pub iteration_index: usize,
    pub cancel: CancellationToken,
    /// 覆盖工具默认超时（超时重试时加长）
    pub timeout: Option<Duration>,
}

impl DispatchContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            execution_id: String::new(),
            iteration_index: 0,
            cancel,
            timeout: None,
        }
    }

    pub fn for_iteration(mut self, execution_id: impl Into<String>, iteration_index: usize) -> Self {
        self.execution_id = execution_id.into();
        self.iteration_index = iteration_index;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 工具分发器：持有只读注册表、默认超时与按工具的超时配置
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    default_timeout: Duration,
    tool_timeouts: HashMap<String, Duration>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
            tool_timeouts: HashMap::new(),
        }
    }

    pub fn with_tool_timeout(mut self, tool_name: impl Into<String>, timeout: Duration) -> Self {
        self.tool_timeouts.insert(tool_name.into(), timeout);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 某工具的基础超时（未被重试策略覆盖时使用）
    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        self.tool_timeouts
            .get(tool_name)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// 执行一次工具调用；永远返回 ToolOutcome
    pub async fn execute(&self, ctx: DispatchContext, tool_name: &str, args: Value) -> ToolOutcome {
        let start = Instant::now();
        let preview = args_preview(&args);
        let outcome = self.dispatch(ctx, tool_name, args).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": outcome.is_success(),
            "outcome": outcome.kind_str(),
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        outcome
    }

    async fn dispatch(&self, ctx: DispatchContext, tool_name: &str, args: Value) -> ToolOutcome {
        let tool = match self.registry.resolve(tool_name) {
            Ok(tool) => tool,
            Err(e) => return ToolOutcome::failure(FailureKind::ToolNotFound, e.to_string()),
        };

        if let Err(errors) = validate_args(&tool.parameters_schema(), &args) {
            return ToolOutcome::failure(FailureKind::InvalidArguments, errors.join("; "));
        }
        let args: Map<String, Value> = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        if ctx.cancel.is_cancelled() {
            return ToolOutcome::failure(FailureKind::Cancelled, "execution cancelled before tool call");
        }

        let timeout = ctx.timeout.unwrap_or_else(|| self.timeout_for(tool_name));
        let call_token = ctx.cancel.child_token();
        let tool_ctx = ToolContext {
            execution_id: ctx.execution_id.clone(),
            iteration_index: ctx.iteration_index,
            cancel: call_token.clone(),
            deadline: tokio::time::Instant::now() + timeout,
        };

        let mut handle = tokio::spawn(async move { tool.invoke(tool_ctx, args).await });

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                call_token.cancel();
                handle.abort();
                ToolOutcome::failure(FailureKind::Cancelled, format!("{tool_name} cancelled"))
            }
            joined = tokio::time::timeout(timeout, &mut handle) => match joined {
                Ok(Ok(Ok(value))) => ToolOutcome::success(value),
                Ok(Ok(Err(message))) => ToolOutcome::failure(FailureKind::ExecutionError, message),
                Ok(Err(join_err)) => ToolOutcome::failure(
                    FailureKind::ExecutionError,
                    format!("{tool_name} handler crashed: {join_err}"),
                ),
                Err(_) => {
                    call_token.cancel();
                    handle.abort();
                    ToolOutcome::failure(
                        FailureKind::Timeout,
                        format!("{tool_name} timed out after {}ms", timeout.as_millis()),
                    )
                }
            },
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher_with(calls: Arc<AtomicUsize>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        let counter = calls.clone();
        registry
            .register_fn(
                "add",
                "add two numbers",
                json!({
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"]
                }),
                move |_ctx, args| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
                        let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
                        Ok(json!(a + b))
                    }
                },
            )
            .unwrap();
        registry
            .register_fn("fail", "always fails", json!({"type": "object"}), |_ctx, _args| async {
                Err("boom".to_string())
            })
            .unwrap();
        registry
            .register_fn("panic", "panics", json!({"type": "object"}), |_ctx, args| async move {
                if args.is_empty() {
                    panic!("handler exploded");
                }
                Ok(Value::Null)
            })
            .unwrap();
        registry
            .register_fn("slow", "sleeps", json!({"type": "object"}), |ctx, _args| async move {
                tokio::select! {
                    _ = ctx.cancelled() => Err("interrupted".to_string()),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!("late")),
                }
            })
            .unwrap();
        ToolDispatcher::new(Arc::new(registry), Duration::from_secs(5))
            .with_tool_timeout("slow", Duration::from_millis(50))
    }

    fn ctx() -> DispatchContext {
        DispatchContext::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_success() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let outcome = d.execute(ctx(), "add", json!({"a": 1, "b": 2})).await;
        assert_eq!(outcome, ToolOutcome::success(json!(3.0)));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let outcome = d.execute(ctx(), "ghost", json!({})).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::ToolNotFound));
    }

    #[tokio::test]
    async fn test_invalid_args_never_invoke_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(calls.clone());
        let outcome = d.execute(ctx(), "add", json!({"a": "one"})).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::InvalidArguments));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let outcome = d.execute(ctx(), "fail", json!({})).await;
        assert_eq!(outcome, ToolOutcome::failure(FailureKind::ExecutionError, "boom"));
        let outcome = d.execute(ctx(), "panic", json!({})).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::ExecutionError));
    }

    #[tokio::test]
    async fn test_timeout_and_override() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let outcome = d.execute(ctx(), "slow", json!({})).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));

        let outcome = d
            .execute(ctx().with_timeout(Duration::from_millis(20)), "slow", json!({}))
            .await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let outcome = d
            .execute(
                DispatchContext::new(token).with_timeout(Duration::from_secs(5)),
                "slow",
                json!({}),
            )
            .await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Cancelled));
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        assert!(args_preview(&long).chars().count() <= 203);
    }
}
