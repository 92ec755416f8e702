//! 基于 LLM 的推理端
//!
//! 把 DecisionContext 拼成 system + user 两条消息发给 LlmClient，再把回复解析为 Decision。
//! 回复格式（JSON，可包在 ```json 代码块中）：
//! - `{"tool": "name", "args": {...}}` 调用工具
//! - `{"final_answer": ...}` 结束任务
//! - `{"ask_user": "question"}` 询问用户
//! - `{"plan": ["阶段一", {"title": "阶段二", "success_criteria": [...]}]}` 替换剩余计划
//!
//! 不含 JSON 的纯文本视为最终答案。

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Decision, PhaseDraft, PhaseStatus};
use crate::llm::{LlmClient, LlmError, Message};
use crate::reasoning::{DecisionContext, ReasoningClient, ReasoningError};

const DEFAULT_SYSTEM_PROMPT: &str = "你是一个任务执行代理。每一轮你只能输出一个 JSON 对象，选择以下之一：\n\
调用工具 {\"tool\": \"<name>\", \"args\": {...}}；\n\
给出最终结果 {\"final_answer\": <result>}；\n\
需要用户补充信息 {\"ask_user\": \"<question>\"}；\n\
重新规划剩余阶段 {\"plan\": [\"<phase title>\", ...]}。\n\
只能调用下方列出的工具，参数必须符合其 JSON Schema。";

/// 计划条目：纯标题或带成功标准的对象
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
enum PlanEntry {
    Title(String),
    Draft {
        title: String,
        #[serde(default)]
        success_criteria: Vec<String>,
    },
}

impl From<PlanEntry> for PhaseDraft {
    fn from(entry: PlanEntry) -> Self {
        match entry {
            PlanEntry::Title(title) => PhaseDraft::new(title),
            PlanEntry::Draft {
                title,
                success_criteria,
            } => PhaseDraft::new(title).with_criteria(success_criteria),
        }
    }
}

/// LLM 回复格式（同时用于生成提示中的 schema）
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
struct ReplyFormat {
    /// 要调用的工具名
    #[serde(default)]
    tool: Option<String>,
    /// 工具参数
    #[serde(default)]
    args: Option<Value>,
    /// 最终结果
    #[serde(default)]
    final_answer: Option<Value>,
    /// 向用户提出的问题
    #[serde(default)]
    ask_user: Option<String>,
    /// 新的剩余阶段
    #[serde(default)]
    plan: Option<Vec<PlanEntry>>,
}

/// 回复格式的 JSON Schema（拼进 system prompt）
pub fn reply_schema_json() -> String {
    serde_json::to_string_pretty(&schema_for!(ReplyFormat)).unwrap_or_default()
}

/// 从 LLM 输出中截取 JSON：```json 代码块优先，其次第一个 { 到最后一个 }
fn extract_json(output: &str) -> Option<&str> {
    if let Some(start) = output.find("```json") {
        let rest = &output[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    (end > start).then(|| &output[start..=end])
}

/// 把 LLM 回复解析为 Decision
pub fn parse_decision(output: &str) -> Result<Decision, ReasoningError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(ReasoningError::MalformedDecision("empty reply".to_string()));
    }
    let Some(json_str) = extract_json(trimmed) else {
        return Ok(Decision::final_answer(trimmed));
    };

    let reply: ReplyFormat = serde_json::from_str(json_str)
        .map_err(|e| ReasoningError::MalformedDecision(format!("{e}: {json_str}")))?;

    if let Some(tool) = reply.tool.filter(|t| !t.trim().is_empty()) {
        let args = reply.args.unwrap_or_else(|| Value::Object(Default::default()));
        return Ok(Decision::tool_call(tool.trim(), args));
    }
    if let Some(question) = reply.ask_user {
        return Ok(Decision::ask_user(question));
    }
    if let Some(entries) = reply.plan {
        return Ok(Decision::UpdatePlan {
            phases: entries.into_iter().map(PhaseDraft::from).collect(),
        });
    }
    if let Some(output) = reply.final_answer {
        return Ok(Decision::final_answer(output));
    }
    Err(ReasoningError::MalformedDecision(format!(
        "no tool / final_answer / ask_user / plan in: {json_str}"
    )))
}

/// LLM 推理端：持有 LlmClient 与 system prompt
pub struct LlmReasoningClient {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmReasoningClient {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// 拼接 system（格式说明 + 工具列表）与 user（任务、计划、历史、预算）
    pub fn build_messages(&self, ctx: &DecisionContext) -> Vec<Message> {
        let tools = serde_json::to_string_pretty(&ctx.available_tools).unwrap_or_default();
        let system = format!(
            "{}\n\n## 回复格式 (JSON Schema)\n{}\n\n## 可用工具\n{}",
            self.system_prompt,
            reply_schema_json(),
            tools
        );

        let mut user = String::new();
        let _ = writeln!(user, "## 任务\n{}", ctx.task_description);
        if !ctx.task_context.is_empty() {
            let _ = writeln!(
                user,
                "\n## 上下文\n{}",
                Value::Object(ctx.task_context.clone())
            );
        }

        let _ = writeln!(user, "\n## 计划（目标：{}）", ctx.plan.goal);
        for phase in &ctx.plan.phases {
            let marker = match phase.status {
                PhaseStatus::Active => "->",
                PhaseStatus::Completed => "[x]",
                PhaseStatus::Failed => "[!]",
                PhaseStatus::Skipped => "[-]",
                PhaseStatus::Pending => "[ ]",
            };
            let _ = writeln!(user, "{marker} {}. {}", phase.id, phase.title);
            if phase.status == PhaseStatus::Active && !phase.success_criteria.is_empty() {
                let _ = writeln!(user, "   完成标准：{}", phase.success_criteria.join("；"));
            }
        }

        if !ctx.recent_iterations.is_empty() {
            let _ = writeln!(user, "\n## 最近迭代");
            for log in &ctx.recent_iterations {
                let decision = serde_json::to_string(&log.decision).unwrap_or_default();
                let outcome = log
                    .outcome
                    .as_ref()
                    .and_then(|o| serde_json::to_string(o).ok())
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(user, "#{} {} => {}", log.index, decision, outcome);
            }
        }

        if !ctx.interactions.is_empty() {
            let _ = writeln!(user, "\n## 用户回答");
            for exchange in &ctx.interactions {
                let _ = writeln!(
                    user,
                    "Q: {}\nA: {}",
                    exchange.question.as_deref().unwrap_or("-"),
                    exchange.answer
                );
            }
        }

        let _ = writeln!(
            user,
            "\n第 {} 轮，剩余 {} 轮。",
            ctx.iteration_index + 1,
            ctx.remaining_iterations
        );
        if ctx.conclusion_requested {
            let _ = writeln!(user, "所有阶段均已完成，请给出 final_answer。");
        }

        vec![Message::system(system), Message::user(user)]
    }
}

#[async_trait]
impl ReasoningClient for LlmReasoningClient {
    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision, ReasoningError> {
        let messages = self.build_messages(ctx);
        let reply = self.llm.complete(&messages).await.map_err(|e| match e {
            LlmError::EmptyResponse => ReasoningError::MalformedDecision(e.to_string()),
            other => ReasoningError::Unavailable(other.to_string()),
        })?;
        let (_, _, total_tokens) = self.llm.token_usage();
        tracing::debug!(execution_id = %ctx.execution_id, total_tokens, reply = %reply, "llm reply");
        parse_decision(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PlanManager;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    fn ctx() -> DecisionContext {
        DecisionContext {
            execution_id: "exec_1".to_string(),
            task_description: "查询天气".to_string(),
            task_context: Default::default(),
            plan: PlanManager::new().create_initial("查询天气", vec![PhaseDraft::new("取数据")]),
            recent_iterations: vec![],
            available_tools: vec![],
            iteration_index: 0,
            remaining_iterations: 5,
            conclusion_requested: true,
            interactions: vec![],
        }
    }

    #[test]
    fn test_parse_tool_call_in_code_block() {
        let out = "好的。\n```json\n{\"tool\": \"echo\", \"args\": {\"text\": \"hi\"}}\n```";
        assert_eq!(
            parse_decision(out).unwrap(),
            Decision::tool_call("echo", json!({"text": "hi"}))
        );
    }

    #[test]
    fn test_parse_tool_call_without_args() {
        assert_eq!(
            parse_decision(r#"{"tool": "now"}"#).unwrap(),
            Decision::tool_call("now", json!({}))
        );
    }

    #[test]
    fn test_parse_other_decisions() {
        assert_eq!(
            parse_decision(r#"{"final_answer": {"temp": 21}}"#).unwrap(),
            Decision::final_answer(json!({"temp": 21}))
        );
        assert_eq!(
            parse_decision(r#"{"ask_user": "哪个城市？"}"#).unwrap(),
            Decision::ask_user("哪个城市？")
        );
        let plan = parse_decision(r#"{"plan": ["a", {"title": "b", "success_criteria": ["ok"]}]}"#)
            .unwrap();
        assert_eq!(
            plan,
            Decision::UpdatePlan {
                phases: vec![
                    PhaseDraft::new("a"),
                    PhaseDraft::new("b").with_criteria(vec!["ok".to_string()])
                ]
            }
        );
    }

    #[test]
    fn test_plain_text_is_final_answer() {
        assert_eq!(
            parse_decision("  It is sunny.  ").unwrap(),
            Decision::final_answer("It is sunny.")
        );
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            parse_decision("{not json}"),
            Err(ReasoningError::MalformedDecision(_))
        ));
        assert!(matches!(
            parse_decision(r#"{"thought": "hmm"}"#),
            Err(ReasoningError::MalformedDecision(_))
        ));
        assert!(parse_decision("   ").is_err());
    }

    #[test]
    fn test_build_messages_mentions_plan_and_conclusion() {
        let client = LlmReasoningClient::new(Arc::new(MockLlmClient::new()));
        let messages = client.build_messages(&ctx());
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("final_answer"));
        assert!(messages[1].content.contains("-> 1. 取数据"));
        assert!(messages[1].content.contains("请给出 final_answer"));
    }

    #[tokio::test]
    async fn test_decide_via_mock_llm() {
        let llm = MockLlmClient::with_responses([r#"{"tool": "echo", "args": {"text": "x"}}"#]);
        let client = LlmReasoningClient::new(Arc::new(llm));
        let decision = client.decide(&ctx()).await.unwrap();
        assert_eq!(decision.tool_name(), Some("echo"));
    }
}
