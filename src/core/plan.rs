//! 计划管理：Plan / Phase 与 PlanManager
//!
//! 计划是任务的长期记忆：有序阶段列表，最多一个 active，active 之前的阶段均为终态，之后均为 pending。
//! 阶段 id 严格递增、创建后不变。PlanManager 只做数据结构变更与不变量检查，不做 I/O。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{EngineError, ToolCall};

/// 阶段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }
}

/// 计划中的一个阶段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: u32,
    pub title: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    pub status: PhaseStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// 阶段草稿（调用方或推理端提交，id 由 PlanManager 分配）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDraft {
    pub title: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

impl PhaseDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            success_criteria: Vec::new(),
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.success_criteria = criteria;
        self
    }
}

/// 计划草稿：目标 + 阶段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub goal: String,
    #[serde(default)]
    pub phases: Vec<PhaseDraft>,
}

/// 单次执行的计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub current_phase_id: Option<u32>,
    pub phases: Vec<Phase>,
    /// 在途工具调用（非空时计划被锁定，不能替换）
    #[serde(default)]
    pub in_flight_tool: Option<String>,
}

impl Plan {
    pub fn active_phase(&self) -> Option<&Phase> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::Active)
    }

    fn active_index(&self) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.status == PhaseStatus::Active)
    }

    fn next_pending_index(&self) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.status == PhaseStatus::Pending)
    }

    /// 没有 active 也没有 pending：计划已走完，下一轮应请求最终答案
    pub fn is_exhausted(&self) -> bool {
        !self
            .phases
            .iter()
            .any(|p| matches!(p.status, PhaseStatus::Active | PhaseStatus::Pending))
    }

    pub fn is_locked(&self) -> bool {
        self.in_flight_tool.is_some()
    }

    fn next_phase_id(&self) -> u32 {
        self.phases.iter().map(|p| p.id).max().map_or(1, |id| id + 1)
    }

    /// 检查不变量：id 严格递增；最多一个 active；active 之前全为终态、之后全为 pending；current_phase_id 与 active 一致
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.phases.is_empty() {
            return Err("plan has no phases".to_string());
        }
        for pair in self.phases.windows(2) {
            if pair[1].id <= pair[0].id {
                return Err(format!(
                    "phase ids not strictly increasing: {} then {}",
                    pair[0].id, pair[1].id
                ));
            }
        }
        let active: Vec<usize> = self
            .phases
            .iter()
            .enumerate()
            .filter(|(_, p)| p.status == PhaseStatus::Active)
            .map(|(i, _)| i)
            .collect();
        if active.len() > 1 {
            return Err(format!("{} phases are active", active.len()));
        }
        if let Some(&idx) = active.first() {
            if let Some(before) = self.phases[..idx].iter().find(|p| !p.status.is_terminal()) {
                return Err(format!(
                    "phase {} precedes the active phase but is not terminal",
                    before.id
                ));
            }
            if let Some(after) = self.phases[idx + 1..]
                .iter()
                .find(|p| p.status != PhaseStatus::Pending)
            {
                return Err(format!(
                    "phase {} follows the active phase but is not pending",
                    after.id
                ));
            }
        }
        let active_id = active.first().map(|&i| self.phases[i].id);
        if self.current_phase_id != active_id {
            return Err(format!(
                "current_phase_id {:?} does not match active phase {:?}",
                self.current_phase_id, active_id
            ));
        }
        Ok(())
    }
}

/// 计划变更器：纯数据结构操作，失败时计划保持不变
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanManager;

impl PlanManager {
    pub fn new() -> Self {
        Self
    }

    /// 创建初始计划：第一个阶段 active，其余 pending；阶段为空时合成一个兜底阶段
    pub fn create_initial(&self, goal: impl Into<String>, drafts: Vec<PhaseDraft>) -> Plan {
        let goal = goal.into();
        let drafts = if drafts.is_empty() {
            vec![catch_all_phase(&goal)]
        } else {
            drafts
        };
        let phases = drafts
            .into_iter()
            .enumerate()
            .map(|(i, d)| Phase {
                id: i as u32 + 1,
                title: d.title,
                success_criteria: d.success_criteria,
                status: if i == 0 {
                    PhaseStatus::Active
                } else {
                    PhaseStatus::Pending
                },
                failure_reason: None,
            })
            .collect::<Vec<_>>();
        Plan {
            goal,
            current_phase_id: phases.first().map(|p| p.id),
            phases,
            in_flight_tool: None,
        }
    }

    /// active 阶段置 completed，下一个 pending 阶段激活。
    /// 没有 active 时直接激活下一个 pending（失败阶段之后继续）；已在最后一个阶段时返回 NoMorePhases。
    pub fn advance_phase(&self, plan: &mut Plan) -> Result<u32, EngineError> {
        let next = plan.next_pending_index().ok_or(EngineError::NoMorePhases)?;
        if let Some(idx) = plan.active_index() {
            plan.phases[idx].status = PhaseStatus::Completed;
        }
        plan.phases[next].status = PhaseStatus::Active;
        let id = plan.phases[next].id;
        plan.current_phase_id = Some(id);
        Ok(id)
    }

    /// 关闭最后一个 active 阶段而不激活新阶段（计划走完）
    pub fn complete_current(&self, plan: &mut Plan) -> Option<u32> {
        let idx = plan.active_index()?;
        plan.phases[idx].status = PhaseStatus::Completed;
        plan.current_phase_id = None;
        Some(plan.phases[idx].id)
    }

    /// active 阶段置 failed，不自动前进（由调用方决定原地重试还是终止）
    pub fn fail_current_phase(&self, plan: &mut Plan, reason: impl Into<String>) -> Option<u32> {
        let idx = plan.active_index()?;
        let phase = &mut plan.phases[idx];
        phase.status = PhaseStatus::Failed;
        phase.failure_reason = Some(reason.into());
        plan.current_phase_id = None;
        Some(phase.id)
    }

    /// 替换剩余计划：终态阶段保留，当前 active 阶段标记 skipped，pending 阶段丢弃，新阶段追加并激活第一个。
    /// 有在途工具调用时返回 PlanLocked。
    pub fn replace(&self, plan: &mut Plan, drafts: Vec<PhaseDraft>) -> Result<(), EngineError> {
        if let Some(tool) = &plan.in_flight_tool {
            return Err(EngineError::PlanLocked(tool.clone()));
        }
        let drafts = if drafts.is_empty() {
            vec![catch_all_phase(&plan.goal)]
        } else {
            drafts
        };
        let mut next_id = plan.next_phase_id();
        plan.phases.retain(|p| p.status != PhaseStatus::Pending);
        for phase in plan.phases.iter_mut() {
            if phase.status == PhaseStatus::Active {
                phase.status = PhaseStatus::Skipped;
            }
        }
        let mut first = true;
        for draft in drafts {
            plan.phases.push(Phase {
                id: next_id,
                title: draft.title,
                success_criteria: draft.success_criteria,
                status: if first {
                    PhaseStatus::Active
                } else {
                    PhaseStatus::Pending
                },
                failure_reason: None,
            });
            if first {
                plan.current_phase_id = Some(next_id);
                first = false;
            }
            next_id += 1;
        }
        Ok(())
    }

    /// 工具调用开始前锁定计划
    pub fn lock_for_call(&self, plan: &mut Plan, tool_name: &str) {
        plan.in_flight_tool = Some(tool_name.to_string());
    }

    pub fn unlock(&self, plan: &mut Plan) {
        plan.in_flight_tool = None;
    }
}

fn catch_all_phase(goal: &str) -> PhaseDraft {
    PhaseDraft {
        title: goal.to_string(),
        success_criteria: Vec::new(),
    }
}

/// 阶段完成判定：工具成功后是否满足当前阶段的成功标准
pub trait PhaseEvaluator: Send + Sync {
    fn is_satisfied(&self, phase: &Phase, call: &ToolCall, value: &Value) -> bool;
}

/// 默认判定：任意一次成功的工具调用即推进阶段
#[derive(Debug, Default, Clone, Copy)]
pub struct AnySuccess;

impl PhaseEvaluator for AnySuccess {
    fn is_satisfied(&self, _phase: &Phase, _call: &ToolCall, _value: &Value) -> bool {
        true
    }
}

impl<F> PhaseEvaluator for F
where
    F: Fn(&Phase, &ToolCall, &Value) -> bool + Send + Sync,
{
    fn is_satisfied(&self, phase: &Phase, call: &ToolCall, value: &Value) -> bool {
        self(phase, call, value)
    }
}
