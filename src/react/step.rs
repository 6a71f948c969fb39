//! Agent Step / Transcript / Agent Run
//!
//! Transcript 只提供 push 与只读访问，步骤一旦写入不可修改或删除。

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

/// 单个步骤
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStep {
    Thought { text: String },
    Action { tool: String, input: Value },
    Observation { text: String },
    FinalAnswer { text: String },
}

impl AgentStep {
    pub fn thought(text: impl Into<String>) -> Self {
        AgentStep::Thought { text: text.into() }
    }

    pub fn action(tool: impl Into<String>, input: Value) -> Self {
        AgentStep::Action {
            tool: tool.into(),
            input,
        }
    }

    pub fn observation(text: impl Into<String>) -> Self {
        AgentStep::Observation { text: text.into() }
    }

    pub fn final_answer(text: impl Into<String>) -> Self {
        AgentStep::FinalAnswer { text: text.into() }
    }

    /// 步骤文本（Action 为 None）
    pub fn text(&self) -> Option<&str> {
        match self {
            AgentStep::Thought { text }
            | AgentStep::Observation { text }
            | AgentStep::FinalAnswer { text } => Some(text),
            AgentStep::Action { .. } => None,
        }
    }
}

/// 只追加的步骤序列
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Transcript {
    steps: Vec<AgentStep>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: AgentStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[AgentStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&AgentStep> {
        self.steps.last()
    }

    /// 最近一条 Thought 或 Observation 的文本（用于预算耗尽时的兜底回答）
    pub fn last_thought_or_observation(&self) -> Option<&str> {
        self.steps.iter().rev().find_map(|s| match s {
            AgentStep::Thought { text } | AgentStep::Observation { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn has_final_answer(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, AgentStep::FinalAnswer { .. }))
    }
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Exhausted,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// 单次请求的运行记录，由创建它的 AgentLoop::run 独占
#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    pub run_id: String,
    pub query: String,
    pub model_id: String,
    pub status: RunStatus,
    pub final_answer: String,
    pub iteration_count: usize,
    pub elapsed_ms: u64,
    pub started_at: String,
    pub transcript: Transcript,
}

impl AgentRun {
    pub fn new(run_id: impl Into<String>, query: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            query: query.into(),
            model_id: model_id.into(),
            status: RunStatus::Running,
            final_answer: String::new(),
            iteration_count: 0,
            elapsed_ms: 0,
            started_at: chrono::Utc::now().to_rfc3339(),
            transcript: Transcript::new(),
        }
    }

    pub(crate) fn finish(&mut self, status: RunStatus, final_answer: String, elapsed: Duration) {
        self.status = status;
        self.final_answer = final_answer;
        self.elapsed_ms = elapsed.as_millis() as u64;
    }
}
