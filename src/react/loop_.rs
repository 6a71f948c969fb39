//! ReAct 主循环
//!
//! Build prompt -> generate -> parse -> (Action: invoke tool -> Observation) | Final Answer，
//! 受 max_iterations 与 max_wall_time 约束；单次生成另有超时。
//! 终止状态：Succeeded / Exhausted（预算耗尽，给出兜底回答）/ Failed（加载或生成失败，不重试）/ Cancelled。
//! 取消只在步骤之间与生成等待期间生效，工具执行期间不中断。
//! 可选 event_tx：向网关推送 RunStarted / Step / Finished。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, GenerationError, ToolError};
use crate::llm::ModelLifecycleManager;
use crate::react::events::RunEvent;
use crate::react::parser::{parse, ParsedAction};
use crate::react::prompt::{render, FewShotExample, HistoryTurn, PromptContext, FORMAT_REMINDER};
use crate::react::step::{AgentRun, AgentStep, RunStatus};
use crate::tools::{ToolDefinition, ToolRegistry};

/// 循环预算
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub max_iterations: usize,
    pub max_wall_time: Duration,
    pub generation_timeout: Duration,
    pub max_new_tokens: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_wall_time: Duration::from_secs(300),
            generation_timeout: Duration::from_secs(120),
            max_new_tokens: 1024,
        }
    }
}

/// 单次运行的输入
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub run_id: Option<String>,
    pub query: String,
    pub model_id: String,
    pub max_iterations: Option<usize>,
    pub max_wall_time: Option<Duration>,
    /// 启用的工具子集；None 表示全部
    pub allowed_tools: Option<Vec<String>>,
    pub history: Vec<HistoryTurn>,
    pub examples: Vec<FewShotExample>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            model_id: model_id.into(),
            ..Default::default()
        }
    }
}

/// 循环结束原因
enum Terminal {
    Succeeded(String),
    Exhausted { out_of_time: bool },
    Failed(String),
    Cancelled,
}

/// 生成阶段提前结束的原因
enum GenerationStop {
    Cancelled,
    Deadline,
    Failed(AgentError),
}

/// ReAct 主循环：注册表与模型管理器在多个 run 之间共享，每个 run 的状态只属于本次调用
pub struct AgentLoop {
    registry: Arc<ToolRegistry>,
    manager: Arc<ModelLifecycleManager>,
    config: LoopConfig,
}

fn send_event(tx: Option<&UnboundedSender<RunEvent>>, ev: RunEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

impl AgentLoop {
    pub fn new(
        registry: Arc<ToolRegistry>,
        manager: Arc<ModelLifecycleManager>,
        config: LoopConfig,
    ) -> Self {
        Self {
            registry,
            manager,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行一次 run；总是返回带状态的 AgentRun，不向调用方抛错
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        event_tx: Option<&UnboundedSender<RunEvent>>,
    ) -> AgentRun {
        let started = Instant::now();
        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        let deadline = started + request.max_wall_time.unwrap_or(self.config.max_wall_time);
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut run = AgentRun::new(run_id, request.query.clone(), request.model_id.clone());
        tracing::info!(
            run_id = %run.run_id,
            model_id = %run.model_id,
            max_iterations,
            "agent run started"
        );
        send_event(
            event_tx,
            RunEvent::RunStarted {
                run_id: run.run_id.clone(),
                query: run.query.clone(),
                model_id: run.model_id.clone(),
            },
        );

        let catalog = self.catalog(request.allowed_tools.as_deref());
        let enabled: HashSet<&str> = catalog.iter().map(|d| d.name.as_str()).collect();

        let terminal = loop {
            if cancel.is_cancelled() {
                break Terminal::Cancelled;
            }
            if run.iteration_count >= max_iterations {
                break Terminal::Exhausted { out_of_time: false };
            }
            if Instant::now() >= deadline {
                break Terminal::Exhausted { out_of_time: true };
            }

            let prompt = render(&PromptContext {
                query: &request.query,
                transcript: &run.transcript,
                catalog: &catalog,
                history: &request.history,
                examples: &request.examples,
            });
            tracing::debug!(run_id = %run.run_id, prompt = %prompt, "prompt");

            let text = match self.generate(&request.model_id, &prompt, deadline, &cancel).await {
                Ok(text) => text,
                Err(GenerationStop::Cancelled) => break Terminal::Cancelled,
                Err(GenerationStop::Deadline) => break Terminal::Exhausted { out_of_time: true },
                Err(GenerationStop::Failed(e)) => break Terminal::Failed(e.to_string()),
            };
            tracing::debug!(run_id = %run.run_id, generation = %text, "raw generation");

            let parsed = parse(&text);
            if let Some(thought) = parsed.thought {
                push_step(&mut run, AgentStep::thought(thought), event_tx);
            }

            match parsed.action {
                ParsedAction::FinalAnswer(answer) => {
                    push_step(&mut run, AgentStep::final_answer(answer.clone()), event_tx);
                    break Terminal::Succeeded(answer);
                }
                ParsedAction::Action { tool, input } => {
                    push_step(&mut run, AgentStep::action(tool.clone(), input.clone()), event_tx);
                    let observation = self.dispatch(&tool, input, &enabled, &catalog).await;
                    push_step(&mut run, AgentStep::observation(observation), event_tx);
                    run.iteration_count += 1;
                }
                ParsedAction::Malformed(raw) => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        chars = raw.chars().count(),
                        "unparsable model output"
                    );
                    push_step(&mut run, AgentStep::observation(FORMAT_REMINDER), event_tx);
                    run.iteration_count += 1;
                }
            }
        };

        let (status, final_answer) = match terminal {
            Terminal::Succeeded(answer) => (RunStatus::Succeeded, answer),
            Terminal::Exhausted { out_of_time } => {
                (RunStatus::Exhausted, best_effort_answer(&run, out_of_time))
            }
            Terminal::Failed(cause) => {
                let text = format!("Run failed: {}", cause);
                push_step(&mut run, AgentStep::observation(text.clone()), event_tx);
                (RunStatus::Failed, text)
            }
            Terminal::Cancelled => {
                let text = "Run cancelled".to_string();
                push_step(&mut run, AgentStep::observation(text.clone()), event_tx);
                (RunStatus::Cancelled, text)
            }
        };
        run.finish(status, final_answer, started.elapsed());

        tracing::info!(
            run_id = %run.run_id,
            status = ?run.status,
            iterations = run.iteration_count,
            steps = run.transcript.len(),
            elapsed_ms = run.elapsed_ms,
            "agent run finished"
        );
        send_event(event_tx, RunEvent::Finished { run: run.clone() });
        run
    }

    /// 本次 run 可见的工具目录（保持注册顺序）
    fn catalog(&self, allowed: Option<&[String]>) -> Vec<ToolDefinition> {
        let all = self.registry.list_definitions();
        match allowed {
            Some(names) => all
                .into_iter()
                .filter(|d| names.iter().any(|n| n == &d.name))
                .collect(),
            None => all,
        }
    }

    /// 调用工具；不在本次目录中的工具与未注册工具同样处理
    async fn dispatch(
        &self,
        tool: &str,
        input: serde_json::Value,
        enabled: &HashSet<&str>,
        catalog: &[ToolDefinition],
    ) -> String {
        if !enabled.contains(tool) {
            let err = ToolError::UnknownTool {
                name: tool.to_string(),
                available: catalog.iter().map(|d| d.name.clone()).collect(),
            };
            tracing::warn!(tool = %tool, "model requested unknown tool");
            return format!("Error: {}", err);
        }
        match self.registry.invoke(tool, input).await {
            Ok(observation) => observation,
            Err(e) => format!("Error: {}", e),
        }
    }

    /// 解析模型 -> 租用后端 -> 生成；租约在返回时归还
    async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationStop> {
        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationStop::Cancelled),
            r = tokio::time::timeout_at(deadline, self.manager.resolve(model_id)) => match r {
                Ok(Ok(lease)) => lease,
                Ok(Err(e)) => return Err(GenerationStop::Failed(AgentError::ModelLoad(e))),
                Err(_) => return Err(GenerationStop::Deadline),
            },
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let per_generation = self.config.generation_timeout;
        let bounded_by_deadline = remaining < per_generation;
        let limit = remaining.min(per_generation);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationStop::Cancelled),
            r = tokio::time::timeout(
                limit,
                lease.backend().generate(prompt, self.config.max_new_tokens),
            ) => r,
        };
        drop(lease);

        match result {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(cause)) => Err(GenerationStop::Failed(
                GenerationError::Backend {
                    model_id: model_id.to_string(),
                    cause,
                }
                .into(),
            )),
            Err(_) if bounded_by_deadline => Err(GenerationStop::Deadline),
            Err(_) => Err(GenerationStop::Failed(
                GenerationError::Timeout {
                    model_id: model_id.to_string(),
                    secs: per_generation.as_secs(),
                }
                .into(),
            )),
        }
    }
}

fn push_step(run: &mut AgentRun, step: AgentStep, event_tx: Option<&UnboundedSender<RunEvent>>) {
    let index = run.transcript.len();
    if event_tx.is_some() {
        send_event(
            event_tx,
            RunEvent::Step {
                index,
                step: step.clone(),
            },
        );
    }
    run.transcript.push(step);
}

/// 预算耗尽时的兜底回答：取最后一条 Thought / Observation，永不为空
fn best_effort_answer(run: &AgentRun, out_of_time: bool) -> String {
    let reason = if out_of_time {
        format!(
            "Time budget exhausted after {} iteration(s) without a final answer.",
            run.iteration_count
        )
    } else {
        format!(
            "Stopped after {} iteration(s) without a final answer.",
            run.iteration_count
        )
    };
    match run.transcript.last_thought_or_observation() {
        Some(last) => format!("{} Last progress: {}", reason, last),
        None => reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ManagerConfig, MockBackendFactory, ScriptItem};
    use crate::tools::CalculatorTool;

    fn agent(factory: MockBackendFactory, config: LoopConfig) -> (AgentLoop, Arc<MockBackendFactory>) {
        let factory = Arc::new(factory);
        let manager = Arc::new(ModelLifecycleManager::new(
            factory.clone(),
            ManagerConfig {
                memory_budget_bytes: 100,
            },
        ));
        let mut registry = ToolRegistry::new();
        registry.register(CalculatorTool).unwrap();
        (AgentLoop::new(Arc::new(registry), manager, config), factory)
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (agent, factory) = agent(MockBackendFactory::new(), LoopConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = agent.run(RunRequest::new("q", "m"), cancel, None).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.transcript.steps(), &[AgentStep::observation("Run cancelled")]);
        assert_eq!(factory.load_count(), 0);
    }

    #[tokio::test]
    async fn test_generation_error_fails_run() {
        let (agent, _) = agent(
            MockBackendFactory::new().with_script([ScriptItem::Fail("cuda error".into())]),
            LoopConfig::default(),
        );
        let run = agent
            .run(RunRequest::new("q", "m"), CancellationToken::new(), None)
            .await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.final_answer.starts_with("Run failed:"));
        assert!(run.final_answer.contains("cuda error"));
        assert!(matches!(run.transcript.last(), Some(AgentStep::Observation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_timeout_fails_run() {
        let config = LoopConfig {
            generation_timeout: Duration::from_secs(5),
            ..LoopConfig::default()
        };
        let (agent, _) = agent(MockBackendFactory::new().with_script([ScriptItem::Hang]), config);
        let run = agent
            .run(RunRequest::new("q", "m"), CancellationToken::new(), None)
            .await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.final_answer.contains("timed out after 5s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_time_exhausts_run() {
        let config = LoopConfig {
            max_wall_time: Duration::from_secs(3),
            generation_timeout: Duration::from_secs(60),
            ..LoopConfig::default()
        };
        let (agent, _) = agent(MockBackendFactory::new().with_script([ScriptItem::Hang]), config);
        let run = agent
            .run(RunRequest::new("q", "m"), CancellationToken::new(), None)
            .await;
        assert_eq!(run.status, RunStatus::Exhausted);
        assert!(run.final_answer.starts_with("Time budget exhausted"));
    }

    #[tokio::test]
    async fn test_filtered_tool_behaves_as_unknown() {
        let (agent, _) = agent(
            MockBackendFactory::new().with_script([
                "Action: calculator\nAction Input: {\"expression\": \"1+1\"}",
                "Final Answer: no",
            ]),
            LoopConfig::default(),
        );
        let mut request = RunRequest::new("q", "m");
        request.allowed_tools = Some(vec![]);
        let run = agent.run(request, CancellationToken::new(), None).await;
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(
            run.transcript.steps()[1],
            AgentStep::observation("Error: Unknown tool 'calculator'. Available tools: (none)")
        );
    }

    #[tokio::test]
    async fn test_events_mirror_transcript() {
        let (agent, _) = agent(
            MockBackendFactory::new().with_script(["Thought: easy\nFinal Answer: 2"]),
            LoopConfig::default(),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let run = agent
            .run(RunRequest::new("q", "m"), CancellationToken::new(), Some(&tx))
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events.len(), 2 + run.transcript.len());
        assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
        assert!(matches!(events.last(), Some(RunEvent::Finished { .. })));
    }
}
