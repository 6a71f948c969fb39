//! ReAct 层：步骤与运行记录、Prompt 构建、输出解析、主循环、过程事件

pub mod events;
pub mod loop_;
pub mod parser;
pub mod prompt;
pub mod step;

pub use events::RunEvent;
pub use loop_::{AgentLoop, LoopConfig, RunRequest};
pub use parser::{parse, parse_action_input, ParsedAction, ParsedStep, FALLBACK_INPUT_KEY};
pub use prompt::{build_prompt, render, FewShotExample, HistoryTurn, PromptContext, FORMAT_REMINDER};
pub use step::{AgentRun, AgentStep, RunStatus, Transcript};
