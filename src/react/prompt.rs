//! Prompt 构建：纯函数，相同输入产出逐字节相同的 Prompt（不含时间戳与随机 id）
//!
//! 结构：系统前言（ReAct 协议与输出语法）-> 工具目录（注册顺序）-> few-shot 示例 ->
//! 对话历史 -> 当前问题 -> 已有 transcript 按 Thought / Action / Observation 重放。

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::react::step::{AgentStep, Transcript};
use crate::tools::ToolDefinition;

/// 模型输出无法解析时追加的 Observation
pub const FORMAT_REMINDER: &str = "Invalid format: your previous output could not be parsed. \
Respond with either\nThought: <reasoning>\nAction: <tool name>\nAction Input: <JSON object>\n\
or\nThought: <reasoning>\nFinal Answer: <answer>";

/// 对话历史中的一轮
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant: Option<String>,
}

/// few-shot 示例，空字段不渲染
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub query: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub action_input: Option<String>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub final_answer: Option<String>,
}

/// 本次 Prompt 的全部输入
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub query: &'a str,
    pub transcript: &'a Transcript,
    pub catalog: &'a [ToolDefinition],
    pub history: &'a [HistoryTurn],
    pub examples: &'a [FewShotExample],
}

/// 仅由问题、transcript、工具目录构建
pub fn build_prompt(query: &str, transcript: &Transcript, catalog: &[ToolDefinition]) -> String {
    render(&PromptContext {
        query,
        transcript,
        catalog,
        history: &[],
        examples: &[],
    })
}

pub fn render(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    out.push_str(PREAMBLE_HEAD);
    out.push_str("\n\nAvailable tools:\n\n");
    if ctx.catalog.is_empty() {
        out.push_str("(no tools available)\n");
    } else {
        let rendered: Vec<String> = ctx.catalog.iter().map(render_tool).collect();
        out.push_str(&rendered.join("\n"));
    }
    out.push('\n');
    out.push_str(PREAMBLE_FORMAT);

    if !ctx.examples.is_empty() {
        out.push_str("\n\nHere are some examples of how to use tools:\n\n");
        let rendered: Vec<String> = ctx.examples.iter().map(render_example).collect();
        out.push_str(&rendered.join("\n"));
    }

    out.push_str("\n\n");
    for turn in ctx.history {
        if let Some(user) = &turn.user {
            let _ = writeln!(out, "User: {}", user);
        }
        if let Some(assistant) = &turn.assistant {
            let _ = writeln!(out, "Assistant: {}", assistant);
        }
    }
    let _ = write!(out, "User: {}\n\nAssistant:", ctx.query);

    for step in ctx.transcript.steps() {
        out.push('\n');
        out.push_str(&render_step(step));
    }
    if !ctx.transcript.is_empty() {
        out.push('\n');
    }
    out
}

const PREAMBLE_HEAD: &str = "You are an AI assistant that can use tools to answer questions.\n\
When you need a tool, use the exact syntax described below. \
Think step by step about how to solve the problem first, then decide whether a tool is needed.";

const PREAMBLE_FORMAT: &str = "\nTo use a tool, respond with:\n\
Thought: <think step by step about what to do>\n\
Action: <tool name>\n\
Action Input: {\"parameter1\": \"value1\", \"parameter2\": \"value2\"}\n\
\n\
The tool result will be given to you as:\n\
Observation: <result from the tool>\n\
\n\
Repeat Thought/Action/Action Input/Observation as often as needed. \
When you know the answer and need no more tools, respond with:\n\
Thought: <final reasoning>\n\
Final Answer: <your complete answer>\n\
\n\
Rules:\n\
1. Follow the format exactly, one Action per response.\n\
2. Action Input must be a JSON object.\n\
3. Never write an Observation yourself; wait for the tool result.\n\
4. Use only the tools listed above.";

fn render_tool(def: &ToolDefinition) -> String {
    let mut s = format!("Tool: {}\nDescription: {}\n", def.name, def.description);
    if def.parameters.is_empty() {
        s.push_str("Parameters: none\n");
    } else {
        s.push_str("Parameters:\n");
        for (name, spec) in &def.parameters {
            let req = if spec.required { "required" } else { "optional" };
            let _ = writeln!(s, "  - {} ({}, {}): {}", name, spec.param_type, req, spec.description);
        }
    }
    let _ = writeln!(s, "Output: {}", def.output_description);
    s
}

fn render_example(ex: &FewShotExample) -> String {
    let mut s = format!("User: {}\n\nAssistant:\n", ex.query);
    let present = |v: &Option<String>| v.as_deref().filter(|t| !t.is_empty()).map(str::to_string);
    if let Some(t) = present(&ex.thinking) {
        let _ = writeln!(s, "Thought: {}", t);
    }
    if let Some(a) = present(&ex.action) {
        let _ = writeln!(s, "Action: {}", a);
        let _ = writeln!(s, "Action Input: {}", ex.action_input.as_deref().unwrap_or("{}"));
    }
    if let Some(o) = present(&ex.observation) {
        let _ = writeln!(s, "Observation: {}", o);
    }
    if let Some(f) = present(&ex.final_answer) {
        let _ = writeln!(s, "Final Answer: {}", f);
    }
    s
}

fn render_step(step: &AgentStep) -> String {
    match step {
        AgentStep::Thought { text } => format!("Thought: {}", text),
        AgentStep::Action { tool, input } => format!("Action: {}\nAction Input: {}", tool, input),
        AgentStep::Observation { text } => format!("Observation: {}", text),
        AgentStep::FinalAnswer { text } => format!("Final Answer: {}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::{ParamSpec, ParamTable, ParamType};
    use serde_json::json;

    fn calculator_def() -> ToolDefinition {
        let mut parameters = ParamTable::new();
        parameters.insert(
            "expression".into(),
            ParamSpec::required(ParamType::String, "Expression to evaluate."),
        );
        ToolDefinition {
            name: "calculator".into(),
            description: "Evaluate arithmetic.".into(),
            parameters,
            output_description: "The numeric result.".into(),
        }
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let catalog = vec![calculator_def()];
        let mut t = Transcript::new();
        t.push(AgentStep::thought("compute"));
        let a = build_prompt("What is 2+2?", &t, &catalog);
        let b = build_prompt("What is 2+2?", &t, &catalog);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prompt_contains_catalog_query_and_markers() {
        let p = build_prompt("What is 2+2?", &Transcript::new(), &[calculator_def()]);
        assert!(p.contains("Tool: calculator"));
        assert!(p.contains("  - expression (string, required): Expression to evaluate."));
        assert!(p.contains("Output: The numeric result."));
        assert!(p.contains("Action Input:"));
        assert!(p.contains("Final Answer:"));
        assert!(p.ends_with("User: What is 2+2?\n\nAssistant:"));
    }

    #[test]
    fn test_transcript_replayed_in_order() {
        let mut t = Transcript::new();
        t.push(AgentStep::thought("I should compute this."));
        t.push(AgentStep::action("calculator", json!({"expression": "sqrt(16)"})));
        t.push(AgentStep::observation("4"));
        let p = build_prompt("q", &t, &[calculator_def()]);
        let tail = p.split("Assistant:").last().unwrap();
        assert_eq!(
            tail,
            "\nThought: I should compute this.\nAction: calculator\nAction Input: {\"expression\":\"sqrt(16)\"}\nObservation: 4\n"
        );
    }

    #[test]
    fn test_history_and_examples_precede_query() {
        let history = vec![HistoryTurn {
            user: Some("hi".into()),
            assistant: Some("hello".into()),
        }];
        let examples = vec![FewShotExample {
            query: "What is 1+1?".into(),
            action: Some("calculator".into()),
            action_input: Some("{\"expression\": \"1+1\"}".into()),
            observation: Some("2".into()),
            final_answer: Some("2".into()),
            ..Default::default()
        }];
        let t = Transcript::new();
        let catalog = vec![calculator_def()];
        let p = render(&PromptContext {
            query: "now?",
            transcript: &t,
            catalog: &catalog,
            history: &history,
            examples: &examples,
        });
        let ex = p.find("Here are some examples").unwrap();
        let hist = p.find("User: hi\nAssistant: hello\n").unwrap();
        let query = p.find("User: now?").unwrap();
        assert!(ex < hist && hist < query);
        assert!(p.contains("Action: calculator\nAction Input: {\"expression\": \"1+1\"}\nObservation: 2\nFinal Answer: 2\n"));
    }
}
