//! 模型输出解析：全函数，永不失败，返回 Action / FinalAnswer / Malformed 之一
//!
//! 标记大小写不敏感，同时接受 `Final Answer:` 与 `FINAL_ANSWER:`、`Action Input:` 与 `ACTION_INPUT:`、
//! `Thought:` 与 `THINKING:`。Final Answer 优先于同一段文本中的 Action。
//! Action 名截断到第一个换行；Action Input 截断到模型臆造的 `Observation:` 之前。
//! Action Input 依次尝试：JSON 对象 -> 逐行 key: value / key=value -> 整段作为 {"input": <text>}。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

pub use crate::tools::schema::FALLBACK_INPUT_KEY;

/// 解析出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedAction {
    Action { tool: String, input: Value },
    FinalAnswer(String),
    /// 没有可用标记，携带原文
    Malformed(String),
}

/// 一次生成的解析结果：可选 Thought + 动作
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStep {
    pub thought: Option<String>,
    pub action: ParsedAction,
}

struct Markers {
    thought: Regex,
    final_answer: Regex,
    action: Regex,
    action_input: Regex,
    observation: Regex,
    /// Thought 的结束位置：下一个任意标记
    any_after_thought: Regex,
    kv_line: Regex,
}

static MARKERS: OnceLock<Markers> = OnceLock::new();

fn markers() -> &'static Markers {
    MARKERS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).unwrap_or_else(|e| panic!("invalid marker pattern {p}: {e}"));
        Markers {
            thought: re(r"(?i)\b(?:thought|thinking)\s*:"),
            final_answer: re(r"(?i)\bfinal[ _]answer\s*:"),
            action: re(r"(?i)\baction\s*:"),
            action_input: re(r"(?i)\baction[ _]input\s*:"),
            observation: re(r"(?i)\bobservation\s*:"),
            any_after_thought: re(
                r"(?i)\b(?:action|action[ _]input|final[ _]answer|observation|thought|thinking)\s*:",
            ),
            kv_line: re(r"^\s*([A-Za-z_][A-Za-z0-9_\-]*)\s*[:=]\s*(.*?)\s*$"),
        }
    })
}

/// 解析一次生成
pub fn parse(text: &str) -> ParsedStep {
    let m = markers();
    let thought = extract_thought(text, m);

    if let Some(fa) = m.final_answer.find(text) {
        let answer = text[fa.end()..].trim().to_string();
        return ParsedStep {
            thought,
            action: ParsedAction::FinalAnswer(answer),
        };
    }

    let Some(act) = m.action.find(text) else {
        return ParsedStep {
            thought,
            action: ParsedAction::Malformed(text.to_string()),
        };
    };

    let after_action = &text[act.end()..];
    let input_marker = m.action_input.find(after_action);
    let line_end = after_action.find('\n').unwrap_or(after_action.len());
    let name_end = match input_marker {
        Some(im) if im.start() < line_end => im.start(),
        _ => line_end,
    };
    let tool = clean_name(&after_action[..name_end]);
    if tool.is_empty() {
        return ParsedStep {
            thought,
            action: ParsedAction::Malformed(text.to_string()),
        };
    }

    let input = match input_marker {
        Some(im) => {
            let raw = &after_action[im.end()..];
            let raw = match m.observation.find(raw) {
                Some(obs) => &raw[..obs.start()],
                None => raw,
            };
            parse_action_input(raw)
        }
        None => Value::Object(Map::new()),
    };

    ParsedStep {
        thought,
        action: ParsedAction::Action { tool, input },
    }
}

fn extract_thought(text: &str, m: &Markers) -> Option<String> {
    let start = m.thought.find(text)?.end();
    let rest = &text[start..];
    let end = m
        .any_after_thought
        .find(rest)
        .map(|next| next.start())
        .unwrap_or(rest.len());
    let thought = rest[..end].trim();
    if thought.is_empty() {
        None
    } else {
        Some(thought.to_string())
    }
}

fn clean_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '*') || c.is_whitespace())
        .to_string()
}

/// 去掉 ``` / ```json 代码围栏
fn strip_code_fence(raw: &str) -> &str {
    let s = raw.trim();
    let Some(inner) = s.strip_prefix("```") else {
        return s;
    };
    let inner = match inner.find('\n') {
        Some(nl) if inner[..nl].chars().all(|c| c.is_ascii_alphanumeric()) => &inner[nl + 1..],
        _ => inner,
    };
    inner.trim_end().strip_suffix("```").unwrap_or(inner).trim()
}

/// Action Input 解析：JSON 对象 -> key/value 行 -> {"input": 原文}
pub fn parse_action_input(raw: &str) -> Value {
    let s = strip_code_fence(raw);
    if s.is_empty() {
        return Value::Object(Map::new());
    }

    if let Some(obj) = parse_json_object(s) {
        return obj;
    }

    if let Some(obj) = parse_key_values(s) {
        return obj;
    }

    let mut map = Map::new();
    map.insert(FALLBACK_INPUT_KEY.to_string(), Value::String(s.to_string()));
    Value::Object(map)
}

fn parse_json_object(s: &str) -> Option<Value> {
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(s) {
        return Some(v);
    }
    // 对象之后跟了多余文本
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&s[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

fn parse_key_values(s: &str) -> Option<Value> {
    let kv = &markers().kv_line;
    let mut map = Map::new();
    for line in s.lines().filter(|l| !l.trim().is_empty()) {
        let caps = kv.captures(line)?;
        let key = caps.get(1)?.as_str().to_string();
        let value = caps.get(2).map_or("", |v| v.as_str());
        let value = value
            .trim_end_matches(',')
            .trim()
            .trim_matches(|c| c == '"' || c == '\'');
        map.insert(key, Value::String(value.to_string()));
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}
