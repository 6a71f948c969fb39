//! 运行过程事件：用于 NDJSON 流式输出 run 的开始、每个步骤与最终结果

use serde::Serialize;

use crate::react::step::{AgentRun, AgentStep};

/// 单个过程事件（每个事件序列化为一行 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        query: String,
        model_id: String,
    },
    /// transcript 新增一步；index 为该步在 transcript 中的下标
    Step { index: usize, step: AgentStep },
    Finished { run: AgentRun },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tags() {
        let ev = RunEvent::Step {
            index: 0,
            step: AgentStep::thought("hm"),
        };
        let v = serde_json::to_value(ev).unwrap();
        assert_eq!(v["type"], "step");
        assert_eq!(v["step"]["type"], "thought");
    }
}
