use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolCallId;
use crate::usage::{Usage, UsageSource};

/// One capability call made during a run, in request order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: ToolCallId,
    pub capability: String,
    pub input: Value,
    /// Capability result on success, structured error payload otherwise.
    pub output: Value,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub duration: Duration,
    /// 1-based turn that requested the call.
    pub turn: u32,
}

/// Output of a single Specialist run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub usage: Usage,
    pub duration: Duration,
    pub invocations: Vec<ToolInvocation>,
    pub turns: u32,
}

impl ExecutionResult {
    pub fn failed_invocations(&self) -> usize {
        self.invocations.iter().filter(|i| i.is_error).count()
    }

    /// Parse the output as JSON, for specialists that answer with structured data.
    pub fn output_json(&self) -> Option<Value> {
        serde_json::from_str(&self.output).ok()
    }
}

impl UsageSource for ExecutionResult {
    fn usage(&self) -> Usage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::TokenUsage;

    fn invocation(is_error: bool) -> ToolInvocation {
        ToolInvocation {
            call_id: ToolCallId::from_raw("call_1"),
            capability: "add".into(),
            input: serde_json::json!({"a": 2, "b": 3}),
            output: serde_json::json!(5),
            is_error,
            error_kind: None,
            duration: Duration::from_millis(3),
            turn: 1,
        }
    }

    #[test]
    fn counts_failed_invocations() {
        let result = ExecutionResult {
            invocations: vec![invocation(false), invocation(true), invocation(true)],
            ..ExecutionResult::default()
        };
        assert_eq!(result.failed_invocations(), 2);
    }

    #[test]
    fn structured_output() {
        let result = ExecutionResult {
            output: r#"{"answer": 5}"#.into(),
            ..ExecutionResult::default()
        };
        assert_eq!(result.output_json().unwrap()["answer"], 5);

        let plain = ExecutionResult {
            output: "The answer is 5.".into(),
            ..ExecutionResult::default()
        };
        assert!(plain.output_json().is_none());
    }

    #[test]
    fn nested_results_sum() {
        let a = ExecutionResult {
            usage: Usage::from_call(Some(TokenUsage::new(3, 4)), Some(10)),
            ..ExecutionResult::default()
        };
        let b = ExecutionResult {
            usage: Usage::from_call(Some(TokenUsage::new(1, 1)), Some(2)),
            ..ExecutionResult::default()
        };
        let total = Usage::aggregate([a.usage(), b.usage()]);
        assert_eq!(total.total_tokens, 9);
        assert_eq!(total.cost_micros, 12);
    }
}
