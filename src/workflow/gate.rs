//! 门控条件评估
//!
//! 默认的 AutoPassGate 不评估条件、一律放行，执行器会在日志和阶段输出里标明。
//! 生产环境需注入真正的评估器。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::workflow::types::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub passed: bool,
    /// false 表示条件未被真正评估
    pub evaluated: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    pub fn pass() -> Self {
        Self {
            passed: true,
            evaluated: true,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            evaluated: true,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait GateEvaluator: Send + Sync {
    /// 以上一阶段的输出评估 `phase.gate_condition`
    async fn evaluate(&self, phase: &Phase, previous_output: Option<&Value>) -> GateDecision;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoPassGate;

#[async_trait]
impl GateEvaluator for AutoPassGate {
    async fn evaluate(&self, _phase: &Phase, _previous_output: Option<&Value>) -> GateDecision {
        GateDecision {
            passed: true,
            evaluated: false,
            reason: Some("gate conditions are not evaluated".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_pass_is_flagged_unevaluated() {
        let phase = Phase::gate("g", "Check", "output.score > 0.8");
        let d = AutoPassGate.evaluate(&phase, None).await;
        assert!(d.passed);
        assert!(!d.evaluated);
    }
}
