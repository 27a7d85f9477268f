//! Delay node: cancellable sleep.

use super::NodeResult;
use crate::error::{EngineError, EngineResult};
use crate::scheduler::ExecEnv;
use cascade_gml::Value;
use std::time::Duration;

pub(crate) async fn run(node: &crate::flow::DelayNode, env: &ExecEnv) -> EngineResult<NodeResult> {
    let duration = parse_duration(&node.wait)?;

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = env.cancel.cancelled() => return Err(EngineError::Cancelled),
    }

    Ok(NodeResult::value(Value::Null))
}

/// `"Ns"` / `"Nm"` / `"Nh"`, or a bare number of milliseconds.
pub(crate) fn parse_duration(s: &str) -> EngineResult<Duration> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let (num_src, unit) = s.split_at(s.len().saturating_sub(1));
    let n: u64 = num_src.parse().map_err(|_| {
        EngineError::Validation(format!("invalid duration: '{}'", s))
    })?;
    match unit {
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(EngineError::Validation(format!(
            "invalid duration unit in '{}'",
            s
        ))),
    }
}
