//! Approval node: suspend the execution for an out-of-band decision.
//!
//! The executor persists a `PendingApproval` record, snapshots the
//! execution, marks it paused and waits on the approval hub. Resolution
//! binds the chosen option id under the node ID and routes `then`/`else`
//! depending on the approve set; a timeout falls back to `timeout_action`.

use super::{NodeResult, parse_duration};
use crate::error::{EngineError, EngineResult};
use crate::event::ExecutionEvent;
use crate::flow::{ApprovalNode, TimeoutAction};
use crate::persistence::{ExecutionStatus, PendingApproval};
use crate::scheduler::ExecEnv;
use cascade_gml::{Object, Value};
use chrono::Utc;

pub(crate) async fn run(
    node_id: &str,
    node: &ApprovalNode,
    env: &ExecEnv,
) -> EngineResult<NodeResult> {
    let spec = &node.approval;
    let timeout = spec
        .timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?;

    let record = PendingApproval {
        execution_id: env.execution_id,
        node_id: node_id.to_string(),
        title: spec.title.clone(),
        description: spec.description.clone(),
        options: spec.options.clone(),
        deadline: timeout.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default()),
        created_at: Utc::now(),
    };
    if let Err(e) = env.persistence.save_approval(&record).await {
        tracing::warn!(node_id, error = %e, "failed to persist pending approval");
    }

    // Register before announcing the pause so a racing resolution cannot
    // arrive with no waiter.
    let receiver = env.approvals.register(env.execution_id, node_id);

    env.progress.set_status(ExecutionStatus::Paused);
    env.progress.save_now().await;
    env.events.emit(ExecutionEvent::Paused {
        node_id: node_id.to_string(),
        at: Utc::now(),
    });

    let timeout_sleep = async {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    let chosen: Option<String> = tokio::select! {
        resolution = receiver => resolution.ok(),
        _ = timeout_sleep => None,
        _ = env.cancel.cancelled() => {
            env.approvals.unregister(env.execution_id, node_id);
            let _ = env.persistence.remove_approval(env.execution_id, node_id).await;
            return Err(EngineError::Cancelled);
        }
    };

    env.approvals.unregister(env.execution_id, node_id);
    if let Err(e) = env
        .persistence
        .remove_approval(env.execution_id, node_id)
        .await
    {
        tracing::warn!(node_id, error = %e, "failed to remove pending approval");
    }

    let (approved, output) = match chosen {
        Some(option_id) => {
            let approved = spec.approves(&option_id);
            (approved, Value::string(option_id))
        }
        None => {
            let action = spec.timeout_action.unwrap_or(TimeoutAction::Reject);
            tracing::info!(node_id, ?action, "approval timed out");
            (action == TimeoutAction::Approve, Value::Null)
        }
    };

    env.progress.set_status(ExecutionStatus::Running);
    env.events.emit(ExecutionEvent::Resumed {
        node_id: node_id.to_string(),
        at: Utc::now(),
    });
    env.progress.save_now().await;

    let taken = if approved {
        node.then.iter().cloned().collect()
    } else {
        node.r#else.iter().cloned().collect()
    };

    Ok(NodeResult {
        input: Value::Null,
        output: Some(output),
        sets: Object::new(),
        taken: Some(taken),
    })
}
