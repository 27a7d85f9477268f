//! In-process approval resolution hub.
//!
//! An approval node registers a waiter keyed by `(execution_id, node_id)`
//! and suspends on the receiver. The out-of-band resolution API feeds the
//! chosen option id through [`ApprovalHub::resolve`]. Crash recovery goes
//! through the persisted `PendingApproval` records instead.

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Default)]
pub struct ApprovalHub {
    waiters: DashMap<(Uuid, String), oneshot::Sender<String>>,
}

impl ApprovalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for an approval node. A previous waiter for the
    /// same key is dropped (its execution is gone or superseded).
    pub fn register(&self, execution_id: Uuid, node_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert((execution_id, node_id.to_string()), tx);
        rx
    }

    /// Resolve a pending approval with the chosen option id.
    pub fn resolve(
        &self,
        execution_id: Uuid,
        node_id: &str,
        option_id: impl Into<String>,
    ) -> EngineResult<()> {
        let (_, sender) = self
            .waiters
            .remove(&(execution_id, node_id.to_string()))
            .ok_or_else(|| {
                EngineError::State(format!(
                    "no pending approval for execution {} node '{}'",
                    execution_id, node_id
                ))
            })?;
        sender.send(option_id.into()).map_err(|_| {
            EngineError::State("approval waiter dropped before resolution".to_string())
        })
    }

    /// Drop a waiter without resolving (timeout or cancellation path).
    pub fn unregister(&self, execution_id: Uuid, node_id: &str) {
        self.waiters.remove(&(execution_id, node_id.to_string()));
    }
}
