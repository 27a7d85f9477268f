//! Execution state, snapshots, persistence backends and recovery.
//!
//! A snapshot is one serde-JSON blob keyed by execution ID, sufficient to
//! resume: variables, progress sets, history and pending approvals. Writes
//! are asynchronous but serialised per execution so snapshots cannot land
//! out of order.

use crate::error::{EngineError, EngineResult};
use crate::flow::ApprovalOption;
use async_trait::async_trait;
use cascade_gml::{Object, Value};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Failed, but routed through its `fail` edge.
    FailedHandled,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: NodeState,
    pub input: Value,
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub flow_id: String,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub inputs: Value,
    /// Root context variables at snapshot time.
    pub variables: Object,
    pub completed: BTreeSet<String>,
    pub pending: BTreeSet<String>,
    pub current: BTreeSet<String>,
    pub history: Vec<NodeExecutionRecord>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_node: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionSnapshot {
    pub fn new(execution_id: Uuid, flow_id: &str, tenant_id: &str, inputs: Value) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            flow_id: flow_id.to_string(),
            tenant_id: tenant_id.to_string(),
            status: ExecutionStatus::Pending,
            inputs,
            variables: Object::new(),
            completed: BTreeSet::new(),
            pending: BTreeSet::new(),
            current: BTreeSet::new(),
            history: Vec::new(),
            error: None,
            error_node: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// The state invariants every snapshot must satisfy: completed and
    /// pending are disjoint, and every completed node has a completed
    /// history record.
    pub fn invariants_hold(&self) -> bool {
        self.completed.is_disjoint(&self.pending)
            && self.completed.iter().all(|id| {
                self.history
                    .iter()
                    .any(|r| &r.node_id == id && r.state == NodeState::Completed)
            })
    }
}

/// Suspended approval awaiting an out-of-band resolution, keyed by
/// `(execution_id, node_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub execution_id: Uuid,
    pub node_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub options: Vec<ApprovalOption>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Blob/KV persistence contract. The engine is backend-agnostic; anything
/// that can store a JSON blob per execution qualifies.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn save_snapshot(&self, snapshot: &ExecutionSnapshot) -> EngineResult<()>;

    async fn load_snapshot(&self, execution_id: Uuid) -> EngineResult<Option<ExecutionSnapshot>>;

    /// Executions with status `running` or `paused`, eligible for resume.
    async fn list_recoverable(&self, tenant_id: &str) -> EngineResult<Vec<Uuid>>;

    /// Move a snapshot to history with its final status.
    async fn archive(&self, execution_id: Uuid, final_status: ExecutionStatus) -> EngineResult<()>;

    async fn save_approval(&self, approval: &PendingApproval) -> EngineResult<()>;

    async fn remove_approval(&self, execution_id: Uuid, node_id: &str) -> EngineResult<()>;

    async fn list_approvals(&self, execution_id: Uuid) -> EngineResult<Vec<PendingApproval>>;
}

/// In-memory backend for tests and development.
#[derive(Default)]
pub struct InMemoryBackend {
    snapshots: RwLock<HashMap<Uuid, ExecutionSnapshot>>,
    archived: RwLock<HashMap<Uuid, ExecutionSnapshot>>,
    approvals: RwLock<HashMap<(Uuid, String), PendingApproval>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn save_snapshot(&self, snapshot: &ExecutionSnapshot) -> EngineResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.execution_id, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, execution_id: Uuid) -> EngineResult<Option<ExecutionSnapshot>> {
        Ok(self.snapshots.read().await.get(&execution_id).cloned())
    }

    async fn list_recoverable(&self, tenant_id: &str) -> EngineResult<Vec<Uuid>> {
        Ok(self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && matches!(s.status, ExecutionStatus::Running | ExecutionStatus::Paused)
            })
            .map(|s| s.execution_id)
            .collect())
    }

    async fn archive(&self, execution_id: Uuid, final_status: ExecutionStatus) -> EngineResult<()> {
        let snapshot = self.snapshots.write().await.remove(&execution_id);
        if let Some(mut snapshot) = snapshot {
            snapshot.status = final_status;
            snapshot.updated_at = Utc::now();
            self.archived.write().await.insert(execution_id, snapshot);
        }
        Ok(())
    }

    async fn save_approval(&self, approval: &PendingApproval) -> EngineResult<()> {
        self.approvals.write().await.insert(
            (approval.execution_id, approval.node_id.clone()),
            approval.clone(),
        );
        Ok(())
    }

    async fn remove_approval(&self, execution_id: Uuid, node_id: &str) -> EngineResult<()> {
        self.approvals
            .write()
            .await
            .remove(&(execution_id, node_id.to_string()));
        Ok(())
    }

    async fn list_approvals(&self, execution_id: Uuid) -> EngineResult<Vec<PendingApproval>> {
        Ok(self
            .approvals
            .read()
            .await
            .values()
            .filter(|a| a.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Snapshot after this many completed nodes (plus pause/terminal).
    pub snapshot_interval: u32,
    pub write_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 5,
            write_retries: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Serialises snapshot writes per execution and applies the retry policy.
/// Write failures are logged and retried; they never fail the execution
/// from here (a fatal backend is surfaced by the final await-ed save).
pub struct PersistenceManager {
    backend: Arc<dyn PersistenceBackend>,
    config: PersistenceConfig,
    write_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PersistenceManager {
    pub fn new(backend: Arc<dyn PersistenceBackend>, config: PersistenceConfig) -> Self {
        Self {
            backend,
            config,
            write_locks: DashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), PersistenceConfig::default())
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn should_snapshot(&self, completed_since_last: u32) -> bool {
        completed_since_last >= self.config.snapshot_interval
    }

    fn lock_for(&self, execution_id: Uuid) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(execution_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write a snapshot, serialised against other writes for the same
    /// execution, retrying on failure.
    pub async fn save(&self, snapshot: &ExecutionSnapshot) -> EngineResult<()> {
        let lock = self.lock_for(snapshot.execution_id);
        let _guard = lock.lock().await;

        let mut last_error = None;
        for attempt in 0..=self.config.write_retries {
            match self.backend.save_snapshot(snapshot).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        execution_id = %snapshot.execution_id,
                        attempt,
                        error = %e,
                        "snapshot write failed"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::State("snapshot write failed".to_string())))
    }

    /// Fire-and-forget snapshot write on the background.
    pub fn save_async(self: &Arc<Self>, snapshot: ExecutionSnapshot) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.save(&snapshot).await {
                tracing::error!(
                    execution_id = %snapshot.execution_id,
                    error = %e,
                    "background snapshot write gave up"
                );
            }
        });
    }

    pub async fn load(&self, execution_id: Uuid) -> EngineResult<Option<ExecutionSnapshot>> {
        self.backend.load_snapshot(execution_id).await
    }

    pub async fn list_recoverable(&self, tenant_id: &str) -> EngineResult<Vec<Uuid>> {
        self.backend.list_recoverable(tenant_id).await
    }

    pub async fn archive(
        &self,
        execution_id: Uuid,
        final_status: ExecutionStatus,
    ) -> EngineResult<()> {
        self.write_locks.remove(&execution_id);
        self.backend.archive(execution_id, final_status).await
    }

    pub async fn save_approval(&self, approval: &PendingApproval) -> EngineResult<()> {
        self.backend.save_approval(approval).await
    }

    pub async fn remove_approval(&self, execution_id: Uuid, node_id: &str) -> EngineResult<()> {
        self.backend.remove_approval(execution_id, node_id).await
    }

    pub async fn list_approvals(&self, execution_id: Uuid) -> EngineResult<Vec<PendingApproval>> {
        self.backend.list_approvals(execution_id).await
    }
}
