//! AgentRegistry — the connected-agent table behind [`AgentChannel`].
//!
//! An agent's control connection registers here and receives an mpsc
//! receiver; dispatched tasks arrive on it as [`AgentMessage`]s. Agents
//! report their load with [`AgentRegistry::heartbeat`], which is also what
//! keeps the hosting pod's heartbeat fresh in the capacity pool.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use runplane_capacity::{BoxFuture, CapacityPool};
use runplane_scheduler::{AgentAction, AgentChannel, ConnectedAgent};
use runplane_state::{AgentId, PoolId, TaskId, TaskKind, WorkspaceId};

/// Buffered messages per agent before `send_task` waits.
const AGENT_CHANNEL_CAPACITY: usize = 16;

/// Plans an agent runs concurrently unless it reports otherwise.
pub const DEFAULT_PLAN_LIMIT: u32 = 3;

/// A task handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub task_id: TaskId,
    pub workspace_id: WorkspaceId,
    pub action: AgentAction,
}

/// Load last reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStatus {
    pub plan_running: u32,
    pub plan_limit: u32,
    pub apply_running: bool,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            plan_running: 0,
            plan_limit: DEFAULT_PLAN_LIMIT,
            apply_running: false,
        }
    }
}

struct Connection {
    pool_id: Option<PoolId>,
    pod_name: Option<String>,
    status: AgentStatus,
    sender: mpsc::Sender<AgentMessage>,
}

pub struct AgentRegistry {
    capacity: Arc<CapacityPool>,
    agents: RwLock<HashMap<AgentId, Connection>>,
}

impl AgentRegistry {
    pub fn new(capacity: Arc<CapacityPool>) -> Self {
        Self {
            capacity,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register a control connection. A reconnecting agent replaces its
    /// previous connection.
    ///
    /// Agents running in a managed pod pass the pod name so the pod's slots
    /// become reachable through this agent.
    pub async fn connect(
        &self,
        agent_id: &str,
        pool_id: Option<PoolId>,
        pod_name: Option<&str>,
    ) -> anyhow::Result<mpsc::Receiver<AgentMessage>> {
        if let Some(pod_name) = pod_name {
            self.capacity.register_agent(pod_name, agent_id).await?;
        }
        let (sender, receiver) = mpsc::channel(AGENT_CHANNEL_CAPACITY);
        let previous = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                agent_id.to_string(),
                Connection {
                    pool_id: pool_id.clone(),
                    pod_name: pod_name.map(str::to_string),
                    status: AgentStatus::default(),
                    sender,
                },
            );
        if previous.is_some() {
            info!(%agent_id, "agent reconnected, previous connection replaced");
        } else {
            info!(%agent_id, pool_id = ?pool_id, pod_name = ?pod_name, "agent connected");
        }
        Ok(receiver)
    }

    pub fn disconnect(&self, agent_id: &str) -> bool {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id)
            .is_some();
        if removed {
            info!(%agent_id, "agent disconnected");
        }
        removed
    }

    /// Record the agent's reported load and refresh its pod's heartbeat.
    pub async fn heartbeat(&self, agent_id: &str, status: AgentStatus) -> anyhow::Result<()> {
        let pod_name = {
            let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
            let Some(conn) = agents.get_mut(agent_id) else {
                anyhow::bail!("agent {agent_id} is not connected");
            };
            conn.status = status;
            conn.pod_name.clone()
        };
        if let Some(pod_name) = pod_name {
            self.capacity.update_heartbeat(&pod_name).await?;
        }
        debug!(%agent_id, plan_running = status.plan_running, apply_running = status.apply_running, "agent heartbeat");
        Ok(())
    }

    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .map(|c| c.status)
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AgentChannel for AgentRegistry {
    fn connected_agents(&self) -> Vec<ConnectedAgent> {
        let mut agents: Vec<ConnectedAgent> = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(agent_id, conn)| ConnectedAgent {
                agent_id: agent_id.clone(),
                pool_id: conn.pool_id.clone(),
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Plans and drift checks share the plan limit; PlanAndApply needs the
    /// agent's single apply slot.
    fn is_agent_available(&self, agent_id: &str, kind: TaskKind) -> bool {
        let Some(status) = self.status(agent_id) else {
            return false;
        };
        match kind {
            TaskKind::Plan | TaskKind::DriftCheck => status.plan_running < status.plan_limit,
            TaskKind::PlanAndApply => !status.apply_running,
        }
    }

    fn send_task<'a>(
        &'a self,
        agent_id: &'a str,
        task_id: TaskId,
        workspace_id: &'a str,
        action: AgentAction,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let sender = self
                .agents
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(agent_id)
                .map(|c| c.sender.clone());
            let Some(sender) = sender else {
                anyhow::bail!("agent {agent_id} is not connected");
            };

            let message = AgentMessage {
                task_id,
                workspace_id: workspace_id.to_string(),
                action,
            };
            if sender.send(message).await.is_err() {
                warn!(%agent_id, task_id, "agent connection closed during send");
                self.disconnect(agent_id);
                anyhow::bail!("agent {agent_id} connection closed");
            }
            debug!(%agent_id, task_id, %workspace_id, %action, "task sent to agent");
            Ok(())
        })
    }
}
