//! Orchestrator (C6): spawns, supervises, times out, and garbage
//! collects Review Agents, enforcing one active agent per PR.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use reviewbot_core::{AgentStatus, CancelToken, Database, PrEvent, Result};

use crate::agent::{ReviewAgent, ReviewAgentDeps, RunOutcome};

const CLAIM_HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);
const SUPERVISOR_TICK: Duration = Duration::from_secs(1);

/// A live cancellation handle for one running agent, held by the orchestrator
/// so the supervisor and dispatcher can signal it without touching C2.
struct RunningAgent {
    cancel: CancelToken,
}

pub struct Orchestrator {
    database: Arc<Database>,
    deps_factory: Arc<dyn Fn() -> ReviewAgentDeps + Send + Sync>,
    running: Mutex<std::collections::HashMap<i64, RunningAgent>>,
    worker_count: usize,
}

impl Orchestrator {
    pub fn new(
        database: Arc<Database>,
        deps_factory: Arc<dyn Fn() -> ReviewAgentDeps + Send + Sync>,
        worker_count: usize,
    ) -> Self {
        Self {
            database,
            deps_factory,
            running: Mutex::new(std::collections::HashMap::new()),
            worker_count,
        }
    }

    /// Scans `running` agent records left over from a prior process (spec
    /// §4.3 point 4: "Recover on boot"). Expired ones are marked `timeout`
    /// and their claims released; the rest are left for the queue's own
    /// redelivery-on-expired-visibility to pick back up.
    pub async fn recover_on_boot(&self) -> Result<()> {
        let now = chrono::Utc::now();
        for agent_id in self.database.due_timeouts(now).await? {
            if let Ok(record) = self.database.get_agent(&agent_id).await {
                if record.status == AgentStatus::Running {
                    warn!(agent_id, pr_id = record.pr_id, "recovering stale running agent");
                    let _ = self
                        .database
                        .finish_agent(&agent_id, AgentStatus::Timeout, Some("recovered on boot"))
                        .await;
                    let _ = self.database.release_pr(record.pr_id).await;
                    let _ = self.database.cancel_timeout(&agent_id).await;
                }
            }
        }
        Ok(())
    }

    /// Runs `worker_count` dispatch loops until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut workers = Vec::new();
        for worker_id in 0..self.worker_count {
            let orchestrator = self.clone();
            workers.push(tokio::spawn(async move {
                orchestrator.dispatch_loop(format!("worker-{worker_id}")).await;
            }));
        }
        let supervisor = self.clone();
        let supervisor_handle = tokio::spawn(async move { supervisor.supervisor_loop().await });

        let _ = (&mut shutdown).await;
        supervisor_handle.abort();
        for w in workers {
            w.abort();
        }
    }

    async fn dispatch_loop(&self, worker_id: String) {
        loop {
            match self.database.dequeue(&worker_id).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.handle_job(job.event.clone()).await {
                        warn!(error = %e, "job dispatch failed");
                        let _ = self.database.release(job.queue_id, Duration::from_secs(5)).await;
                        continue;
                    }
                    let _ = self.database.ack(job.queue_id).await;
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(200)).await,
                Err(e) => {
                    warn!(error = %e, "dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_job(&self, event: PrEvent) -> Result<()> {
        let agent_id = Uuid::new_v4().to_string();

        if !self.database.claim_pr(event.pr_id, &agent_id).await? {
            self.preempt_previous(event.pr_id).await;
            if !self.database.claim_pr(event.pr_id, &agent_id).await? {
                info!(pr_id = event.pr_id, "claim still held after preemption wait; skipping");
                return Ok(());
            }
        }

        let cancel = CancelToken::new();
        {
            let mut running = self.running.lock().await;
            running.insert(event.pr_id, RunningAgent { cancel: cancel.clone() });
        }

        let agent = ReviewAgent::new((self.deps_factory)(), &event, cancel);
        let pr_id = event.pr_id;
        let outcome: RunOutcome = agent.run(event).await;
        info!(agent_id = outcome.agent_id, pr_id, status = ?outcome.status, "agent finished");

        self.running.lock().await.remove(&pr_id);
        Ok(())
    }

    /// Signals the previous agent for `pr_id` to cancel and waits up to
    /// [`CLAIM_HANDOFF_TIMEOUT`] for it to release its claim before forcing a
    /// release (spec: `STALE_AGENT_KILLED`).
    async fn preempt_previous(&self, pr_id: i64) {
        let cancel = {
            let running = self.running.lock().await;
            running.get(&pr_id).map(|r| r.cancel.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + CLAIM_HANDOFF_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.database.claim_pr(pr_id, "probe").await.unwrap_or(false) {
                let _ = self.database.release_pr(pr_id).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        warn!(pr_id, "STALE_AGENT_KILLED: forcing claim release after handoff timeout");
        let _ = self.database.release_pr(pr_id).await;
    }

    async fn supervisor_loop(&self) {
        loop {
            tokio::time::sleep(SUPERVISOR_TICK).await;
            let now = chrono::Utc::now();
            let Ok(due) = self.database.due_timeouts(now).await else {
                continue;
            };
            for agent_id in due {
                let Ok(record) = self.database.get_agent(&agent_id).await else {
                    continue;
                };
                if record.status != AgentStatus::Running {
                    let _ = self.database.cancel_timeout(&agent_id).await;
                    continue;
                }
                let running = self.running.lock().await;
                if let Some(entry) = running.get(&record.pr_id) {
                    entry.cancel.cancel();
                }
            }
        }
    }
}
