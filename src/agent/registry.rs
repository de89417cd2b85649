//! Agent Registry
//!
//! Owns every configured agent and its running tasks:
//! - add/remove agent bundles keyed by id
//! - start an agent's stream connector and decision loop
//! - stop cooperatively: the in-flight cycle finishes, then the lease is revoked
//! - status views for listing

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{
    AgentConfig, AppConfig, CacheConfig, DecisionConfig, RiskConfig, StorageConfig, StreamConfig,
};
use crate::coordination::StopSignal;
use crate::decision::{
    AuditSink, CandidatePool, DecisionProvider, HttpCandidatePool, HttpDecisionProvider,
    JsonFileAuditSink, LogAuditSink, StaticCandidatePool,
};
use crate::error::{Result, TraderError};
use crate::exchange::{build_venue, ExchangeKind, Venue};
use crate::persistence::AgentStore;
use crate::portfolio::{PerformanceTracker, PositionLedger};
use crate::state::StateCache;
use crate::stream::{ConnectorHandle, ConnectorState, StreamConnector};

use super::decision_loop::{AgentState, Collaborators, CycleSummary, DecisionLoop, LoopSettings};

/// Process-wide settings shared by every agent
#[derive(Debug, Clone, Default)]
pub struct RegistrySettings {
    pub stream: StreamConfig,
    pub cache: CacheConfig,
    pub decision: DecisionConfig,
    pub risk: RiskConfig,
    pub storage: StorageConfig,
}

impl From<&AppConfig> for RegistrySettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            stream: config.stream.clone(),
            cache: config.cache.clone(),
            decision: config.decision.clone(),
            risk: config.risk.clone(),
            storage: config.storage.clone(),
        }
    }
}

/// Everything needed to start one agent
#[derive(Clone)]
pub struct AgentSpec {
    pub config: AgentConfig,
    pub venue: Venue,
    pub provider: Arc<dyn DecisionProvider>,
    pub candidates: Arc<dyn CandidatePool>,
    /// Sinks in addition to the log sink and the configured audit dir
    pub audit: Vec<Arc<dyn AuditSink>>,
}

impl AgentSpec {
    /// Build collaborators from configuration.
    ///
    /// Missing credentials fail here, before any cycle runs.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let venue = build_venue(&config.exchange)?;
        let provider: Arc<dyn DecisionProvider> =
            Arc::new(HttpDecisionProvider::new(&config.provider)?);

        let fallback = StaticCandidatePool::new(&config.candidates.instruments);
        let candidates: Arc<dyn CandidatePool> = match &config.candidates.pool_url {
            Some(url) => Arc::new(HttpCandidatePool::new(url.clone(), fallback)?),
            None => Arc::new(fallback),
        };

        Ok(Self {
            config,
            venue,
            provider,
            candidates,
            audit: Vec::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}

impl std::fmt::Debug for AgentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSpec")
            .field("id", &self.config.id)
            .field("venue", &self.venue)
            .finish()
    }
}

/// Point-in-time view of one agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub id: String,
    pub name: String,
    pub exchange: ExchangeKind,
    pub running: bool,
    /// Stopped, but the last cycle outlived the stop timeout and is still running
    pub draining: bool,
    pub connector: Option<ConnectorState>,
    pub started_at: Option<DateTime<Utc>>,
    pub cycles_run: u64,
    pub open_positions: usize,
    pub last_cycle: Option<CycleSummary>,
}

struct RunningAgent {
    decision: Arc<DecisionLoop>,
    loop_stop: StopSignal,
    loop_task: JoinHandle<()>,
    connector_stop: StopSignal,
    connector: ConnectorHandle,
    started_at: DateTime<Utc>,
}

impl RunningAgent {
    /// Let the in-flight cycle finish, then close the stream (revoking the
    /// lease). Past `limit` the cycle is left to finish on its own and its
    /// task is returned.
    async fn shutdown(self, limit: Duration) -> Option<JoinHandle<()>> {
        let agent = self.decision.agent_id().to_string();
        self.loop_stop.trigger();

        let mut loop_task = self.loop_task;
        let draining = match tokio::time::timeout(limit, &mut loop_task).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                error!(agent = %agent, error = %e, "decision loop task failed");
                None
            }
            Err(_) => {
                warn!(
                    agent = %agent,
                    limit_secs = limit.as_secs(),
                    "cycle still running after stop timeout, closing stream anyway"
                );
                Some(loop_task)
            }
        };

        self.connector_stop.trigger();
        if let Err(e) = self.connector.task.await {
            error!(agent = %agent, error = %e, "stream connector task failed");
        }
        info!(agent = %agent, "agent stopped");
        draining
    }
}

struct AgentSlot {
    spec: AgentSpec,
    running: Option<RunningAgent>,
    /// Loop of the most recent run, kept for status after stop
    last_loop: Option<Arc<DecisionLoop>>,
    /// Set while `stop` is winding the agent down
    stopping: bool,
    /// Loop task that outlived the stop timeout
    draining: Option<JoinHandle<()>>,
}

impl AgentSlot {
    fn is_draining(&self) -> bool {
        self.draining
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// A new run may not start while any task of the previous one is alive.
    fn is_busy(&self) -> bool {
        self.running.is_some() || self.stopping || self.is_draining()
    }
}

/// Explicitly owned collection of agents
pub struct AgentRegistry {
    settings: RegistrySettings,
    agents: RwLock<HashMap<String, AgentSlot>>,
}

impl AgentRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            settings,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub async fn add(&self, spec: AgentSpec) -> Result<()> {
        let id = spec.id().to_string();
        let mut agents = self.agents.write().await;
        if agents.contains_key(&id) {
            return Err(TraderError::AgentExists(id));
        }
        info!(agent = %id, exchange = %spec.venue.exchange.kind(), "agent registered");
        agents.insert(
            id,
            AgentSlot {
                spec,
                running: None,
                last_loop: None,
                stopping: false,
                draining: None,
            },
        );
        Ok(())
    }

    /// Remove a stopped agent.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut agents = self.agents.write().await;
        match agents.get(id) {
            None => Err(TraderError::AgentNotFound(id.to_string())),
            Some(slot) if slot.is_busy() => Err(TraderError::AgentRunning(id.to_string())),
            Some(_) => {
                agents.remove(id);
                info!(agent = %id, "agent removed");
                Ok(())
            }
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.agents
            .read()
            .await
            .get(id)
            .map(|slot| slot.running.is_some())
            .unwrap_or(false)
    }

    pub async fn list(&self) -> Vec<AgentStatus> {
        let agents = self.agents.read().await;
        let mut statuses = Vec::with_capacity(agents.len());
        for slot in agents.values() {
            statuses.push(Self::status_of(slot).await);
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub async fn status(&self, id: &str) -> Result<AgentStatus> {
        let agents = self.agents.read().await;
        let slot = agents
            .get(id)
            .ok_or_else(|| TraderError::AgentNotFound(id.to_string()))?;
        Ok(Self::status_of(slot).await)
    }

    async fn status_of(slot: &AgentSlot) -> AgentStatus {
        let decision = slot
            .running
            .as_ref()
            .map(|r| &r.decision)
            .or(slot.last_loop.as_ref());

        let (cycles_run, open_positions, last_cycle) = match decision {
            Some(decision) => (
                decision.cycles_run(),
                decision.ledger().len().await,
                decision.last_cycle().await,
            ),
            None => (0, 0, None),
        };

        AgentStatus {
            id: slot.spec.config.id.clone(),
            name: slot.spec.config.display_name().to_string(),
            exchange: slot.spec.venue.exchange.kind(),
            running: slot.running.is_some(),
            draining: slot.is_draining(),
            connector: slot.running.as_ref().map(|r| r.connector.current()),
            started_at: slot.running.as_ref().map(|r| r.started_at),
            cycles_run,
            open_positions,
            last_cycle,
        }
    }

    /// Launch the agent's stream connector and decision loop.
    pub async fn start(&self, id: &str) -> Result<()> {
        let mut agents = self.agents.write().await;
        let slot = agents
            .get_mut(id)
            .ok_or_else(|| TraderError::AgentNotFound(id.to_string()))?;
        if slot.is_busy() {
            return Err(TraderError::AgentRunning(id.to_string()));
        }

        let running = self.launch(&slot.spec).await?;
        slot.draining = None;
        slot.last_loop = Some(running.decision.clone());
        slot.running = Some(running);
        Ok(())
    }

    /// Start every registered agent that is not running; returns how many started.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for id in self.ids().await {
            if self.is_running(&id).await {
                continue;
            }
            match self.start(&id).await {
                Ok(()) => started += 1,
                Err(e) => error!(agent = %id, error = %e, "failed to start agent"),
            }
        }
        started
    }

    async fn launch(&self, spec: &AgentSpec) -> Result<RunningAgent> {
        let id = spec.config.id.clone();
        let storage = &self.settings.storage;

        let store = storage
            .data_dir
            .as_ref()
            .map(|dir| AgentStore::new(dir, &id));
        let (ledger, tracker) = match &store {
            Some(store) => {
                let entries = store.load_ledger().await?;
                let trades = store.load_trades().await?;
                info!(agent = %id, ledger = entries.len(), trades = trades.len(), "restored agent state");
                (
                    PositionLedger::from_entries(entries),
                    PerformanceTracker::from_records(trades),
                )
            }
            None => (PositionLedger::new(), PerformanceTracker::new()),
        };

        let exchange = spec.venue.exchange.clone();
        let cache = Arc::new(StateCache::new(exchange.clone(), self.settings.cache.ttl()));
        let (orders_tx, orders_rx) = StreamConnector::order_channel(&self.settings.stream);
        let connector = StreamConnector::new(
            id.clone(),
            exchange.clone(),
            cache.clone(),
            self.settings.stream.clone(),
            orders_tx,
        );

        let mut audit: Vec<Arc<dyn AuditSink>> = vec![Arc::new(LogAuditSink)];
        if let Some(dir) = &storage.audit_dir {
            audit.push(Arc::new(JsonFileAuditSink::new(dir, &id)));
        }
        audit.extend(spec.audit.iter().cloned());

        let settings = LoopSettings::from_config(
            &self.settings.decision,
            &self.settings.risk,
            spec.config.interval_secs,
        );
        let state = AgentState {
            exchange: exchange.clone(),
            cache,
            ledger: Arc::new(ledger),
            tracker: Arc::new(tracker),
        };
        let collaborators = Collaborators {
            provider: spec.provider.clone(),
            market: spec.venue.market.clone(),
            candidates: spec.candidates.clone(),
            audit,
        };
        let mut decision = DecisionLoop::new(id.clone(), settings, state, collaborators, orders_rx);
        if let Some(store) = store {
            decision = decision.with_store(store);
        }
        let decision = Arc::new(decision);

        let connector_stop = StopSignal::new();
        let connector = ConnectorHandle::spawn(connector, connector_stop.clone());
        let loop_stop = StopSignal::new();
        let loop_task = tokio::spawn(decision.clone().run(loop_stop.clone()));

        info!(agent = %id, exchange = %exchange.kind(), "agent started");
        Ok(RunningAgent {
            decision,
            loop_stop,
            loop_task,
            connector_stop,
            connector,
            started_at: Utc::now(),
        })
    }

    /// Stop an agent and wait for it to wind down. Stopping a stopped agent is a no-op.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let running = {
            let mut agents = self.agents.write().await;
            let slot = agents
                .get_mut(id)
                .ok_or_else(|| TraderError::AgentNotFound(id.to_string()))?;
            match slot.running.take() {
                Some(running) => {
                    slot.stopping = true;
                    running
                }
                None => return Ok(()),
            }
        };

        info!(agent = %id, "stopping agent");
        let draining = running.shutdown(self.settings.decision.stop_timeout()).await;
        self.finish_stop(id, draining).await;
        Ok(())
    }

    async fn finish_stop(&self, id: &str, draining: Option<JoinHandle<()>>) {
        if let Some(slot) = self.agents.write().await.get_mut(id) {
            slot.stopping = false;
            slot.draining = draining;
        }
    }

    /// Apply the audit retention to every registered agent. Returns how many
    /// records were deleted.
    pub async fn prune_audit(&self) -> usize {
        let storage = &self.settings.storage;
        let (Some(dir), Some(days)) = (&storage.audit_dir, storage.audit_retention_days) else {
            return 0;
        };

        let mut removed = 0;
        for id in self.ids().await {
            match JsonFileAuditSink::new(dir, &id).prune_older_than(days).await {
                Ok(count) => removed += count,
                Err(e) => warn!(agent = %id, error = %e, "audit pruning failed"),
            }
        }
        removed
    }

    /// Stop all running agents concurrently.
    pub async fn stop_all(&self) {
        let running: Vec<(String, RunningAgent)> = {
            let mut agents = self.agents.write().await;
            agents
                .iter_mut()
                .filter_map(|(id, slot)| {
                    let running = slot.running.take()?;
                    slot.stopping = true;
                    Some((id.clone(), running))
                })
                .collect()
        };
        if running.is_empty() {
            return;
        }

        info!(count = running.len(), "stopping all agents");
        let limit = self.settings.decision.stop_timeout();
        let stopped = futures::future::join_all(
            running
                .into_iter()
                .map(|(id, r)| async move { (id, r.shutdown(limit).await) }),
        )
        .await;
        for (id, draining) in stopped {
            self.finish_stop(&id, draining).await;
        }
    }
}
