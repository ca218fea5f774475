// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Core assembly: wiring, lifecycle and the shared runtime handles.
//!
//! `Core` owns the bus, the router loop, the per-session workers, the GC
//! sweeper and the optional system-tick driver. Everything is cooperative:
//! tasks suspend only on channel reads, sleeps and the orchestrator call,
//! and every task watches a cancellation token so shutdown converges
//! within a bounded grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use cortex_protocol::Actor;
use cortex_protocol::Observation;
use cortex_protocol::Payload;
use cortex_protocol::SchedulePayload;
use cortex_protocol::SourceKind;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bus::InputBus;
use crate::bus::PublishOutcome;
use crate::config_provider::GateConfigProvider;
use crate::egress::EgressHub;
use crate::error::Result;
use crate::gate::Gate;
use crate::gate::types::SystemHealth;
use crate::memory::FailOpenMemory;
use crate::memory::MemoryService;
use crate::memory::NoopMemory;
use crate::nociception::Nociception;
use crate::nociception::NociceptionSnapshot;
use crate::orchestrator::AgentOrchestrator;
use crate::orchestrator::DefaultAgentOrchestrator;
use crate::reflex::ReflexConfig;
use crate::reflex::ReflexController;
use crate::router::MessageRouting;
use crate::router::RouterOptions;
use crate::router::SessionRouter;
use crate::session_state::SessionState;
use crate::session_state::SessionStateStore;
use crate::worker::SessionWorker;

pub const SYSTEM_TICK_SCHEDULE_ID: &str = "system_tick";

#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub bus_capacity: usize,
    pub inbox_capacity: usize,
    pub system_session_key: String,
    pub default_session_key: String,
    pub message_routing: MessageRouting,
    pub enable_system_fanout: bool,
    pub enable_session_gc: bool,
    pub idle_ttl: Duration,
    pub gc_sweep_interval: Duration,
    /// When set, the core publishes a `system_tick` SCHEDULE to the system
    /// session on this cadence and feeds bus drop growth to nociception.
    pub tick_interval: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            inbox_capacity: 256,
            system_session_key: "system".to_string(),
            default_session_key: "default".to_string(),
            message_routing: MessageRouting::User,
            enable_system_fanout: false,
            enable_session_gc: true,
            idle_ttl: Duration::from_secs(900),
            gc_sweep_interval: Duration::from_secs(60),
            tick_interval: None,
            shutdown_grace: Duration::from_millis(1500),
        }
    }
}

/// Process-wide engine counters. The bus, router, gate and memory wrapper
/// keep their own; these cover the assembly itself.
#[derive(Default)]
pub struct CoreMetrics {
    routed_total: AtomicU64,
    sessions_gc_total: AtomicU64,
    agent_invocations_total: AtomicU64,
    agent_errors_total: AtomicU64,
    fanout_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreMetricsSnapshot {
    pub routed_total: u64,
    pub sessions_gc_total: u64,
    pub agent_invocations_total: u64,
    pub agent_errors_total: u64,
    pub fanout_total: u64,
}

impl CoreMetrics {
    pub(crate) fn inc_routed(&self) {
        self.routed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_sessions_gc(&self) {
        self.sessions_gc_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_agent_invocations(&self) {
        self.agent_invocations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_agent_errors(&self) {
        self.agent_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_fanout(&self, n: u64) {
        self.fanout_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoreMetricsSnapshot {
        CoreMetricsSnapshot {
            routed_total: self.routed_total.load(Ordering::Relaxed),
            sessions_gc_total: self.sessions_gc_total.load(Ordering::Relaxed),
            agent_invocations_total: self.agent_invocations_total.load(Ordering::Relaxed),
            agent_errors_total: self.agent_errors_total.load(Ordering::Relaxed),
            fanout_total: self.fanout_total.load(Ordering::Relaxed),
        }
    }
}

/// Externally supplied health signal read by the gate's overload bypass.
#[derive(Default)]
pub struct SystemHealthFlag {
    overload: AtomicBool,
}

impl SystemHealthFlag {
    pub fn set_overload(&self, overload: bool) {
        self.overload.store(overload, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SystemHealth {
        SystemHealth {
            overload: self.overload.load(Ordering::Relaxed),
        }
    }
}

struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct Shared {
    options: Arc<CoreOptions>,
    bus: Arc<InputBus>,
    router: Arc<SessionRouter>,
    states: Arc<SessionStateStore>,
    gate: Arc<Gate>,
    config: Arc<GateConfigProvider>,
    orchestrator: Arc<dyn AgentOrchestrator>,
    memory: Arc<FailOpenMemory>,
    egress: Option<Arc<EgressHub>>,
    nociception: Arc<Mutex<Nociception>>,
    reflex: Arc<Mutex<ReflexController>>,
    metrics: Arc<CoreMetrics>,
    health: Arc<SystemHealthFlag>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

#[derive(Default)]
pub struct CoreBuilder {
    options: CoreOptions,
    config: Option<Arc<GateConfigProvider>>,
    orchestrator: Option<Arc<dyn AgentOrchestrator>>,
    memory: Option<Arc<dyn MemoryService>>,
    egress: Option<Arc<EgressHub>>,
    reflex: Option<ReflexConfig>,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: CoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config_provider(mut self, config: Arc<GateConfigProvider>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn orchestrator(mut self, orchestrator: Arc<dyn AgentOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn egress(mut self, egress: Arc<EgressHub>) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn reflex_config(mut self, reflex: ReflexConfig) -> Self {
        self.reflex = Some(reflex);
        self
    }

    pub fn build(self) -> Core {
        let options = Arc::new(self.options);
        let config = self
            .config
            .unwrap_or_else(|| Arc::new(GateConfigProvider::default()));
        let reflex = ReflexController::new(
            config.clone(),
            self.reflex.unwrap_or_default(),
            options.system_session_key.clone(),
        );
        let router = SessionRouter::new(RouterOptions {
            inbox_capacity: options.inbox_capacity,
            system_session_key: options.system_session_key.clone(),
            default_session_key: options.default_session_key.clone(),
            message_routing: options.message_routing,
        });

        let shared = Arc::new(Shared {
            bus: Arc::new(InputBus::new(options.bus_capacity)),
            router: Arc::new(router),
            states: Arc::new(SessionStateStore::new()),
            gate: Arc::new(Gate::new()),
            config,
            orchestrator: self
                .orchestrator
                .unwrap_or_else(|| Arc::new(DefaultAgentOrchestrator::new())),
            memory: Arc::new(FailOpenMemory::new(
                self.memory.unwrap_or_else(|| Arc::new(NoopMemory)),
            )),
            egress: self.egress,
            nociception: Arc::new(Mutex::new(Nociception::new())),
            reflex: Arc::new(Mutex::new(reflex)),
            metrics: Arc::new(CoreMetrics::default()),
            health: Arc::new(SystemHealthFlag::default()),
            workers: Mutex::new(HashMap::new()),
            options,
        });

        Core {
            shared,
            tasks: Mutex::new(Vec::new()),
            root_cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }
}

pub struct Core {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    root_cancel: CancellationToken,
    started: AtomicBool,
}

impl Core {
    pub fn builder() -> CoreBuilder {
        CoreBuilder::new()
    }

    /// Spawn the router loop, the GC sweeper and the optional tick driver.
    /// Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("core starting");

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(route_loop(self.shared.clone())));

        if self.shared.options.enable_session_gc {
            tasks.push(tokio::spawn(gc_loop(
                self.shared.clone(),
                self.root_cancel.clone(),
            )));
        }
        if self.shared.options.tick_interval.is_some() {
            tasks.push(tokio::spawn(tick_loop(
                self.shared.clone(),
                self.root_cancel.clone(),
            )));
        }
    }

    /// Close the bus, stop the periodic tasks and cancel every worker,
    /// joining everything within the configured grace period. Overrun is
    /// logged, not fatal.
    pub async fn shutdown(&self) -> Result<()> {
        info!("core shutting down");
        self.shared.bus.close();
        self.root_cancel.cancel();

        let grace = self.shared.options.shutdown_grace;
        let mut overrun = false;
        let system_tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        if timeout(grace, join_all(system_tasks)).await.is_err() {
            warn!("system tasks did not stop within {grace:?}");
            overrun = true;
        }

        let workers: Vec<WorkerHandle> = {
            let mut map = self.shared.workers.lock().unwrap();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for worker in &workers {
            worker.cancel.cancel();
        }
        let handles: Vec<JoinHandle<()>> = workers.into_iter().map(|w| w.handle).collect();
        if timeout(grace, join_all(handles)).await.is_err() {
            warn!("workers did not stop within {grace:?}");
            overrun = true;
        }

        self.shared.memory.close().await;
        if overrun {
            return Err(crate::error::CoreErr::ShutdownTimeout(grace));
        }
        Ok(())
    }

    pub fn publish(&self, obs: Observation) -> PublishOutcome {
        self.shared.bus.publish_nowait(obs)
    }

    pub fn bus(&self) -> &Arc<InputBus> {
        &self.shared.bus
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.shared.router
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.shared.gate
    }

    pub fn config_provider(&self) -> &Arc<GateConfigProvider> {
        &self.shared.config
    }

    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.shared.metrics
    }

    pub fn memory(&self) -> &Arc<FailOpenMemory> {
        &self.shared.memory
    }

    pub fn set_overload(&self, overload: bool) {
        self.shared.health.set_overload(overload);
    }

    pub fn nociception_snapshot(&self) -> NociceptionSnapshot {
        self.shared.nociception.lock().unwrap().snapshot()
    }

    pub fn session_state(&self, session_key: &str) -> Option<SessionState> {
        self.shared
            .states
            .get(session_key)
            .map(|state| state.lock().unwrap().clone())
    }

    pub fn has_session(&self, session_key: &str) -> bool {
        self.shared.states.contains(session_key)
    }
}

async fn route_loop(shared: Arc<Shared>) {
    while let Some(obs) = shared.bus.recv().await {
        shared.metrics.inc_routed();
        let dispatch = shared.router.dispatch(obs);
        if dispatch.created {
            spawn_worker(&shared, &dispatch.session_key);
        }
    }
    debug!("route loop finished");
}

fn spawn_worker(shared: &Arc<Shared>, session_key: &str) {
    let Some(inbox) = shared.router.inbox(session_key) else {
        return;
    };
    let state = shared.states.get_or_create(session_key, Utc::now());
    let cancel = CancellationToken::new();

    let worker = SessionWorker {
        session_key: session_key.to_string(),
        inbox,
        state,
        bus: shared.bus.clone(),
        router: shared.router.clone(),
        gate: shared.gate.clone(),
        config: shared.config.clone(),
        orchestrator: shared.orchestrator.clone(),
        memory: shared.memory.clone(),
        egress: shared.egress.clone(),
        nociception: shared.nociception.clone(),
        reflex: shared.reflex.clone(),
        metrics: shared.metrics.clone(),
        options: shared.options.clone(),
        health: shared.health.clone(),
        cancel: cancel.clone(),
    };
    let handle = tokio::spawn(worker.run());

    let mut workers = shared.workers.lock().unwrap();
    if let Some(stale) = workers.insert(session_key.to_string(), WorkerHandle { cancel, handle }) {
        // A GC race can leave a finished handle behind; replace it.
        stale.cancel.cancel();
    }
}

async fn gc_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let idle_ttl = chrono::Duration::from_std(shared.options.idle_ttl)
        .unwrap_or(chrono::Duration::MAX);
    let mut ticker = interval(shared.options.gc_sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let idle = shared.states.idle_sessions(
            Utc::now(),
            idle_ttl,
            &shared.options.system_session_key,
        );
        if idle.is_empty() {
            continue;
        }

        let mut cancelled = Vec::new();
        for session_key in &idle {
            let handle = shared.workers.lock().unwrap().remove(session_key);
            if let Some(handle) = handle {
                handle.cancel.cancel();
                cancelled.push(handle.handle);
            }
            shared.router.remove_session(session_key);
            shared.states.remove(session_key);
            shared.metrics.inc_sessions_gc();
            debug!(session_key = %session_key, "session garbage collected");
        }
        // Workers cancel between inbox items; give them a bounded join.
        let _ = timeout(Duration::from_millis(500), join_all(cancelled)).await;
    }
}

async fn tick_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let Some(period) = shared.options.tick_interval else {
        return;
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Utc::now();
        {
            let mut noci = shared.nociception.lock().unwrap();
            noci.on_tick(shared.bus.dropped_total(), now);
        }
        shared.config.reload_if_changed();

        let tick = Observation::new(
            "system_tick",
            SourceKind::Internal,
            Actor::system("system"),
            Payload::Schedule(SchedulePayload {
                schedule_id: SYSTEM_TICK_SCHEDULE_ID.to_string(),
                data: HashMap::new(),
            }),
        )
        .with_session_key(&shared.options.system_session_key);
        shared.bus.publish_nowait(tick);
    }
}
