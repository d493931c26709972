//! Controller mode: directs remote workers and merges their statistics.
//!
//! Workers dial two ports. The command port carries [`ControllerMessage`]s
//! from a per-worker writer task; the stats port (command port + 1) carries
//! registration, readiness, heartbeats and cumulative stats snapshots back.
//! A sweep task marks workers lost once they stop heartbeating.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::WorkerTable;
use crate::config::ControllerSettings;
use crate::errors::{ProtocolError, RunnerError};
use crate::exceptions::{merge_records, ErrorKey, ExceptionRecord};
use crate::protocol::{
    read_message, send_message, stats_port, ControllerMessage, StatsSnapshot, WorkerMessage,
};
use crate::runner::{Runner, RunnerContext};
use crate::state::{RunnerState, StateCell};
use crate::stats::{aggregate_total, merge_entries, StatsEntry, StatsKey};

/// Latest ramp handed to the workers.
#[derive(Debug, Clone, Copy, Default)]
struct RampPlan {
    target_count: usize,
    hatch_rate: f64,
    generation: u64,
}

struct Shared {
    ctx: Arc<RunnerContext>,
    settings: ControllerSettings,
    workers: Mutex<WorkerTable>,
    state: StateCell,
    plan: Mutex<RampPlan>,
    workers_changed: Notify,
}

impl Shared {
    /// Derives the cluster state from the latest worker states.
    ///
    /// Caller holds the worker table lock.
    fn refresh_state_locked(&self, table: &WorkerTable) {
        match self.state.get() {
            RunnerState::Hatching => {
                let generation = self.plan.lock().generation;
                if table.settled_at(generation)
                    && self.state.transition(RunnerState::Hatching, RunnerState::Running)
                {
                    info!(
                        user_count = table.user_count(),
                        generation,
                        "All workers running"
                    );
                }
            }
            RunnerState::Stopping => {
                let drained = table
                    .alive()
                    .all(|n| matches!(n.state, RunnerState::Stopped | RunnerState::Ready));
                if drained && self.state.transition(RunnerState::Stopping, RunnerState::Stopped) {
                    info!("All workers stopped");
                }
            }
            _ => {}
        }
    }

    /// Sends a fresh generation of `target_count` at `hatch_rate` to every
    /// commandable worker. Returns how many workers got it.
    ///
    /// Caller holds the worker table lock.
    fn dispatch_locked(&self, table: &mut WorkerTable, target_count: usize, hatch_rate: f64) -> usize {
        let workers = table.ready_count();
        if workers == 0 {
            return 0;
        }
        let per_worker_rate = hatch_rate / workers as f64;
        if !per_worker_rate.is_normal() {
            warn!(hatch_rate, workers, "Per-worker hatch rate out of range; ignoring ramp");
            return 0;
        }

        let mut plan = self.plan.lock();
        let generation = plan.generation + 1;
        let sent = table.dispatch_ramp(target_count, hatch_rate, generation);
        if sent > 0 {
            *plan = RampPlan {
                target_count,
                hatch_rate,
                generation,
            };
            self.state.set(RunnerState::Hatching);
        }
        sent
    }

    /// Brings a worker that just became commandable into a ramp in progress
    /// by re-splitting the current target over all workers.
    ///
    /// Caller holds the worker table lock.
    fn rebalance_locked(&self, table: &mut WorkerTable, worker_id: &str) {
        let joined = table.get(worker_id).map_or(false, |n| n.accepts_commands());
        if !joined || !matches!(self.state.get(), RunnerState::Hatching | RunnerState::Running) {
            return;
        }
        let plan = *self.plan.lock();
        let sent = self.dispatch_locked(table, plan.target_count, plan.hatch_rate);
        info!(
            worker_id,
            workers = sent,
            target_count = plan.target_count,
            "Rebalanced ramp over workers"
        );
    }

    fn refresh_state(&self) {
        let table = self.workers.lock();
        self.refresh_state_locked(&table);
    }

    fn worker_lost(&self, worker_id: &str, reason: &str) {
        let lost = self.workers.lock().mark_lost(worker_id);
        if lost {
            warn!(worker_id, reason, "Worker lost");
            self.refresh_state();
            self.workers_changed.notify_waiters();
        }
    }

    fn handle_worker_message(&self, message: WorkerMessage) {
        let now = Instant::now();
        match message {
            WorkerMessage::Register { worker_id } => {
                self.workers.lock().touch(&worker_id, now);
            }
            WorkerMessage::Ready { worker_id } => {
                let mut table = self.workers.lock();
                table.mark_ready(&worker_id, now);
                info!(worker_id = %worker_id, "Worker ready");
                self.rebalance_locked(&mut table, &worker_id);
                drop(table);
                self.workers_changed.notify_waiters();
            }
            WorkerMessage::StatsReport {
                worker_id,
                snapshot,
            } => {
                debug!(
                    worker_id = %worker_id,
                    entries = snapshot.stats.len(),
                    user_count = snapshot.user_count,
                    "Stats report"
                );
                self.workers.lock().apply_snapshot(&worker_id, snapshot, now);
            }
            WorkerMessage::Heartbeat {
                worker_id,
                state,
                user_count,
                generation,
            } => {
                let mut table = self.workers.lock();
                table.apply_heartbeat(&worker_id, state, user_count, generation, now);
                self.refresh_state_locked(&table);
            }
            WorkerMessage::Quitting { worker_id } => {
                let quit = self.workers.lock().mark_quit(&worker_id);
                if quit {
                    info!(worker_id = %worker_id, "Worker quit");
                    self.refresh_state();
                    self.workers_changed.notify_waiters();
                }
            }
        }
    }

    fn broadcast(&self, table: &WorkerTable, message: ControllerMessage) -> usize {
        table
            .commandable()
            .filter(|node| node.send(message.clone()))
            .count()
    }
}

/// Runner that fans commands out to workers and merges their snapshots.
pub struct ControllerRunner {
    shared: Arc<Shared>,
    command_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerRunner {
    /// Binds the command port and the stats port (`port + 1`).
    pub async fn bind(
        ctx: Arc<RunnerContext>,
        settings: ControllerSettings,
    ) -> Result<Self, RunnerError> {
        let command_addr = format!("{}:{}", settings.bind_host, settings.port);
        let commands = TcpListener::bind(&command_addr)
            .await
            .map_err(|source| RunnerError::Bind {
                addr: command_addr.clone(),
                source,
            })?;
        let stats_addr = format!("{}:{}", settings.bind_host, stats_port(settings.port));
        let stats = TcpListener::bind(&stats_addr)
            .await
            .map_err(|source| RunnerError::Bind {
                addr: stats_addr.clone(),
                source,
            })?;
        Self::from_listeners(ctx, settings, commands, stats)
    }

    /// Builds a controller over already bound listeners.
    pub fn from_listeners(
        ctx: Arc<RunnerContext>,
        settings: ControllerSettings,
        commands: TcpListener,
        stats: TcpListener,
    ) -> Result<Self, RunnerError> {
        let command_addr = commands.local_addr().map_err(|source| RunnerError::Bind {
            addr: "command listener".to_string(),
            source,
        })?;
        let stats_addr = stats.local_addr().map_err(|source| RunnerError::Bind {
            addr: "stats listener".to_string(),
            source,
        })?;

        let shared = Arc::new(Shared {
            ctx,
            settings,
            workers: Mutex::new(WorkerTable::new()),
            state: StateCell::new(),
            plan: Mutex::new(RampPlan::default()),
            workers_changed: Notify::new(),
        });

        let tasks = vec![
            tokio::spawn(accept_commands(shared.clone(), commands)),
            tokio::spawn(accept_stats(shared.clone(), stats)),
            tokio::spawn(sweep_workers(shared.clone())),
        ];

        info!(
            command_addr = %command_addr,
            stats_addr = %stats_addr,
            "Controller listening"
        );

        Ok(Self {
            shared,
            command_addr,
            tasks,
        })
    }

    /// Address workers dial for commands.
    pub fn local_addr(&self) -> SocketAddr {
        self.command_addr
    }

    /// Workers that registered and can take commands.
    pub fn ready_worker_count(&self) -> usize {
        self.shared.workers.lock().ready_count()
    }

    /// Resolves once at least `count` workers are ready.
    pub async fn wait_for_workers(&self, count: usize) {
        loop {
            let notified = self.shared.workers_changed.notified();
            if self.ready_worker_count() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once no worker is connected any more.
    pub async fn wait_for_departure(&self) {
        loop {
            let notified = self.shared.workers_changed.notified();
            if self.shared.workers.lock().worker_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Last snapshot a worker sent, including lost workers.
    pub fn worker_snapshot(&self, worker_id: &str) -> Option<StatsSnapshot> {
        self.shared
            .workers
            .lock()
            .get(worker_id)
            .and_then(|node| node.snapshot.clone())
    }

    /// Whether `worker_id` has been marked lost.
    pub fn is_worker_lost(&self, worker_id: &str) -> Option<bool> {
        self.shared.workers.lock().get(worker_id).map(|node| node.lost)
    }

    /// Tells every connected worker to shut down.
    pub fn quit(&self) {
        let table = self.shared.workers.lock();
        let sent = self.shared.broadcast(&table, ControllerMessage::Quit);
        info!(workers = sent, "Sent quit to workers");
    }

    fn reporting_snapshots<T>(&self, f: impl Fn(&StatsSnapshot) -> T) -> Vec<T> {
        let table = self.shared.workers.lock();
        table
            .reporting()
            .filter_map(|node| node.snapshot.as_ref())
            .map(f)
            .collect()
    }
}

impl Drop for ControllerRunner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Runner for ControllerRunner {
    fn start_ramp(&self, target_count: usize, hatch_rate: f64) {
        if !hatch_rate.is_finite() || hatch_rate <= 0.0 {
            warn!(target_count, hatch_rate, "Ignoring ramp request with invalid hatch rate");
            return;
        }

        let mut table = self.shared.workers.lock();
        if table.ready_count() == 0 {
            warn!(target_count, "No ready workers; ignoring ramp request");
            return;
        }

        let sent = self.shared.dispatch_locked(&mut table, target_count, hatch_rate);
        if sent == 0 {
            warn!(target_count, "No worker accepted the ramp");
            return;
        }
        info!(target_count, hatch_rate, workers = sent, "Ramp sent to workers");
    }

    fn stop(&self) {
        let table = self.shared.workers.lock();
        let current = self.shared.state.get();
        if matches!(current, RunnerState::Stopping | RunnerState::Stopped) {
            return;
        }

        let sent = self.shared.broadcast(&table, ControllerMessage::Stop);
        if current == RunnerState::Ready || table.worker_count() == 0 {
            self.shared.state.set(RunnerState::Stopped);
        } else {
            self.shared.state.set(RunnerState::Stopping);
            self.shared.refresh_state_locked(&table);
        }
        info!(workers = sent, "Sent stop to workers");
    }

    fn reset_stats(&self) {
        let mut table = self.shared.workers.lock();
        let sent = self.shared.broadcast(&table, ControllerMessage::ResetStats);
        table.clear_snapshots();
        self.shared.ctx.reset_all();
        info!(workers = sent, "Stats reset");
    }

    fn state(&self) -> RunnerState {
        self.shared.state.get()
    }

    async fn wait_for_state(&self, state: RunnerState) {
        self.shared.state.wait_for(state).await;
    }

    fn user_count(&self) -> usize {
        self.shared.workers.lock().user_count()
    }

    fn target_user_count(&self) -> usize {
        self.shared.plan.lock().target_count
    }

    fn hatch_rate(&self) -> f64 {
        self.shared.plan.lock().hatch_rate
    }

    fn worker_count(&self) -> usize {
        self.shared.workers.lock().worker_count()
    }

    fn request_stats(&self) -> BTreeMap<StatsKey, StatsEntry> {
        let entries: Vec<StatsEntry> = self
            .reporting_snapshots(|s| s.stats.clone())
            .into_iter()
            .flatten()
            .collect();
        merge_entries(&entries)
    }

    fn total_stats(&self) -> StatsEntry {
        let merged = self.request_stats();
        aggregate_total(merged.values(), self.shared.ctx.stats.total().start_time)
    }

    fn errors(&self) -> BTreeMap<ErrorKey, ExceptionRecord> {
        let records: Vec<ExceptionRecord> = self
            .reporting_snapshots(|s| s.exceptions.clone())
            .into_iter()
            .flatten()
            .collect();
        merge_records(&records)
    }
}

async fn accept_commands(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Command connection accepted");
                tokio::spawn(handle_command_connection(shared.clone(), stream));
            }
            Err(err) => {
                error!(error = %err, "Failed to accept command connection");
            }
        }
    }
}

async fn accept_stats(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Stats connection accepted");
                tokio::spawn(handle_stats_connection(shared.clone(), stream));
            }
            Err(err) => {
                error!(error = %err, "Failed to accept stats connection");
            }
        }
    }
}

async fn expect_register<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match read_message::<_, WorkerMessage>(reader).await? {
        WorkerMessage::Register { worker_id } => Ok(worker_id),
        other => Err(ProtocolError::Unexpected(format!(
            "expected register, got {}",
            other.kind()
        ))),
    }
}

async fn handle_command_connection(shared: Arc<Shared>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let worker_id = match expect_register(&mut reader).await {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "Dropping command connection");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ControllerMessage>();
    {
        let mut table = shared.workers.lock();
        table.attach_commands(&worker_id, tx, Instant::now());
        shared.rebalance_locked(&mut table, &worker_id);
    }
    shared.workers_changed.notify_waiters();
    info!(worker_id = %worker_id, "Worker connected");

    let writer_shared = shared.clone();
    let writer_id = worker_id.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(err) = send_message(&mut write_half, &message).await {
                writer_shared.worker_lost(&writer_id, &err.to_string());
                return;
            }
        }
    });

    // Workers never write on this channel after registering; reading only
    // detects the disconnect. Liveness is decided by the stats channel, which
    // also carries the goodbye of a quitting worker.
    loop {
        match read_message::<_, WorkerMessage>(&mut reader).await {
            Ok(message) => {
                debug!(worker_id = %worker_id, kind = message.kind(), "Ignoring message on command channel");
            }
            Err(err) => {
                debug!(worker_id = %worker_id, error = %err, "Command channel closed");
                shared.workers.lock().detach_commands(&worker_id);
                shared.workers_changed.notify_waiters();
                return;
            }
        }
    }
}

async fn handle_stats_connection(shared: Arc<Shared>, stream: TcpStream) {
    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let worker_id = match expect_register(&mut reader).await {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "Dropping stats connection");
            return;
        }
    };
    shared.workers.lock().touch(&worker_id, Instant::now());

    loop {
        match read_message::<_, WorkerMessage>(&mut reader).await {
            Ok(message) => {
                let quitting = matches!(message, WorkerMessage::Quitting { .. });
                shared.handle_worker_message(message);
                if quitting {
                    return;
                }
            }
            Err(err) => {
                shared.worker_lost(&worker_id, &err.to_string());
                return;
            }
        }
    }
}

async fn sweep_workers(shared: Arc<Shared>) {
    let interval = shared.settings.heartbeat_interval;
    let liveness = shared.settings.heartbeat_liveness;
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let lost = shared
            .workers
            .lock()
            .sweep(Instant::now(), interval, liveness);
        if lost.is_empty() {
            continue;
        }
        for worker_id in &lost {
            warn!(
                worker_id = %worker_id,
                missed_heartbeats = liveness,
                "Worker missed heartbeats; marking lost"
            );
        }
        shared.refresh_state();
        shared.workers_changed.notify_waiters();
    }
}
