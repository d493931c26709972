//! Worker mode: a local scheduler driven by a remote controller.
//!
//! The worker dials the controller's command port and stats port, registers on
//! both and announces itself ready. From then on two tasks run:
//! - the command loop applies ramp/stop/reset/quit commands to the local
//!   scheduler;
//! - the uplink loop pushes heartbeats (periodically and on every state
//!   change) and cumulative stats snapshots.
//!
//! Losing either connection ends the worker with [`WorkerExit::ControllerLost`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::WorkerSettings;
use crate::errors::{ProtocolError, RunnerError};
use crate::exceptions::{ErrorKey, ExceptionRecord};
use crate::protocol::{
    read_message, send_message, stats_port, ControllerMessage, StatsSnapshot, WorkerMessage,
};
use crate::ramp::RampScheduler;
use crate::runner::{Runner, RunnerContext};
use crate::state::RunnerState;
use crate::stats::{StatsEntry, StatsKey};

/// How long a quitting worker waits for its users to finish.
const QUIT_GRACE: Duration = Duration::from_secs(10);

/// Why a worker stopped serving its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The controller sent `quit`.
    Quit,
    /// A channel to the controller failed.
    ControllerLost,
}

enum Uplink {
    /// Carries the command writer so the controller keeps the worker alive
    /// until the final snapshot is out.
    Quit { command_writer: OwnedWriteHalf },
}

struct ExitSignal {
    tx: watch::Sender<Option<WorkerExit>>,
}

impl ExitSignal {
    /// Records the exit reason. The first reason wins.
    fn fire(&self, reason: WorkerExit) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

pub struct WorkerRunner {
    ctx: Arc<RunnerContext>,
    scheduler: Arc<RampScheduler>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
    tasks: Vec<JoinHandle<()>>,
}

async fn connect_to(addr: &str) -> Result<TcpStream, RunnerError> {
    TcpStream::connect(addr)
        .await
        .map_err(|source| RunnerError::ControllerUnreachable {
            addr: addr.to_string(),
            source,
        })
}

fn snapshot_message(ctx: &RunnerContext, scheduler: &RampScheduler) -> WorkerMessage {
    WorkerMessage::StatsReport {
        worker_id: ctx.node_id.clone(),
        snapshot: StatsSnapshot {
            stats: ctx.stats.snapshot(),
            exceptions: ctx.exceptions.records().into_values().collect(),
            user_count: scheduler.user_count(),
        },
    }
}

/// The generation is loaded before the state, so a heartbeat never pairs a
/// new generation with a state from before that ramp.
fn heartbeat_message(
    ctx: &RunnerContext,
    scheduler: &RampScheduler,
    generation: &AtomicU64,
) -> WorkerMessage {
    let generation = generation.load(Ordering::Acquire);
    WorkerMessage::Heartbeat {
        worker_id: ctx.node_id.clone(),
        state: scheduler.state(),
        user_count: scheduler.user_count(),
        generation,
    }
}

impl WorkerRunner {
    /// Connects to the controller and starts serving it.
    ///
    /// Fails with [`RunnerError::ControllerUnreachable`] when either port
    /// cannot be reached.
    pub async fn connect(
        scheduler: RampScheduler,
        settings: WorkerSettings,
    ) -> Result<Self, RunnerError> {
        let ctx = scheduler.context().clone();
        let scheduler = Arc::new(scheduler);

        let command_addr = format!("{}:{}", settings.controller_host, settings.controller_port);
        let stats_addr = format!(
            "{}:{}",
            settings.controller_host,
            stats_port(settings.controller_port)
        );

        let (command_read, mut command_write) = connect_to(&command_addr).await?.into_split();
        let (_stats_read, mut stats_write) = connect_to(&stats_addr).await?.into_split();

        let register = WorkerMessage::Register {
            worker_id: ctx.node_id.clone(),
        };
        send_message(&mut command_write, &register).await?;
        send_message(&mut stats_write, &register).await?;
        send_message(
            &mut stats_write,
            &WorkerMessage::Ready {
                worker_id: ctx.node_id.clone(),
            },
        )
        .await?;

        info!(
            worker_id = %ctx.node_id,
            controller = %command_addr,
            "Connected to controller"
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit = Arc::new(ExitSignal { tx: exit_tx });
        let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));

        let tasks = vec![
            tokio::spawn(command_loop(
                ctx.clone(),
                scheduler.clone(),
                BufReader::new(command_read),
                command_write,
                uplink_tx,
                generation.clone(),
                exit.clone(),
            )),
            tokio::spawn(uplink_loop(
                ctx.clone(),
                scheduler.clone(),
                stats_write,
                settings,
                uplink_rx,
                generation,
                exit,
            )),
        ];

        Ok(Self {
            ctx,
            scheduler,
            exit_rx,
            tasks,
        })
    }

    pub fn context(&self) -> &Arc<RunnerContext> {
        &self.ctx
    }

    /// Resolves when the controller sends quit or the connection is lost.
    pub async fn wait_for_exit(&self) -> WorkerExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(WorkerExit::ControllerLost),
            Err(_) => WorkerExit::ControllerLost,
        };
        exit
    }
}

impl Drop for WorkerRunner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn command_loop(
    ctx: Arc<RunnerContext>,
    scheduler: Arc<RampScheduler>,
    mut reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    uplink: mpsc::UnboundedSender<Uplink>,
    generation: Arc<AtomicU64>,
    exit: Arc<ExitSignal>,
) {
    loop {
        match read_message::<_, ControllerMessage>(&mut reader).await {
            Ok(ControllerMessage::Ramp {
                target_count,
                hatch_rate,
                generation: ramp_generation,
            }) => {
                info!(
                    target_count,
                    hatch_rate,
                    generation = ramp_generation,
                    "Ramp command received"
                );
                scheduler.start_ramp(target_count, hatch_rate);
                generation.store(ramp_generation, Ordering::Release);
            }
            Ok(ControllerMessage::Stop) => {
                info!("Stop command received");
                scheduler.stop();
            }
            Ok(ControllerMessage::ResetStats) => {
                info!("Reset stats command received");
                ctx.reset_all();
            }
            Ok(ControllerMessage::Quit) => {
                info!("Quit command received");
                scheduler.stop();
                let quit = Uplink::Quit {
                    command_writer: writer,
                };
                if uplink.send(quit).is_err() {
                    exit.fire(WorkerExit::Quit);
                }
                return;
            }
            Err(err) => {
                controller_lost(&scheduler, &exit, &err);
                return;
            }
        }
    }
}

fn controller_lost(scheduler: &RampScheduler, exit: &ExitSignal, err: &ProtocolError) {
    error!(error = %err, "Lost connection to controller");
    scheduler.stop();
    exit.fire(WorkerExit::ControllerLost);
}

async fn uplink_loop(
    ctx: Arc<RunnerContext>,
    scheduler: Arc<RampScheduler>,
    mut writer: OwnedWriteHalf,
    settings: WorkerSettings,
    mut commands: mpsc::UnboundedReceiver<Uplink>,
    generation: Arc<AtomicU64>,
    exit: Arc<ExitSignal>,
) {
    let mut report = time::interval(settings.stats_report_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = time::interval(settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state_rx = scheduler.state_watch();

    loop {
        let message = tokio::select! {
            _ = report.tick() => snapshot_message(&ctx, &scheduler),
            _ = heartbeat.tick() => heartbeat_message(&ctx, &scheduler, &generation),
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                heartbeat_message(&ctx, &scheduler, &generation)
            }
            command = commands.recv() => {
                if let Some(Uplink::Quit { command_writer }) = command {
                    finish_quit(&ctx, &scheduler, &generation, &mut writer).await;
                    drop(command_writer);
                    exit.fire(WorkerExit::Quit);
                }
                return;
            }
        };

        if let Err(err) = send_message(&mut writer, &message).await {
            controller_lost(&scheduler, &exit, &err);
            return;
        }
    }
}

/// Lets users drain, then sends the final snapshot and a goodbye.
async fn finish_quit(
    ctx: &RunnerContext,
    scheduler: &RampScheduler,
    generation: &AtomicU64,
    writer: &mut OwnedWriteHalf,
) {
    if time::timeout(QUIT_GRACE, scheduler.wait_for_state(RunnerState::Stopped))
        .await
        .is_err()
    {
        warn!(
            alive = scheduler.alive_count(),
            "Users did not stop within the quit grace period"
        );
    }

    let goodbye = [
        heartbeat_message(ctx, scheduler, generation),
        snapshot_message(ctx, scheduler),
        WorkerMessage::Quitting {
            worker_id: ctx.node_id.clone(),
        },
    ];
    for message in &goodbye {
        if let Err(err) = send_message(writer, message).await {
            warn!(error = %err, "Failed to send final message to controller");
            return;
        }
    }
}

#[async_trait]
impl Runner for WorkerRunner {
    fn start_ramp(&self, target_count: usize, hatch_rate: f64) {
        self.scheduler.start_ramp(target_count, hatch_rate);
    }

    fn stop(&self) {
        self.scheduler.stop();
    }

    fn reset_stats(&self) {
        self.ctx.reset_all();
    }

    fn state(&self) -> RunnerState {
        self.scheduler.state()
    }

    async fn wait_for_state(&self, state: RunnerState) {
        self.scheduler.wait_for_state(state).await;
    }

    fn user_count(&self) -> usize {
        self.scheduler.user_count()
    }

    fn target_user_count(&self) -> usize {
        self.scheduler.target_user_count()
    }

    fn hatch_rate(&self) -> f64 {
        self.scheduler.hatch_rate()
    }

    fn request_stats(&self) -> BTreeMap<StatsKey, StatsEntry> {
        self.ctx.stats.entries()
    }

    fn total_stats(&self) -> StatsEntry {
        self.ctx.stats.total()
    }

    fn errors(&self) -> BTreeMap<ErrorKey, ExceptionRecord> {
        self.ctx.exceptions.records()
    }
}
