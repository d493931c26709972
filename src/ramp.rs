//! Rate-controlled spawning and retiring of simulated users.
//!
//! A driver task converges the number of active users on the current
//! [`RampTarget`], one user every `1 / rate` seconds. Pacing uses absolute
//! deadlines (`sleep_until(next_fire)`), the first change lands one interval
//! after the ramp starts, and a new target interrupts the wait immediately.
//!
//! Which scenario a new user runs is a weighted random draw. Retiring picks the
//! scenario that is most over its weighted share and signals its newest user,
//! which exits after finishing its current action.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::ScenarioError;
use crate::runner::RunnerContext;
use crate::scenario::{ScenarioDefinition, UserContext};
use crate::selector::WeightedTable;
use crate::state::{RunnerState, StateCell};
use crate::user::SimulatedUser;

/// Longest pause between two spawns, whatever the rate.
const MAX_SPAWN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampTarget {
    pub count: usize,

    /// Users per second. `f64::INFINITY` converges in one step.
    pub rate: f64,

    /// Bumped on every request so identical targets still count as new.
    generation: u64,
}

impl RampTarget {
    fn interval(&self) -> Duration {
        if self.rate.is_infinite() {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(1.0 / self.rate)
            .unwrap_or(MAX_SPAWN_INTERVAL)
            .min(MAX_SPAWN_INTERVAL)
    }
}

struct UserHandle {
    id: u64,
    retire: Arc<AtomicBool>,
}

struct Pool {
    /// Active users per scenario, oldest first.
    by_scenario: Vec<Vec<UserHandle>>,
    active: usize,
    next_user_id: u64,
    last_hatch_rate: f64,
}

impl Pool {
    fn counts(&self) -> Vec<usize> {
        self.by_scenario.iter().map(Vec::len).collect()
    }
}

struct Shared {
    ctx: Arc<RunnerContext>,
    scenarios: Vec<Arc<ScenarioDefinition>>,
    scenario_weights: Vec<f64>,
    scenario_table: WeightedTable,
    action_tables: Vec<WeightedTable>,
    state: StateCell,

    /// Guards user bookkeeping. Target updates and state changes made by
    /// `start_ramp`/`stop` also happen under this lock so the driver never
    /// acts on a stale target.
    pool: Mutex<Pool>,

    /// Users spawned and not yet exited, including retiring ones.
    alive: AtomicUsize,
}

impl Shared {
    fn active_count(&self) -> usize {
        self.pool.lock().active
    }

    /// Applies up to `batch` spawn/retire steps toward `target`.
    ///
    /// Returns false without touching anything if `target` is no longer the
    /// current one.
    fn step_toward(
        self: &Arc<Self>,
        target: &RampTarget,
        current: &watch::Receiver<RampTarget>,
        batch: usize,
        rng: &mut StdRng,
    ) -> bool {
        let mut pool = self.pool.lock();
        if current.borrow().generation != target.generation {
            return false;
        }
        for _ in 0..batch {
            if pool.active < target.count {
                self.spawn_user(&mut pool, rng);
            } else if pool.active > target.count {
                self.retire_user(&mut pool);
            } else {
                break;
            }
        }
        true
    }

    fn spawn_user(self: &Arc<Self>, pool: &mut Pool, rng: &mut StdRng) {
        let index = self.scenario_table.pick(rng);
        let scenario = self.scenarios[index].clone();
        let retire = Arc::new(AtomicBool::new(false));
        let id = pool.next_user_id;
        pool.next_user_id += 1;

        pool.by_scenario[index].push(UserHandle {
            id,
            retire: retire.clone(),
        });
        pool.active += 1;
        self.alive.fetch_add(1, Ordering::SeqCst);

        let user = SimulatedUser::new(
            self.ctx.clone(),
            scenario.clone(),
            self.action_tables[index].clone(),
            retire,
            UserContext {
                user_id: id,
                scenario: scenario.name.clone(),
                node_id: self.ctx.node_id.clone(),
                rng: StdRng::seed_from_u64(rng.gen()),
            },
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            user.run().await;
            shared.user_exited(index, id);
        });
        debug!(user_id = id, scenario = %scenario.name, active = pool.active, "Spawned user");
    }

    fn retire_user(&self, pool: &mut Pool) {
        let Some(index) = scenario_to_retire(&pool.counts(), &self.scenario_weights) else {
            return;
        };
        if let Some(handle) = pool.by_scenario[index].pop() {
            handle.retire.store(true, Ordering::Release);
            pool.active -= 1;
            debug!(
                user_id = handle.id,
                scenario = %self.scenarios[index].name,
                active = pool.active,
                "Retiring user"
            );
        }
    }

    /// Called when a user task ends. A user that stopped on its own is still
    /// in the pool and is removed here.
    fn user_exited(&self, index: usize, id: u64) {
        {
            let mut pool = self.pool.lock();
            if let Some(pos) = pool.by_scenario[index].iter().position(|h| h.id == id) {
                pool.by_scenario[index].remove(pos);
                pool.active -= 1;
            }
        }
        if self.alive.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish_stop_if_drained();
        }
    }

    fn finish_stop_if_drained(&self) {
        if self.alive.load(Ordering::SeqCst) == 0
            && self.state.transition(RunnerState::Stopping, RunnerState::Stopped)
        {
            info!("All users stopped");
        }
    }

    fn target_reached(&self, target: &RampTarget, current: &watch::Receiver<RampTarget>) {
        {
            let _pool = self.pool.lock();
            if current.borrow().generation == target.generation
                && self.state.transition(RunnerState::Hatching, RunnerState::Running)
            {
                info!(user_count = target.count, "All users hatched");
            }
        }
        self.finish_stop_if_drained();
    }

    fn retire_all(&self) {
        let mut pool = self.pool.lock();
        for users in pool.by_scenario.iter_mut() {
            for handle in users.drain(..) {
                handle.retire.store(true, Ordering::Release);
            }
        }
        pool.active = 0;
    }
}

/// Picks the scenario whose active count most exceeds its weighted share of
/// `sum(counts) - 1` users.
pub fn scenario_to_retire(counts: &[usize], weights: &[f64]) -> Option<usize> {
    let remaining = counts.iter().sum::<usize>().checked_sub(1)? as f64;
    let total_weight: f64 = weights.iter().sum();
    let mut best: Option<(usize, f64)> = None;
    for (index, (&count, &weight)) in counts.iter().zip(weights).enumerate() {
        if count == 0 {
            continue;
        }
        let share = remaining * weight / total_weight;
        let excess = count as f64 - share;
        if best.map_or(true, |(_, best_excess)| excess > best_excess) {
            best = Some((index, excess));
        }
    }
    best.map(|(index, _)| index)
}

/// Owns the simulated-user tasks of one node.
pub struct RampScheduler {
    shared: Arc<Shared>,
    target_tx: watch::Sender<RampTarget>,
    driver: JoinHandle<()>,
}

impl RampScheduler {
    /// Builds the scheduler and starts its driver task.
    ///
    /// `seed` makes scenario/action selection reproducible. Must be called
    /// from within a tokio runtime.
    pub fn new(
        ctx: Arc<RunnerContext>,
        scenarios: Vec<ScenarioDefinition>,
        seed: Option<u64>,
    ) -> Result<Self, ScenarioError> {
        if scenarios.is_empty() {
            return Err(ScenarioError::NoScenarios);
        }
        for scenario in &scenarios {
            scenario.validate()?;
        }

        let scenario_weights: Vec<f64> = scenarios.iter().map(|s| s.weight).collect();
        let scenario_table = WeightedTable::new(&scenario_weights).ok_or_else(|| {
            ScenarioError::Validation("scenario weights must be positive".to_string())
        })?;
        let action_tables = scenarios
            .iter()
            .map(ScenarioDefinition::action_table)
            .collect::<Result<Vec<_>, _>>()?;

        let shared = Arc::new(Shared {
            ctx,
            pool: Mutex::new(Pool {
                by_scenario: scenarios.iter().map(|_| Vec::new()).collect(),
                active: 0,
                next_user_id: 1,
                last_hatch_rate: 0.0,
            }),
            scenarios: scenarios.into_iter().map(Arc::new).collect(),
            scenario_weights,
            scenario_table,
            action_tables,
            state: StateCell::new(),
            alive: AtomicUsize::new(0),
        });

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (target_tx, target_rx) = watch::channel(RampTarget {
            count: 0,
            rate: f64::INFINITY,
            generation: 0,
        });
        let driver = tokio::spawn(drive(shared.clone(), target_rx, rng));

        Ok(Self {
            shared,
            target_tx,
            driver,
        })
    }

    pub fn start_ramp(&self, target_count: usize, hatch_rate: f64) {
        if !hatch_rate.is_finite() || hatch_rate <= 0.0 {
            warn!(target_count, hatch_rate, "Ignoring ramp request with invalid hatch rate");
            return;
        }

        let mut pool = self.shared.pool.lock();
        pool.last_hatch_rate = hatch_rate;
        self.shared.state.set(RunnerState::Hatching);
        self.send_target(target_count, hatch_rate);
        info!(
            target_count,
            hatch_rate,
            active = pool.active,
            "Ramp started"
        );
    }

    pub fn stop(&self) {
        let _pool = self.shared.pool.lock();
        match self.shared.state.get() {
            RunnerState::Stopping | RunnerState::Stopped => {}
            RunnerState::Ready => {
                self.shared.state.set(RunnerState::Stopped);
            }
            RunnerState::Hatching | RunnerState::Running => {
                self.shared.state.set(RunnerState::Stopping);
                self.send_target(0, f64::INFINITY);
                info!("Stopping all users");
            }
        }
    }

    fn send_target(&self, count: usize, rate: f64) {
        self.target_tx.send_modify(|target| {
            target.count = count;
            target.rate = rate;
            target.generation += 1;
        });
    }

    pub fn state(&self) -> RunnerState {
        self.shared.state.get()
    }

    pub fn state_watch(&self) -> watch::Receiver<RunnerState> {
        self.shared.state.subscribe()
    }

    pub async fn wait_for_state(&self, state: RunnerState) {
        self.shared.state.wait_for(state).await;
    }

    /// Users that are running and have not been asked to retire.
    pub fn user_count(&self) -> usize {
        self.shared.active_count()
    }

    /// Users whose tasks have not exited yet.
    pub fn alive_count(&self) -> usize {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Active users per scenario, in declaration order.
    pub fn users_per_scenario(&self) -> Vec<(String, usize)> {
        let pool = self.shared.pool.lock();
        self.shared
            .scenarios
            .iter()
            .zip(pool.counts())
            .map(|(s, count)| (s.name.clone(), count))
            .collect()
    }

    pub fn target_user_count(&self) -> usize {
        self.target_tx.borrow().count
    }

    pub fn hatch_rate(&self) -> f64 {
        self.shared.pool.lock().last_hatch_rate
    }

    pub fn context(&self) -> &Arc<RunnerContext> {
        &self.shared.ctx
    }
}

impl Drop for RampScheduler {
    fn drop(&mut self) {
        self.driver.abort();
        self.shared.retire_all();
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut target_rx: watch::Receiver<RampTarget>,
    mut rng: StdRng,
) {
    'retarget: loop {
        let target = *target_rx.borrow_and_update();
        let interval = target.interval();
        let batch = if interval.is_zero() { usize::MAX } else { 1 };
        let mut next_fire = Instant::now();

        loop {
            if shared.active_count() == target.count {
                shared.target_reached(&target, &target_rx);
                break;
            }

            if !interval.is_zero() {
                next_fire += interval;
                tokio::select! {
                    _ = time::sleep_until(next_fire) => {}
                    changed = target_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue 'retarget;
                    }
                }
            }

            if !shared.step_toward(&target, &target_rx, batch, &mut rng) {
                continue 'retarget;
            }
        }

        if target_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_prefers_most_over_represented() {
        // 3:1 weights with 2+2 users: the 1-weight scenario is over its share.
        assert_eq!(scenario_to_retire(&[2, 2], &[3.0, 1.0]), Some(1));
        // 6+1 users at 3:1: scenario 0 holds 6 of an ideal 4.5.
        assert_eq!(scenario_to_retire(&[6, 1], &[3.0, 1.0]), Some(0));
    }

    #[test]
    fn retire_skips_empty_scenarios() {
        assert_eq!(scenario_to_retire(&[0, 1], &[100.0, 1.0]), Some(1));
        assert_eq!(scenario_to_retire(&[0, 0], &[1.0, 1.0]), None);
    }

    #[test]
    fn interval_from_rate() {
        let target = RampTarget {
            count: 1,
            rate: 4.0,
            generation: 1,
        };
        assert_eq!(target.interval(), Duration::from_millis(250));

        let instant = RampTarget {
            rate: f64::INFINITY,
            ..target
        };
        assert_eq!(instant.interval(), Duration::ZERO);

        let slow = RampTarget {
            rate: 1e-300,
            ..target
        };
        assert_eq!(slow.interval(), MAX_SPAWN_INTERVAL);
    }
}
