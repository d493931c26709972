//! Controller-side bookkeeping of connected workers.
//!
//! Each worker gets a [`WorkerNode`] on first contact. Heartbeats and stats
//! reports refresh it; a periodic sweep marks nodes lost once they miss the
//! configured number of heartbeats. Lost nodes drop out of every aggregate
//! but keep their last snapshot for inspection.
//!
//! | Field          | Updated by                          |
//! |----------------|-------------------------------------|
//! | state          | heartbeat                           |
//! | generation     | heartbeat                           |
//! | assigned       | ramp dispatch                       |
//! | user_count     | heartbeat, stats report             |
//! | last_heartbeat | any message on the stats channel    |
//! | lost           | sweep, disconnect                   |
//! | quit           | quitting message                    |

use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::protocol::{ControllerMessage, StatsSnapshot};
use crate::state::RunnerState;

#[derive(Debug)]
pub struct WorkerNode {
    pub id: String,
    pub state: RunnerState,
    pub user_count: usize,
    pub last_heartbeat: Instant,
    pub lost: bool,

    /// Ramp generation the worker last reported applying.
    pub generation: u64,

    /// Ramp generation last dispatched to the worker, 0 if never ramped.
    pub assigned: u64,

    /// Worker announced it is ready for commands.
    pub ready: bool,

    /// Worker said goodbye after its final snapshot. It no longer counts as
    /// connected, but its stats still feed the aggregates.
    pub quit: bool,

    /// Latest cumulative snapshot. Replaced wholesale on each report.
    pub snapshot: Option<StatsSnapshot>,

    commands: Option<mpsc::UnboundedSender<ControllerMessage>>,
}

impl WorkerNode {
    fn new(id: &str, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            state: RunnerState::Ready,
            user_count: 0,
            last_heartbeat: now,
            lost: false,
            generation: 0,
            assigned: 0,
            ready: false,
            quit: false,
            snapshot: None,
            commands: None,
        }
    }

    /// Queues a command for this worker's writer task.
    ///
    /// Returns false when the node has no live command channel.
    pub fn send(&self, message: ControllerMessage) -> bool {
        match &self.commands {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn accepts_commands(&self) -> bool {
        !self.lost && !self.quit && self.ready && self.commands.is_some()
    }
}

/// All workers a controller has ever heard from, keyed and ordered by id.
#[derive(Debug, Default)]
pub struct WorkerTable {
    nodes: BTreeMap<String, WorkerNode>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node for `id`, created on first contact. Contact revives a lost node.
    pub fn touch(&mut self, id: &str, now: Instant) -> &mut WorkerNode {
        let node = self
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| WorkerNode::new(id, now));
        node.last_heartbeat = now;
        node.lost = false;
        node.quit = false;
        node
    }

    pub fn attach_commands(
        &mut self,
        id: &str,
        commands: mpsc::UnboundedSender<ControllerMessage>,
        now: Instant,
    ) {
        self.touch(id, now).commands = Some(commands);
    }

    /// Drops the command channel of `id` without changing its liveness.
    pub fn detach_commands(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.commands = None;
        }
    }

    pub fn mark_ready(&mut self, id: &str, now: Instant) {
        let node = self.touch(id, now);
        node.ready = true;
        node.state = RunnerState::Ready;
        node.generation = 0;
        node.assigned = 0;
    }

    pub fn apply_heartbeat(
        &mut self,
        id: &str,
        state: RunnerState,
        user_count: usize,
        generation: u64,
        now: Instant,
    ) {
        let node = self.touch(id, now);
        node.state = state;
        node.user_count = user_count;
        node.generation = generation;
    }

    /// Sends every commandable worker its share of `target`, tagged with
    /// `generation`. Returns how many workers took the command.
    pub fn dispatch_ramp(&mut self, target: usize, hatch_rate: f64, generation: u64) -> usize {
        let ids: Vec<String> = self.commandable().map(|node| node.id.clone()).collect();
        if ids.is_empty() {
            return 0;
        }
        let rate = hatch_rate / ids.len() as f64;
        let shares = split_target(target, ids.len());

        let mut sent = 0;
        for (id, share) in ids.iter().zip(shares) {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            let ramp = ControllerMessage::Ramp {
                target_count: share,
                hatch_rate: rate,
                generation,
            };
            if node.send(ramp) {
                node.assigned = generation;
                sent += 1;
            }
        }
        sent
    }

    /// True once every worker holding ramp `generation` reports it applied
    /// and running. Workers that were never part of that ramp do not count.
    pub fn settled_at(&self, generation: u64) -> bool {
        let mut ramped = self
            .alive()
            .filter(|node| node.assigned == generation)
            .peekable();
        ramped.peek().is_some()
            && ramped.all(|node| node.generation == generation && node.state == RunnerState::Running)
    }

    pub fn apply_snapshot(&mut self, id: &str, snapshot: StatsSnapshot, now: Instant) {
        let node = self.touch(id, now);
        node.user_count = snapshot.user_count;
        node.snapshot = Some(snapshot);
    }

    /// Marks a node lost. Returns true when it was alive before.
    ///
    /// Nodes that already quit are left alone.
    pub fn mark_lost(&mut self, id: &str) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if !node.lost && !node.quit => {
                node.lost = true;
                node.commands = None;
                true
            }
            _ => false,
        }
    }

    /// Records a clean goodbye. Returns true when the node was connected.
    pub fn mark_quit(&mut self, id: &str) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if !node.lost && !node.quit => {
                node.quit = true;
                node.state = RunnerState::Stopped;
                node.user_count = 0;
                node.commands = None;
                true
            }
            _ => false,
        }
    }

    /// Marks every node whose last heartbeat is older than
    /// `interval * liveness` as lost, returning their ids.
    pub fn sweep(&mut self, now: Instant, interval: Duration, liveness: u32) -> Vec<String> {
        let timeout = interval * liveness;
        let mut lost = Vec::new();
        for node in self.nodes.values_mut() {
            if !node.lost && !node.quit && now.saturating_duration_since(node.last_heartbeat) > timeout {
                node.lost = true;
                node.commands = None;
                lost.push(node.id.clone());
            }
        }
        lost
    }

    pub fn get(&self, id: &str) -> Option<&WorkerNode> {
        self.nodes.get(id)
    }

    /// Connected workers: neither lost nor quit.
    pub fn alive(&self) -> impl Iterator<Item = &WorkerNode> {
        self.nodes.values().filter(|node| !node.lost && !node.quit)
    }

    /// Workers whose snapshots count toward the aggregates.
    pub fn reporting(&self) -> impl Iterator<Item = &WorkerNode> {
        self.nodes.values().filter(|node| !node.lost)
    }

    /// Alive workers that can take commands, in id order.
    pub fn commandable(&self) -> impl Iterator<Item = &WorkerNode> {
        self.nodes.values().filter(|node| node.accepts_commands())
    }

    pub fn worker_count(&self) -> usize {
        self.alive().count()
    }

    pub fn ready_count(&self) -> usize {
        self.commandable().count()
    }

    pub fn user_count(&self) -> usize {
        self.alive().map(|node| node.user_count).sum()
    }

    /// Forgets every stored snapshot.
    pub fn clear_snapshots(&mut self) {
        for node in self.nodes.values_mut() {
            node.snapshot = None;
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &WorkerNode> {
        self.nodes.values()
    }
}

/// Splits `target` users over `workers` workers: everyone gets the same base
/// share and the first `target % workers` workers one extra.
pub fn split_target(target: usize, workers: usize) -> Vec<usize> {
    if workers == 0 {
        return Vec::new();
    }
    let base = target / workers;
    let remainder = target % workers;
    (0..workers)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_table(ids: &[&str], now: Instant) -> WorkerTable {
        let mut table = WorkerTable::new();
        for id in ids {
            let (tx, _rx) = mpsc::unbounded_channel();
            table.attach_commands(id, tx, now);
            table.mark_ready(id, now);
        }
        table
    }

    fn listening_table(
        ids: &[&str],
        now: Instant,
    ) -> (WorkerTable, Vec<mpsc::UnboundedReceiver<ControllerMessage>>) {
        let mut table = WorkerTable::new();
        let mut inboxes = Vec::new();
        for id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            table.attach_commands(id, tx, now);
            table.mark_ready(id, now);
            inboxes.push(rx);
        }
        (table, inboxes)
    }

    #[test]
    fn split_gives_remainder_to_first_workers() {
        assert_eq!(split_target(10, 3), vec![4, 3, 3]);
        assert_eq!(split_target(2, 3), vec![1, 1, 0]);
        assert_eq!(split_target(9, 3), vec![3, 3, 3]);
        assert!(split_target(5, 0).is_empty());
    }

    #[test]
    fn sweep_marks_silent_workers_lost() {
        let start = Instant::now();
        let mut table = ready_table(&["a", "b"], start);
        let interval = Duration::from_secs(3);

        table.apply_heartbeat("a", RunnerState::Running, 5, 0, start + Duration::from_secs(8));
        let lost = table.sweep(start + Duration::from_secs(10), interval, 3);
        assert_eq!(lost, vec!["b".to_string()]);
        assert_eq!(table.worker_count(), 1);

        // exactly at the limit is still alive
        let lost = table.sweep(start + Duration::from_secs(17), interval, 3);
        assert!(lost.is_empty());
    }

    #[test]
    fn lost_workers_leave_the_user_count_but_keep_snapshots() {
        let now = Instant::now();
        let mut table = ready_table(&["a", "b"], now);
        table.apply_snapshot(
            "a",
            StatsSnapshot {
                stats: vec![],
                exceptions: vec![],
                user_count: 4,
            },
            now,
        );
        table.apply_heartbeat("b", RunnerState::Running, 6, 0, now);
        assert_eq!(table.user_count(), 10);

        assert!(table.mark_lost("a"));
        assert!(!table.mark_lost("a"));
        assert_eq!(table.user_count(), 6);
        assert!(table.get("a").unwrap().snapshot.is_some());
        assert!(!table.get("a").unwrap().accepts_commands());
    }

    #[test]
    fn quit_workers_keep_reporting_and_ignore_disconnects() {
        let now = Instant::now();
        let mut table = ready_table(&["a", "b"], now);
        table.apply_heartbeat("a", RunnerState::Running, 3, 0, now);

        assert!(table.mark_quit("a"));
        assert!(!table.mark_lost("a"));
        assert_eq!(table.worker_count(), 1);
        assert_eq!(table.ready_count(), 1);
        assert_eq!(table.reporting().count(), 2);
        assert_eq!(table.user_count(), 0);

        let lost = table.sweep(now + Duration::from_secs(60), Duration::from_secs(3), 3);
        assert_eq!(lost, vec!["b".to_string()]);
        assert_eq!(table.reporting().count(), 1);
    }

    #[test]
    fn dispatch_tags_each_share_with_the_generation() {
        let now = Instant::now();
        let (mut table, mut inboxes) = listening_table(&["a", "b", "c"], now);
        table.mark_ready("late", now);

        assert_eq!(table.dispatch_ramp(10, 6.0, 7), 3);
        let received: Vec<ControllerMessage> = inboxes
            .iter_mut()
            .map(|rx| rx.try_recv().unwrap())
            .collect();
        assert_eq!(
            received[0],
            ControllerMessage::Ramp {
                target_count: 4,
                hatch_rate: 2.0,
                generation: 7,
            }
        );
        assert!(matches!(received[2], ControllerMessage::Ramp { target_count: 3, .. }));
        assert_eq!(table.get("a").unwrap().assigned, 7);
        assert_eq!(table.get("late").unwrap().assigned, 0);

        println!("✅ Ramp shares carry the dispatch generation");
    }

    #[test]
    fn settled_needs_the_current_generation_from_every_ramped_worker() {
        let now = Instant::now();
        let (mut table, _inboxes) = listening_table(&["a", "b"], now);
        table.mark_ready("late", now);
        assert!(!table.settled_at(1));

        assert_eq!(table.dispatch_ramp(4, 2.0, 1), 2);
        table.apply_heartbeat("a", RunnerState::Running, 2, 1, now);
        table.apply_heartbeat("b", RunnerState::Running, 2, 0, now);
        assert!(!table.settled_at(1), "stale generation from b");

        table.apply_heartbeat("b", RunnerState::Running, 2, 1, now);
        assert!(table.settled_at(1), "late never got the ramp and is ignored");

        table.apply_heartbeat("a", RunnerState::Hatching, 1, 1, now);
        assert!(!table.settled_at(1));

        println!("✅ Running only counts once the ramp generation is echoed");
    }

    #[test]
    fn workers_without_command_channel_are_not_commandable() {
        let now = Instant::now();
        let mut table = WorkerTable::new();
        table.mark_ready("solo", now);
        assert_eq!(table.worker_count(), 1);
        assert_eq!(table.ready_count(), 0);
    }
}
