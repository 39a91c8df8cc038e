#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::engine::events::{
    EngineCommand, EngineUpdate, EventReceiver, EventSender, WorkerEvent, event_channel,
};
use crate::engine::{Engine, Launch, StartOutcome, TaskSnapshot};
use crate::task::executor::{self, ExecutionResult};
use crate::task::model::TaskCatalog;
use crate::task::state::spinner_symbol;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub unlock_all: bool,
    pub tick_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            unlock_all: false,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// Presenter side of a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    catalog: Arc<TaskCatalog>,
    commands: EventSender<EngineCommand>,
    updates: EventReceiver<EngineUpdate>,
    snapshot: watch::Receiver<Vec<TaskSnapshot>>,
    join: JoinHandle<Vec<TaskSnapshot>>,
}

impl EngineHandle {
    #[must_use]
    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    /// Asks the engine to start a task. Requests the state machine does not
    /// allow are dropped by the engine.
    pub fn request_start(&self, index: usize) {
        if !self.commands.emit(EngineCommand::Start(index)) {
            tracing::debug!(index, "engine gone; start request dropped");
        }
    }

    /// Latest published state of every task, in catalog order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub async fn next_update(&mut self) -> Option<EngineUpdate> {
        self.updates.recv().await
    }

    pub fn pending_updates(&mut self) -> Vec<EngineUpdate> {
        self.updates.drain()
    }

    /// Stops accepting start requests, waits for every running task to
    /// finish and returns the final state.
    pub async fn shutdown(self) -> anyhow::Result<Vec<TaskSnapshot>> {
        self.commands.emit(EngineCommand::Shutdown);
        self.join.await.context("engine consumer loop panicked")
    }
}

/// Spawns the consumer loop on the current tokio runtime.
#[must_use]
pub fn spawn_engine(catalog: Arc<TaskCatalog>, opts: EngineOptions) -> EngineHandle {
    spawn_with(Engine::new(catalog, opts.unlock_all), opts.tick_interval)
}

/// Like [`spawn_engine`] for a pre-built [`Engine`].
#[must_use]
pub fn spawn_with(engine: Engine, tick_interval: Duration) -> EngineHandle {
    let catalog = Arc::clone(engine.catalog());
    let (cmd_tx, cmd_rx) = event_channel();
    let (upd_tx, upd_rx) = event_channel();
    let (snap_tx, snap_rx) = watch::channel(engine.snapshot());

    let consumer = Consumer {
        engine,
        updates: upd_tx,
        snapshot: snap_tx,
        workers: JoinSet::new(),
        in_flight: HashMap::new(),
    };
    let join = tokio::spawn(consumer.run(cmd_rx, tick_interval));

    EngineHandle {
        catalog,
        commands: cmd_tx,
        updates: upd_rx,
        snapshot: snap_rx,
        join,
    }
}

struct Consumer {
    engine: Engine,
    updates: EventSender<EngineUpdate>,
    snapshot: watch::Sender<Vec<TaskSnapshot>>,
    workers: JoinSet<()>,
    /// Worker task id -> (task index, run id) of the launch it carries.
    in_flight: HashMap<Id, (usize, String)>,
}

impl Consumer {
    async fn run(
        mut self,
        mut commands: EventReceiver<EngineCommand>,
        tick_interval: Duration,
    ) -> Vec<TaskSnapshot> {
        let (worker_tx, mut worker_rx) = event_channel::<WorkerEvent>();
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut draining = false;

        tracing::info!(
            tasks = self.engine.catalog().len(),
            unlock_all = self.engine.unlock_all(),
            "engine started"
        );

        loop {
            if draining && !self.engine.has_running() {
                break;
            }
            let running = self.engine.has_running();

            tokio::select! {
                cmd = commands.recv(), if !draining => match cmd {
                    Some(EngineCommand::Start(index)) => self.start(index, &worker_tx),
                    Some(EngineCommand::Shutdown) | None => {
                        draining = true;
                        if self.engine.has_running() {
                            tracing::info!(
                                running = self.engine.running_count(),
                                "waiting for running tasks before shutdown"
                            );
                        }
                    }
                },
                Some(WorkerEvent::Finished(result)) = worker_rx.recv() => {
                    let changed = self.engine.apply(&result);
                    self.publish(&changed);
                }
                _ = ticker.tick(), if running => self.tick(),
                Some(joined) = self.workers.join_next_with_id() => self.reap(joined),
            }
        }

        while let Some(joined) = self.workers.join_next_with_id().await {
            self.reap(joined);
        }
        tracing::info!("engine stopped");
        self.engine.snapshot()
    }

    fn start(&mut self, index: usize, worker_tx: &EventSender<WorkerEvent>) {
        match self.engine.request_start(index) {
            Ok(StartOutcome::Launch(Launch { task, run_id })) => {
                self.publish(&[index]);
                let tx = worker_tx.clone();
                let tracked = (index, run_id.clone());
                let handle = self.workers.spawn(async move {
                    let result = executor::execute(&task, run_id).await;
                    tx.emit(WorkerEvent::Finished(result));
                });
                self.in_flight.insert(handle.id(), tracked);
            }
            Ok(StartOutcome::ScriptMissing) => self.publish(&[index]),
            Err(rejected) => tracing::debug!(%rejected, "start request ignored"),
        }
    }

    /// A worker that died without reporting leaves its task failed rather
    /// than running forever.
    fn reap(&mut self, joined: Result<(Id, ()), JoinError>) {
        let err = match joined {
            Ok((id, ())) => {
                self.in_flight.remove(&id);
                return;
            }
            Err(err) => err,
        };
        tracing::error!(error = %err, "worker task failed");
        let Some((index, run_id)) = self.in_flight.remove(&err.id()) else {
            return;
        };
        let Some(task) = self.engine.catalog().get(index).cloned() else {
            return;
        };
        let result = ExecutionResult::worker_lost(&task, run_id, &err.to_string());
        let changed = self.engine.apply(&result);
        self.publish(&changed);
    }

    fn tick(&mut self) {
        let frames = self.engine.tick();
        if frames.is_empty() {
            return;
        }
        self.snapshot.send_replace(self.engine.snapshot());
        for (index, frame) in frames {
            self.updates.emit(EngineUpdate::Tick {
                index,
                frame,
                symbol: spinner_symbol(frame),
            });
        }
    }

    fn publish(&mut self, changed: &[usize]) {
        if changed.is_empty() {
            return;
        }
        self.snapshot.send_replace(self.engine.snapshot());
        for &index in changed {
            if let Some(snap) = self.engine.snapshot_of(index) {
                self.updates.emit(EngineUpdate::Changed(snap));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::task::model::{PrivilegeMode, spec};
    use crate::task::state::Phase;

    fn present(_: &Path) -> bool {
        true
    }

    async fn blow_up() {
        panic!("worker blew up");
    }

    fn consumer() -> (Consumer, EventReceiver<EngineUpdate>) {
        let catalog = TaskCatalog::new(
            [
                spec("A", "/a.sh", PrivilegeMode::Normal),
                spec("B", "/b.sh", PrivilegeMode::Normal),
            ],
            "",
        )
        .unwrap();
        let engine = Engine::with_probe(Arc::new(catalog), false, present);
        let (updates, rx) = event_channel();
        let (snapshot, _) = watch::channel(engine.snapshot());
        let c = Consumer {
            engine,
            updates,
            snapshot,
            workers: JoinSet::new(),
            in_flight: HashMap::new(),
        };
        (c, rx)
    }

    #[tokio::test]
    async fn panicked_worker_fails_its_task() {
        let (mut c, mut rx) = consumer();
        let Ok(StartOutcome::Launch(launch)) = c.engine.request_start(0) else {
            panic!("expected a launch");
        };

        let mut doomed: JoinSet<()> = JoinSet::new();
        let id = doomed.spawn(blow_up()).id();
        c.in_flight.insert(id, (0, launch.run_id.clone()));
        let joined = doomed.join_next_with_id().await.unwrap();
        assert!(joined.is_err());

        c.reap(joined);
        assert!(c.in_flight.is_empty());
        assert_eq!(c.engine.phase(0), Some(Phase::Failed));
        assert_eq!(c.engine.phase(1), Some(Phase::Locked));
        assert!(!c.engine.has_running());
        let msg = c.engine.state(0).unwrap().last_message.clone();
        assert!(msg.starts_with("Failed to run A: "), "{msg}");
        assert!(matches!(
            rx.try_recv(),
            Some(EngineUpdate::Changed(snap)) if snap.phase == Phase::Failed
        ));
    }

    #[tokio::test]
    async fn finished_worker_is_forgotten_without_state_change() {
        let (mut c, _rx) = consumer();
        let Ok(StartOutcome::Launch(launch)) = c.engine.request_start(0) else {
            panic!("expected a launch");
        };
        let mut done = JoinSet::new();
        let id = done.spawn(async {}).id();
        c.in_flight.insert(id, (0, launch.run_id));
        c.reap(done.join_next_with_id().await.unwrap());
        assert!(c.in_flight.is_empty());
        assert_eq!(c.engine.phase(0), Some(Phase::Running));
    }
}
