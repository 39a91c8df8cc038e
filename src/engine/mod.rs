#![forbid(unsafe_code)]

//! Gated execution engine.
//!
//! [`Engine`] is the synchronous state owner: it validates start requests,
//! applies worker results and drives the gate. [`runtime`] wraps it in the
//! single consumer loop that launches workers and publishes updates.

pub mod events;
pub mod runtime;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::StartRejected;
use crate::task::executor::ExecutionResult;
use crate::task::gate::GateController;
use crate::task::model::{PrivilegeMode, TaskCatalog, TaskDefinition};
use crate::task::state::{Phase, TaskRunState};

/// Read-only view of one task, handed to presenters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub index: usize,
    pub name: String,
    pub description: String,
    pub privilege: PrivilegeMode,
    pub phase: Phase,
    pub status: String,
    pub animation_tick: u64,
    pub spinner: Option<char>,
    pub last_message: String,
    pub attempts: u32,
    pub last_exit_code: Option<i32>,
    pub last_stderr: String,
    pub finished_at: Option<String>,
    /// Troubleshooting text, present while the task is failed.
    pub hint: Option<String>,
}

/// A start request that passed the state machine and needs a worker.
#[derive(Debug, Clone)]
pub struct Launch {
    pub task: TaskDefinition,
    pub run_id: String,
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Launch(Launch),
    /// The script was absent; the task went straight to `Failed`.
    ScriptMissing,
}

type PathProbe = fn(&Path) -> bool;

#[derive(Debug)]
pub struct Engine {
    catalog: Arc<TaskCatalog>,
    gate: GateController,
    states: Vec<TaskRunState>,
    probe: PathProbe,
}

impl Engine {
    #[must_use]
    pub fn new(catalog: Arc<TaskCatalog>, unlock_all: bool) -> Self {
        Self::with_probe(catalog, unlock_all, Path::exists)
    }

    /// Like [`Engine::new`] with a custom script-existence check.
    #[must_use]
    pub fn with_probe(catalog: Arc<TaskCatalog>, unlock_all: bool, probe: PathProbe) -> Self {
        let gate = GateController::new(unlock_all);
        let states = gate.initial_states(catalog.len());
        Self {
            catalog,
            gate,
            states,
            probe,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<TaskCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn unlock_all(&self) -> bool {
        self.gate.unlock_all()
    }

    #[must_use]
    pub fn state(&self, index: usize) -> Option<&TaskRunState> {
        self.states.get(index)
    }

    #[must_use]
    pub fn phase(&self, index: usize) -> Option<Phase> {
        self.states.get(index).map(|s| s.phase)
    }

    #[must_use]
    pub fn phases(&self) -> Vec<Phase> {
        self.states.iter().map(|s| s.phase).collect()
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| s.phase == Phase::Running)
            .count()
    }

    #[must_use]
    pub fn has_running(&self) -> bool {
        self.running_count() > 0
    }

    pub fn request_start(&mut self, index: usize) -> Result<StartOutcome, StartRejected> {
        let Some(task) = self.catalog.get(index) else {
            return Err(StartRejected::UnknownTask(index));
        };
        let Some(state) = self.states.get_mut(index) else {
            return Err(StartRejected::UnknownTask(index));
        };

        let run_id = new_run_id();
        state
            .begin(run_id.clone(), format!("Running {} ...", task.name))
            .map_err(|phase| StartRejected::NotStartable { index, phase })?;

        if !(self.probe)(&task.executable_path) {
            let result = ExecutionResult::not_found(task, run_id);
            let message = result.message(&task.name);
            state.finish(&result, message);
            tracing::warn!(task = %task.name, "script missing; not launched");
            return Ok(StartOutcome::ScriptMissing);
        }

        tracing::debug!(task = %task.name, run_id = %run_id, "task started");
        Ok(StartOutcome::Launch(Launch {
            task: task.clone(),
            run_id,
        }))
    }

    /// Applies a worker result. Returns the indexes whose state changed:
    /// the finished task first, then any task the gate unlocked. Stale or
    /// duplicate results change nothing.
    pub fn apply(&mut self, result: &ExecutionResult) -> Vec<usize> {
        let index = result.task_index;
        let (Some(task), Some(state)) = (self.catalog.get(index), self.states.get_mut(index))
        else {
            tracing::debug!(index, "result for unknown task dropped");
            return Vec::new();
        };

        let Some(success) = state.finish(result, result.message(&task.name)) else {
            tracing::debug!(task = %task.name, run_id = %result.run_id, "stale result dropped");
            return Vec::new();
        };

        if success {
            tracing::info!(task = %task.name, "task completed");
        } else {
            tracing::warn!(task = %task.name, exit_code = ?result.exit_code, "task failed");
        }

        let mut changed = vec![index];
        if let Some(next) = self.gate.on_completion(&mut self.states, index, success) {
            let unlocked = self.catalog.get(next).map_or("", |t| t.name.as_str());
            tracing::info!(task = %unlocked, "task unlocked");
            changed.push(next);
        }
        changed
    }

    /// Advances the animation of every running task.
    pub fn tick(&mut self) -> Vec<(usize, u64)> {
        self.states
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.advance_tick().map(|frame| (i, frame)))
            .collect()
    }

    #[must_use]
    pub fn snapshot_of(&self, index: usize) -> Option<TaskSnapshot> {
        let task = self.catalog.get(index)?;
        let st = self.states.get(index)?;
        Some(TaskSnapshot {
            index,
            name: task.name.clone(),
            description: task.description.clone(),
            privilege: task.privilege,
            phase: st.phase,
            status: st.status_text(),
            animation_tick: st.animation_tick,
            spinner: st.spinner(),
            last_message: st.last_message.clone(),
            attempts: st.attempts,
            last_exit_code: st.last_exit_code,
            last_stderr: st.last_stderr.clone(),
            finished_at: st.finished_at.clone(),
            hint: (st.phase == Phase::Failed).then(|| self.catalog.hint_for(index).to_owned()),
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        (0..self.states.len())
            .filter_map(|i| self.snapshot_of(i))
            .collect()
    }
}

#[must_use]
pub fn new_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let short: String = id.chars().take(8).collect();
    format!("run-{short}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ExecutionFailure;
    use crate::task::model::spec;

    fn always_present(_: &Path) -> bool {
        true
    }

    fn engine(unlock_all: bool) -> Engine {
        let catalog = TaskCatalog::new(
            [
                spec("A", "/a.sh", PrivilegeMode::Normal),
                spec("B", "/b.sh", PrivilegeMode::SudoAsInvoker),
                spec("C", "/c.sh", PrivilegeMode::SudoAsRoot),
            ],
            "",
        )
        .unwrap();
        Engine::with_probe(Arc::new(catalog), unlock_all, always_present)
    }

    fn launch(engine: &mut Engine, index: usize) -> Launch {
        match engine.request_start(index).unwrap() {
            StartOutcome::Launch(l) => l,
            StartOutcome::ScriptMissing => panic!("expected a launch"),
        }
    }

    fn exited(launch: &Launch, code: i32, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            task_index: launch.task.index,
            run_id: launch.run_id.clone(),
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_owned(),
            failure: (code != 0).then_some(ExecutionFailure::NonZeroExit { code }),
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn start_on_locked_running_or_completed_is_a_no_op() {
        let mut e = engine(false);
        assert!(matches!(
            e.request_start(1),
            Err(StartRejected::NotStartable {
                index: 1,
                phase: Phase::Locked
            })
        ));

        let a = launch(&mut e, 0);
        let before = e.snapshot();
        assert!(e.request_start(0).is_err());
        assert_eq!(e.snapshot(), before);

        e.apply(&exited(&a, 0, ""));
        assert!(e.request_start(0).is_err());
        assert_eq!(e.phase(0), Some(Phase::Completed));
        assert!(matches!(e.request_start(9), Err(StartRejected::UnknownTask(9))));
    }

    #[test]
    fn sequential_scenario_with_retry() {
        let mut e = engine(false);
        assert_eq!(e.phases(), [Phase::Ready, Phase::Locked, Phase::Locked]);

        let a = launch(&mut e, 0);
        assert_eq!(e.phase(0), Some(Phase::Running));
        assert_eq!(e.apply(&exited(&a, 0, "")), vec![0, 1]);
        assert_eq!(e.phases(), [Phase::Completed, Phase::Ready, Phase::Locked]);

        let b = launch(&mut e, 1);
        assert_eq!(e.apply(&exited(&b, 1, "perm denied")), vec![1]);
        assert_eq!(e.phase(1), Some(Phase::Failed));
        assert_eq!(e.phase(2), Some(Phase::Locked));
        let snap = e.snapshot_of(1).unwrap();
        assert!(snap.last_message.contains("perm denied"));
        assert!(snap.hint.is_some());

        let b2 = launch(&mut e, 1);
        assert_eq!(e.phase(1), Some(Phase::Running));
        assert_eq!(e.apply(&exited(&b2, 0, "")), vec![1, 2]);
        assert_eq!(e.phases(), [Phase::Completed, Phase::Completed, Phase::Ready]);
        assert_eq!(e.state(1).map(|s| s.attempts), Some(2));
    }

    #[test]
    fn repeated_failures_unlock_successor_exactly_once() {
        let mut e = engine(false);
        for _ in 0..3 {
            let a = launch(&mut e, 0);
            assert_eq!(e.apply(&exited(&a, 2, "nope")), vec![0]);
            assert_eq!(e.phase(1), Some(Phase::Locked));
        }
        let a = launch(&mut e, 0);
        assert_eq!(e.apply(&exited(&a, 0, "")), vec![0, 1]);
        // replaying the same result is ignored
        assert!(e.apply(&exited(&a, 0, "")).is_empty());
        assert_eq!(e.phases(), [Phase::Completed, Phase::Ready, Phase::Locked]);
    }

    #[test]
    fn stale_result_from_an_earlier_attempt_is_ignored() {
        let mut e = engine(false);
        let first = launch(&mut e, 0);
        e.apply(&exited(&first, 1, "x"));
        let second = launch(&mut e, 0);
        assert!(e.apply(&exited(&first, 0, "")).is_empty());
        assert_eq!(e.phase(0), Some(Phase::Running));
        assert_eq!(e.apply(&exited(&second, 0, "")), vec![0, 1]);
    }

    #[test]
    fn unlock_all_runs_everything_concurrently() {
        let mut e = engine(true);
        assert_eq!(e.phases(), [Phase::Ready; 3]);
        let launches: Vec<Launch> = (0..3).map(|i| launch(&mut e, i)).collect();
        assert_eq!(e.running_count(), 3);

        assert_eq!(e.apply(&exited(&launches[1], 1, "bad")), vec![1]);
        assert_eq!(e.apply(&exited(&launches[0], 0, "")), vec![0]);
        assert_eq!(e.phases(), [Phase::Completed, Phase::Failed, Phase::Running]);

        // failed tasks stay retryable without any gating
        let retry = launch(&mut e, 1);
        assert_eq!(e.apply(&exited(&retry, 0, "")), vec![1]);
    }

    #[test]
    fn missing_script_fails_without_launch() {
        fn absent(_: &Path) -> bool {
            false
        }
        let catalog = TaskCatalog::new([spec("A", "/gone.sh", PrivilegeMode::Normal)], "").unwrap();
        let mut e = Engine::with_probe(Arc::new(catalog), false, absent);
        assert!(matches!(e.request_start(0), Ok(StartOutcome::ScriptMissing)));
        let snap = e.snapshot_of(0).unwrap();
        assert_eq!(snap.phase, Phase::Failed);
        assert_eq!(snap.last_message, "script not found at /gone.sh");
        assert_eq!(snap.last_exit_code, None);
        // and it may be retried
        assert!(e.request_start(0).is_ok());
    }

    #[test]
    fn ticks_follow_running_tasks_only() {
        let mut e = engine(true);
        assert!(e.tick().is_empty());
        let a = launch(&mut e, 0);
        let _c = launch(&mut e, 2);
        assert_eq!(e.tick(), vec![(0, 1), (2, 1)]);
        assert_eq!(e.tick(), vec![(0, 2), (2, 2)]);
        e.apply(&exited(&a, 0, ""));
        assert_eq!(e.tick(), vec![(2, 3)]);
        assert_eq!(e.snapshot_of(2).unwrap().spinner, Some('\\'));
    }
}
