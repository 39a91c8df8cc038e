#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::task::executor::ExecutionResult;

pub const SPINNER_FRAMES: [char; 4] = ['|', '/', '-', '\\'];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Locked,
    Ready,
    Running,
    Completed,
    Failed,
}

impl Phase {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Phase::Locked => "Locked",
            Phase::Ready => "Ready",
            Phase::Running => "Running",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
        }
    }

    /// Phases from which a start request is honored.
    #[must_use]
    pub fn is_startable(self) -> bool {
        matches!(self, Phase::Ready | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[must_use]
pub fn spinner_symbol(frame: u64) -> char {
    // frame % 4 always fits in usize
    SPINNER_FRAMES[(frame % SPINNER_FRAMES.len() as u64) as usize]
}

/// Mutable lifecycle state of one catalog entry. Only the engine's consumer
/// loop holds these.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskRunState {
    pub phase: Phase,
    pub animation_tick: u64,
    pub last_message: String,
    pub run_id: Option<String>,
    pub attempts: u32,
    pub last_exit_code: Option<i32>,
    pub last_stdout: String,
    pub last_stderr: String,
    pub finished_at: Option<String>,
    #[serde(skip)]
    pub last_duration: Option<Duration>,
}

impl TaskRunState {
    #[must_use]
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            animation_tick: 0,
            last_message: String::new(),
            run_id: None,
            attempts: 0,
            last_exit_code: None,
            last_stdout: String::new(),
            last_stderr: String::new(),
            finished_at: None,
            last_duration: None,
        }
    }

    /// `Ready|Failed -> Running`. Returns the rejected phase otherwise.
    pub(crate) fn begin(&mut self, run_id: String, message: String) -> Result<(), Phase> {
        if !self.phase.is_startable() {
            return Err(self.phase);
        }
        self.phase = Phase::Running;
        self.animation_tick = 0;
        self.attempts += 1;
        self.run_id = Some(run_id);
        self.last_message = message;
        Ok(())
    }

    /// `Running -> Completed|Failed` for the run currently in flight.
    /// Results from any other run are ignored and yield `None`.
    pub(crate) fn finish(&mut self, result: &ExecutionResult, message: String) -> Option<bool> {
        if self.phase != Phase::Running || self.run_id.as_deref() != Some(result.run_id.as_str()) {
            return None;
        }
        let success = result.is_success();
        self.phase = if success {
            Phase::Completed
        } else {
            Phase::Failed
        };
        self.last_message = message;
        self.last_exit_code = result.exit_code;
        self.last_stdout.clone_from(&result.stdout);
        self.last_stderr.clone_from(&result.stderr);
        self.last_duration = Some(result.duration);
        self.finished_at = Some(now_rfc3339());
        Some(success)
    }

    /// `Locked -> Ready`. Any other phase is left alone.
    pub(crate) fn unlock(&mut self) -> bool {
        if self.phase != Phase::Locked {
            return false;
        }
        self.phase = Phase::Ready;
        true
    }

    pub(crate) fn advance_tick(&mut self) -> Option<u64> {
        if self.phase != Phase::Running {
            return None;
        }
        self.animation_tick += 1;
        Some(self.animation_tick)
    }

    #[must_use]
    pub fn spinner(&self) -> Option<char> {
        (self.phase == Phase::Running).then(|| spinner_symbol(self.animation_tick))
    }

    /// Status string as shown to the operator.
    #[must_use]
    pub fn status_text(&self) -> String {
        match self.spinner() {
            Some(sym) => format!("Running {sym}"),
            None => self.phase.label().to_owned(),
        }
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}
