#![forbid(unsafe_code)]

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::ExecutionFailure;
use crate::task::command::{build_command, display_command};
use crate::task::model::TaskDefinition;

/// Outcome of one launch. Produced by a worker, applied once by the engine.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub task_index: usize,
    pub run_id: String,
    /// `None` when no process ran (missing script or launch error).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip)]
    pub failure: Option<ExecutionFailure>,
    #[serde(skip)]
    pub duration: Duration,
}

impl ExecutionResult {
    #[must_use]
    pub fn not_found(task: &TaskDefinition, run_id: String) -> Self {
        Self {
            task_index: task.index,
            run_id,
            exit_code: None,
            stdout: String::new(),
            stderr: "not found".to_owned(),
            failure: Some(ExecutionFailure::ScriptNotFound {
                path: task.executable_path.clone(),
            }),
            duration: Duration::ZERO,
        }
    }

    fn launch_failed(
        task: &TaskDefinition,
        run_id: String,
        program: &str,
        err: &std::io::Error,
        duration: Duration,
    ) -> Self {
        Self {
            task_index: task.index,
            run_id,
            exit_code: None,
            stdout: String::new(),
            stderr: err.to_string(),
            failure: Some(ExecutionFailure::LaunchFailure {
                program: program.to_owned(),
                reason: err.to_string(),
            }),
            duration,
        }
    }

    /// The worker carrying this run died before reporting a result.
    #[must_use]
    pub fn worker_lost(task: &TaskDefinition, run_id: String, reason: &str) -> Self {
        Self {
            task_index: task.index,
            run_id,
            exit_code: None,
            stdout: String::new(),
            stderr: reason.to_owned(),
            failure: Some(ExecutionFailure::LaunchFailure {
                program: "worker".to_owned(),
                reason: reason.to_owned(),
            }),
            duration: Duration::ZERO,
        }
    }

    fn from_output(
        task: &TaskDefinition,
        run_id: String,
        output: &std::process::Output,
        duration: Duration,
    ) -> Self {
        // Killed by a signal: no code, report as a generic failure.
        let code = output.status.code().unwrap_or(1);
        Self {
            task_index: task.index,
            run_id,
            exit_code: Some(code),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            failure: (code != 0).then_some(ExecutionFailure::NonZeroExit { code }),
            duration,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Operator-facing summary of the run.
    #[must_use]
    pub fn message(&self, name: &str) -> String {
        match &self.failure {
            None if self.is_success() => format!("{name} executed successfully."),
            None | Some(ExecutionFailure::NonZeroExit { .. }) => {
                let err = self.stderr.trim();
                let err = if err.is_empty() { "Unknown error" } else { err };
                format!("Error in {name}:\n{err}")
            }
            Some(f @ ExecutionFailure::ScriptNotFound { .. }) => f.to_string(),
            Some(ExecutionFailure::LaunchFailure { reason, .. }) => {
                format!("Failed to run {name}: {reason}")
            }
        }
    }
}

/// Runs `task` to completion and captures its output. Every failure mode is
/// folded into the returned result.
pub async fn execute(task: &TaskDefinition, run_id: String) -> ExecutionResult {
    let started = Instant::now();

    if !matches!(tokio::fs::try_exists(&task.executable_path).await, Ok(true)) {
        tracing::warn!(
            task = %task.name,
            path = %task.executable_path.display(),
            "script not found"
        );
        return ExecutionResult::not_found(task, run_id);
    }

    let argv = build_command(task);
    spawn_and_wait(task, run_id, &argv, started).await
}

async fn spawn_and_wait(
    task: &TaskDefinition,
    run_id: String,
    argv: &[String],
    started: Instant,
) -> ExecutionResult {
    let Some((program, args)) = argv.split_first() else {
        let err = std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line");
        return ExecutionResult::launch_failed(task, run_id, "", &err, started.elapsed());
    };

    tracing::info!(
        task = %task.name,
        run_id = %run_id,
        command = %display_command(argv),
        "launching script"
    );

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    // The engine owns the terminal; a script that prompts would hang forever.
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let result = match cmd.output().await {
        Ok(output) => ExecutionResult::from_output(task, run_id, &output, started.elapsed()),
        Err(e) => {
            tracing::error!(task = %task.name, program = %program, error = %e, "failed to launch");
            ExecutionResult::launch_failed(task, run_id, program, &e, started.elapsed())
        }
    };

    if let Some(code) = result.exit_code {
        tracing::info!(
            task = %task.name,
            run_id = %result.run_id,
            exit_code = code,
            elapsed_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "script exited"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::PathBuf;

    use super::*;
    use crate::task::model::PrivilegeMode;

    fn task(path: PathBuf) -> TaskDefinition {
        TaskDefinition {
            index: 3,
            name: "kiwi".to_owned(),
            executable_path: path,
            privilege: PrivilegeMode::Normal,
            description: String::new(),
            troubleshooting_hint: None,
        }
    }

    fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("task.sh");
        let mut f = std::fs::File::create(&path).expect("create script");
        writeln!(f, "{body}").expect("write script");
        path
    }

    #[tokio::test]
    async fn missing_script_is_reported_without_launching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let t = task(dir.path().join("nope.sh"));
        let res = execute(&t, "run-1".to_owned()).await;
        assert_eq!(res.exit_code, None);
        assert_eq!(res.stderr, "not found");
        assert_eq!(res.task_index, 3);
        assert!(matches!(res.failure, Some(ExecutionFailure::ScriptNotFound { .. })));
        assert!(res.message("kiwi").starts_with("script not found at "));
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let t = task(script(&dir, "echo hello\necho 'perm denied' >&2\nexit 3"));
        let res = execute(&t, "run-2".to_owned()).await;
        assert_eq!(res.exit_code, Some(3));
        assert_eq!(res.stdout.trim(), "hello");
        assert_eq!(res.stderr.trim(), "perm denied");
        assert_eq!(res.failure, Some(ExecutionFailure::NonZeroExit { code: 3 }));
        assert_eq!(res.message("kiwi"), "Error in kiwi:\nperm denied");
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let t = task(script(&dir, "exit 0"));
        let res = execute(&t, "run-3".to_owned()).await;
        assert!(res.is_success());
        assert_eq!(res.failure, None);
        assert_eq!(res.message("kiwi"), "kiwi executed successfully.");
    }

    #[tokio::test]
    async fn unlaunchable_program_is_a_launch_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = script(&dir, "exit 0");
        let t = task(path.clone());
        let argv = vec![
            "/nonexistent-scriptgate-bin".to_owned(),
            path.to_string_lossy().into_owned(),
        ];
        let spawn_err = std::process::Command::new(&argv[0])
            .output()
            .expect_err("program must not exist");

        let res = spawn_and_wait(&t, "run-4".to_owned(), &argv, Instant::now()).await;
        assert_eq!(res.exit_code, None);
        assert!(!res.is_success());
        assert_eq!(res.stderr, spawn_err.to_string());
        assert!(matches!(
            &res.failure,
            Some(ExecutionFailure::LaunchFailure { program, .. }) if program == "/nonexistent-scriptgate-bin"
        ));
        assert!(res.message("kiwi").starts_with("Failed to run kiwi: "));
        assert_eq!(res.message("kiwi"), format!("Failed to run kiwi: {spawn_err}"));
    }

    #[tokio::test]
    async fn empty_command_line_is_a_launch_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let t = task(script(&dir, "exit 0"));
        let res = spawn_and_wait(&t, "run-5".to_owned(), &[], Instant::now()).await;
        assert_eq!(res.exit_code, None);
        assert_eq!(res.message("kiwi"), "Failed to run kiwi: empty command line");
    }

    #[test]
    fn empty_stderr_reads_as_unknown_error() {
        let res = ExecutionResult {
            task_index: 0,
            run_id: "r".to_owned(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "  \n".to_owned(),
            failure: Some(ExecutionFailure::NonZeroExit { code: 1 }),
            duration: Duration::ZERO,
        };
        assert_eq!(res.message("fig"), "Error in fig:\nUnknown error");
    }
}
