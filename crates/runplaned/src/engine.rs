//! Local execution: runs a configured command for each phase of a task.
//!
//! The command sees the task through environment variables
//! (`RUNPLANE_TASK_ID`, `RUNPLANE_WORKSPACE_ID`, `RUNPLANE_TASK_KIND`,
//! `RUNPLANE_ACTION`). Exit status 0 advances the task; anything else fails
//! it with the last line of stderr as the error message.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use runplane_capacity::BoxFuture;
use runplane_scheduler::{AgentAction, ExecutionEngine};
use runplane_state::{Clock, Stage, StateStore, Task, TaskKind, TaskStatus};

const MAX_ERROR_LEN: usize = 500;

/// One program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Base directory; the workspace ID is appended when `per_workspace_dir` is set.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub per_workspace_dir: bool,
}

/// `[local]` section: what to run for plans and applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalExecution {
    pub plan: Option<CommandSpec>,
    pub apply: Option<CommandSpec>,
}

enum Exit {
    Success,
    Failure(String),
}

pub struct CommandEngine {
    store: StateStore,
    clock: Arc<dyn Clock>,
    commands: LocalExecution,
}

impl CommandEngine {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, commands: LocalExecution) -> Self {
        Self {
            store,
            clock,
            commands,
        }
    }

    async fn invoke(&self, spec: &CommandSpec, task: &Task, action: AgentAction) -> anyhow::Result<Exit> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env("RUNPLANE_TASK_ID", task.id.to_string())
            .env("RUNPLANE_WORKSPACE_ID", &task.workspace_id)
            .env("RUNPLANE_TASK_KIND", task.kind.as_str())
            .env("RUNPLANE_ACTION", action.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            let dir = if spec.per_workspace_dir {
                dir.join(&task.workspace_id)
            } else {
                dir.clone()
            };
            cmd.current_dir(dir);
        }

        debug!(task_id = task.id, program = %spec.program, %action, "spawning local command");
        let output = cmd.output().await?;
        if output.status.success() {
            return Ok(Exit::Success);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut message = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("{} exited with {}", spec.program, output.status));
        if message.len() > MAX_ERROR_LEN {
            let mut cut = MAX_ERROR_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Ok(Exit::Failure(message))
    }

    fn fail(&self, task: &Task, message: String) -> anyhow::Result<()> {
        let now = self.clock.now_secs();
        warn!(task_id = task.id, workspace_id = %task.workspace_id, error = %message, "local command failed");
        self.store.update_task(task.id, |t| {
            t.error_message = Some(message);
            t.finish(TaskStatus::Failed, now)
        })?;
        Ok(())
    }
}

impl ExecutionEngine for CommandEngine {
    fn execute_plan<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let Some(spec) = &self.commands.plan else {
                anyhow::bail!("no local plan command configured");
            };
            match self.invoke(spec, task, AgentAction::Plan).await? {
                Exit::Failure(message) => self.fail(task, message),
                Exit::Success => {
                    let now = self.clock.now_secs();
                    let task = self.store.update_task(task.id, |t| {
                        if t.kind == TaskKind::PlanAndApply {
                            t.stage = Some(Stage::ApplyPending);
                            t.transition_to(TaskStatus::ApplyPending)
                        } else {
                            t.finish(TaskStatus::Success, now)
                        }
                    })?;
                    info!(task_id = task.id, status = %task.status, "local plan finished");
                    Ok(())
                }
            }
        })
    }

    fn execute_apply<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let Some(spec) = &self.commands.apply else {
                anyhow::bail!("no local apply command configured");
            };
            match self.invoke(spec, task, AgentAction::Apply).await? {
                Exit::Failure(message) => self.fail(task, message),
                Exit::Success => {
                    let now = self.clock.now_secs();
                    self.store
                        .update_task(task.id, |t| t.finish(TaskStatus::Applied, now))?;
                    info!(task_id = task.id, "local apply finished");
                    Ok(())
                }
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use runplane_state::ManualClock;

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            per_workspace_dir: false,
        }
    }

    fn running(store: &StateStore, kind: TaskKind) -> Task {
        let task = store.create_task(Task::new("ws-1", kind, 1_000)).unwrap();
        store
            .update_task(task.id, |t| {
                t.transition_to(TaskStatus::Running)?;
                t.stage = Some(Stage::Planning);
                Ok(())
            })
            .unwrap()
    }

    fn engine(store: &StateStore, commands: LocalExecution) -> CommandEngine {
        CommandEngine::new(store.clone(), Arc::new(ManualClock::new(2_000)), commands)
    }

    #[tokio::test]
    async fn plan_and_apply_stops_at_apply_pending() {
        let store = StateStore::open_in_memory().unwrap();
        let engine = engine(
            &store,
            LocalExecution {
                plan: Some(spec("true", &[])),
                apply: None,
            },
        );
        let task = running(&store, TaskKind::PlanAndApply);

        engine.execute_plan(&task).await.unwrap();
        let task = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::ApplyPending);
        assert_eq!(task.stage, Some(Stage::ApplyPending));
    }

    #[tokio::test]
    async fn plain_plan_succeeds() {
        let store = StateStore::open_in_memory().unwrap();
        let engine = engine(
            &store,
            LocalExecution {
                plan: Some(spec("true", &[])),
                apply: None,
            },
        );
        let task = running(&store, TaskKind::Plan);

        engine.execute_plan(&task).await.unwrap();
        let task = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.completed_at, Some(2_000));
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let store = StateStore::open_in_memory().unwrap();
        let engine = engine(
            &store,
            LocalExecution {
                plan: Some(spec("sh", &["-c", "echo \"provider init failed\" >&2; exit 3"])),
                apply: None,
            },
        );
        let task = running(&store, TaskKind::Plan);

        engine.execute_plan(&task).await.unwrap();
        let task = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("provider init failed"));
    }

    #[tokio::test]
    async fn command_sees_task_environment() {
        let store = StateStore::open_in_memory().unwrap();
        let engine = engine(
            &store,
            LocalExecution {
                plan: Some(spec(
                    "sh",
                    &["-c", "test \"$RUNPLANE_WORKSPACE_ID:$RUNPLANE_ACTION\" = ws-1:plan"],
                )),
                apply: None,
            },
        );
        let task = running(&store, TaskKind::DriftCheck);

        engine.execute_plan(&task).await.unwrap();
        assert_eq!(
            store.get_task(task.id).unwrap().unwrap().status,
            TaskStatus::Success
        );
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let store = StateStore::open_in_memory().unwrap();
        let engine = engine(&store, LocalExecution::default());
        let task = running(&store, TaskKind::Plan);

        let err = engine.execute_apply(&task).await.unwrap_err();
        assert!(err.to_string().contains("no local apply command"));
        // The dispatcher, not the engine, fails the task in this case.
        assert_eq!(
            store.get_task(task.id).unwrap().unwrap().status,
            TaskStatus::Running
        );
    }
}
