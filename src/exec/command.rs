// src/exec/command.rs

//! `exec` executor: writes the step content to a script file and runs it.
//!
//! The subcommand picks the interpreter (`exec@bash`, `exec@python3`, ...).
//! Plain `exec` runs scripts under `sh` (`cmd /C` on Windows).

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dag::dagcuter::BoxFuture;
use crate::lifecycle::ExecCode;

use super::{ExecContext, StepExecutor, StepLog};

pub struct ShellExecutor {
    ctx: ExecContext,
    shell: String,
    script: PathBuf,
}

/// Picks the script path only; the file is written when the step runs.
pub fn factory(ctx: ExecContext) -> anyhow::Result<Box<dyn StepExecutor>> {
    let shell = ctx.subcommand.trim().to_lowercase();
    let script = ctx
        .script_dir
        .join(format!("{}{}", Uuid::new_v4().simple(), script_suffix(&shell)));
    Ok(Box::new(ShellExecutor { ctx, shell, script }))
}

fn script_suffix(shell: &str) -> &'static str {
    match shell {
        "python" | "python2" | "python3" | "py" | "py2" | "py3" => ".py",
        "cmd" => ".bat",
        "powershell" | "pwsh" => ".ps1",
        "" | "exec" if cfg!(windows) => ".bat",
        _ => ".sh",
    }
}

impl ShellExecutor {
    async fn write_script(&self) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        tokio::fs::create_dir_all(&ctx.script_dir)
            .await
            .with_context(|| format!("creating script dir {}", ctx.script_dir.display()))?;
        tokio::fs::write(&self.script, &ctx.content)
            .await
            .with_context(|| format!("writing script for step '{}/{}'", ctx.task, ctx.step))
    }

    fn command(&self) -> Command {
        let interpreter = match self.shell.as_str() {
            "" | "exec" if cfg!(windows) => "cmd",
            "" | "exec" => "sh",
            "py" | "py3" => "python3",
            "py2" => "python2",
            other => other,
        };
        let mut cmd = Command::new(interpreter);
        match interpreter {
            "cmd" => {
                cmd.arg("/C");
            }
            "powershell" | "pwsh" => {
                cmd.args(["-NoProfile", "-NonInteractive", "-File"]);
            }
            _ => {}
        }
        cmd.arg(&self.script);
        cmd
    }
}

fn pump<R>(reader: R, log: StepLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.write(line);
        }
    })
}

impl StepExecutor for ShellExecutor {
    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<i64>> {
        Box::pin(async move {
            let ctx = &self.ctx;
            // Retries rewrite the same file.
            self.write_script().await?;
            tokio::fs::create_dir_all(&ctx.workspace)
                .await
                .with_context(|| format!("creating workspace {}", ctx.workspace.display()))?;

            let mut cmd = self.command();
            cmd.current_dir(&ctx.workspace)
                .envs(ctx.envs())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            info!(task = %ctx.task, step = %ctx.step, script = %self.script.display(), "starting step process");
            let mut child = cmd
                .spawn()
                .with_context(|| format!("spawning process for step '{}/{}'", ctx.task, ctx.step))?;

            let mut pumps = Vec::new();
            if let Some(stdout) = child.stdout.take() {
                pumps.push(pump(stdout, ctx.log.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                pumps.push(pump(stderr, ctx.log.clone()));
            }

            let code = tokio::select! {
                status = child.wait() => {
                    let status = status.with_context(|| {
                        format!("waiting for process of step '{}/{}'", ctx.task, ctx.step)
                    })?;
                    // Killed by a signal: no exit code.
                    status.code().map(i64::from).unwrap_or(ExecCode::Failed.code())
                }
                _ = cancel.cancelled() => {
                    info!(task = %ctx.task, step = %ctx.step, "cancellation requested; killing process");
                    if let Err(e) = child.kill().await {
                        warn!(task = %ctx.task, step = %ctx.step, error = %e, "failed to kill child process");
                    }
                    // Grandchildren may still hold the pipes open.
                    for p in &pumps {
                        p.abort();
                    }
                    ExecCode::Killed.code()
                }
            };

            for p in pumps {
                let _ = p.await;
            }
            info!(task = %ctx.task, step = %ctx.step, exit_code = code, "step process exited");
            Ok(code)
        })
    }

    fn clear(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.script) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.script.display())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::lifecycle::Status;
    use crate::storage::{MemoryStorage, StepRecord, Storage, TaskRecord};
    use crate::types::TaskKind;

    fn storage_with_step() -> Arc<dyn Storage> {
        let storage = MemoryStorage::new();
        storage
            .create_task(
                TaskRecord {
                    name: "t".into(),
                    kind: TaskKind::Dag,
                    node: String::new(),
                    timeout: Duration::from_secs(60),
                    retry: None,
                    disable: false,
                    env: BTreeMap::new(),
                    status: Status::pending(""),
                    created_at: Utc::now(),
                },
                vec![StepRecord {
                    task: "t".into(),
                    name: "s".into(),
                    seq: 1,
                    kind: "exec".into(),
                    content: String::new(),
                    timeout: Duration::from_secs(60),
                    retry: None,
                    disable: false,
                    env: BTreeMap::new(),
                    depends: vec![],
                    status: Status::pending(""),
                }],
            )
            .unwrap();
        Arc::new(storage)
    }

    fn ctx(dir: &std::path::Path, content: &str, storage: Arc<dyn Storage>) -> ExecContext {
        ExecContext {
            task: "t".into(),
            step: "s".into(),
            subcommand: String::new(),
            content: content.into(),
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            workspace: dir.join("workspace"),
            script_dir: dir.join("scripts"),
            log: StepLog::new(storage, "t", "s"),
        }
    }

    #[tokio::test]
    async fn output_lands_in_step_log() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_step();
        let exec = factory(ctx(dir.path(), "echo $GREETING $TASK_STEP_NAME\nexit 3", Arc::clone(&storage))).unwrap();

        let code = exec.run(CancellationToken::new()).await.unwrap();
        assert_eq!(code, 3);
        let log = storage.step_log("t", "s").unwrap();
        assert_eq!(log[0].line, "hello s");

        exec.clear().unwrap();
        exec.clear().unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("scripts")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn script_is_written_when_the_step_runs() {
        let dir = tempfile::tempdir().unwrap();
        let exec = factory(ctx(dir.path(), "exit 0", storage_with_step())).unwrap();
        assert!(!dir.path().join("scripts").exists());
        exec.clear().unwrap();

        assert_eq!(exec.run(CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("scripts")).unwrap().count(), 1);
        exec.clear().unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("scripts")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let exec = factory(ctx(dir.path(), "sleep 30", storage_with_step())).unwrap();
        let token = CancellationToken::new();
        let killer = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killer.cancel();
        });

        let started = std::time::Instant::now();
        let code = exec.run(token).await.unwrap();
        assert_eq!(code, ExecCode::Killed.code());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
