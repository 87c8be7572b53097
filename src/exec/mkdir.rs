// src/exec/mkdir.rs

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::dag::dagcuter::BoxFuture;
use crate::lifecycle::ExecCode;

use super::{ExecContext, StepExecutor, parse_content, workspace_path};

#[derive(Debug, Deserialize)]
struct MkdirSpec {
    path: String,
}

/// Creates a directory (and its parents) inside the task workspace.
pub struct MkdirExecutor {
    ctx: ExecContext,
}

pub fn factory(ctx: ExecContext) -> anyhow::Result<Box<dyn StepExecutor>> {
    Ok(Box::new(MkdirExecutor { ctx }))
}

impl StepExecutor for MkdirExecutor {
    fn run(&self, _cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<i64>> {
        Box::pin(async move {
            let spec: MkdirSpec = parse_content(&self.ctx.content)?;
            let rel = workspace_path(&spec.path)?;
            self.ctx.log.write(format!("mkdir -p {}", rel.display()));
            tokio::fs::create_dir_all(self.ctx.workspace.join(&rel)).await?;
            Ok(ExecCode::Success.code())
        })
    }

    fn clear(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::exec::StepLog;

    #[tokio::test]
    async fn creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let exec = factory(ExecContext {
            task: "t".into(),
            step: "s".into(),
            subcommand: String::new(),
            content: r#"{"path": "a/b/c"}"#.into(),
            env: BTreeMap::new(),
            workspace: dir.path().to_path_buf(),
            script_dir: dir.path().join("scripts"),
            log: StepLog::detached("t", "s"),
        })
        .unwrap();

        assert_eq!(exec.run(CancellationToken::new()).await.unwrap(), 0);
        assert!(dir.path().join("a/b/c").is_dir());
    }
}
