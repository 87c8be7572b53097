// src/exec/touch.rs

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::dag::dagcuter::BoxFuture;
use crate::lifecycle::ExecCode;

use super::{ExecContext, StepExecutor, parse_content, workspace_path};

#[derive(Debug, Deserialize)]
struct TouchSpec {
    path: String,
    #[serde(default)]
    overwrite: bool,
    #[serde(default)]
    content: String,
}

/// Writes a file inside the task workspace: replaced when `overwrite` is
/// set, otherwise created or appended to.
pub struct TouchExecutor {
    ctx: ExecContext,
}

pub fn factory(ctx: ExecContext) -> anyhow::Result<Box<dyn StepExecutor>> {
    Ok(Box::new(TouchExecutor { ctx }))
}

impl StepExecutor for TouchExecutor {
    fn run(&self, _cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<i64>> {
        Box::pin(async move {
            let spec: TouchSpec = parse_content(&self.ctx.content)?;
            let rel = workspace_path(&spec.path)?;
            let target = self.ctx.workspace.join(&rel);

            if spec.overwrite {
                self.ctx.log.write(format!("overwrite {}", rel.display()));
                tokio::fs::write(&target, spec.content.as_bytes()).await?;
            } else {
                self.ctx.log.write(format!("create or append {}", rel.display()));
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&target)
                    .await?;
                file.write_all(spec.content.as_bytes()).await?;
                file.flush().await?;
            }
            Ok(ExecCode::Success.code())
        })
    }

    fn clear(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
