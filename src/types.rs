// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// How a task's steps are wired together.
///
/// - `Chain`: steps run one after another in declaration order; any
///   `depends` entries are replaced by "the previous step".
/// - `Dag`: steps run as soon as their explicit `depends` are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Chain,
    Dag,
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "chain" => Ok(TaskKind::Chain),
            "dag" => Ok(TaskKind::Dag),
            other => Err(format!(
                "invalid task kind: {other} (expected \"chain\" or \"dag\")"
            )),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Chain => f.write_str("chain"),
            TaskKind::Dag => f.write_str("dag"),
        }
    }
}

/// Node name used for dispatch to whichever node picks the task up first.
pub const ANY_NODE: &str = "random";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_parses_case_insensitively() {
        assert_eq!("DAG".parse::<TaskKind>().unwrap(), TaskKind::Dag);
        assert_eq!("".parse::<TaskKind>().unwrap(), TaskKind::Chain);
        assert!("tree".parse::<TaskKind>().is_err());
    }
}
