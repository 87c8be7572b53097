use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use dagflow::dag::dagcuter::BoxFuture;
use dagflow::exec::{parse_content, ExecContext, ExecutorRegistry, StepExecutor};

/// Step type handled by [`FakeExecutors`].
pub const FAKE_KIND: &str = "fake";

/// What a fake step does, carried as the step's JSON content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeScript {
    /// Exit code once the step gets past `fail_times`.
    pub code: i64,
    /// Sleep this long before returning (interrupted by cancellation).
    pub sleep_ms: u64,
    /// The first `fail_times` attempts exit with code 1.
    pub fail_times: u32,
    /// Panic inside `run`.
    pub panic: bool,
    /// Block until [`FakeExecutors::release`] or cancellation.
    pub wait_release: bool,
    /// The factory refuses to build the executor.
    pub broken: bool,
}

impl FakeScript {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn exit(code: i64) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    pub fn sleep(ms: u64) -> Self {
        Self {
            sleep_ms: ms,
            ..Self::default()
        }
    }

    pub fn flaky(fail_times: u32) -> Self {
        Self {
            fail_times,
            ..Self::default()
        }
    }

    pub fn panics() -> Self {
        Self {
            panic: true,
            ..Self::default()
        }
    }

    pub fn blocking() -> Self {
        Self {
            wait_release: true,
            ..Self::default()
        }
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn content(&self) -> String {
        serde_json::to_string(self).expect("fake script is serialisable")
    }
}

#[derive(Default)]
struct Shared {
    runs: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, u32>>,
    cleared: Mutex<Vec<String>>,
    release: CancellationToken,
}

/// Records every fake step that runs and lets tests unblock waiting ones.
///
/// Entries are keyed `task/step`.
#[derive(Clone, Default)]
pub struct FakeExecutors {
    shared: Arc<Shared>,
}

impl FakeExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in executors plus the `fake` kind.
    pub fn registry(&self) -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::with_builtins();
        self.install(&mut registry);
        registry
    }

    pub fn install(&self, registry: &mut ExecutorRegistry) {
        let shared = Arc::clone(&self.shared);
        registry.register(FAKE_KIND, move |ctx: ExecContext| {
            let script: FakeScript = parse_content(&ctx.content)?;
            if script.broken {
                anyhow::bail!("fake executor refused to start");
            }
            Ok(Box::new(FakeStep {
                key: format!("{}/{}", ctx.task, ctx.step),
                script,
                shared: Arc::clone(&shared),
            }) as Box<dyn StepExecutor>)
        });
    }

    /// Started attempts in start order.
    pub fn runs(&self) -> Vec<String> {
        self.shared.runs.lock().unwrap().clone()
    }

    pub fn attempts(&self, task: &str, step: &str) -> u32 {
        let key = format!("{task}/{step}");
        self.shared
            .attempts
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    pub fn cleared(&self) -> Vec<String> {
        self.shared.cleared.lock().unwrap().clone()
    }

    /// Unblock every `wait_release` step, now and later.
    pub fn release(&self) {
        self.shared.release.cancel();
    }

    /// Wait until `key` has started at least once.
    pub async fn wait_started(&self, key: &str) {
        while !self.runs().iter().any(|r| r == key) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct FakeStep {
    key: String,
    script: FakeScript,
    shared: Arc<Shared>,
}

impl StepExecutor for FakeStep {
    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<i64>> {
        Box::pin(async move {
            let attempt = {
                let mut attempts = self.shared.attempts.lock().unwrap();
                let n = attempts.entry(self.key.clone()).or_default();
                *n += 1;
                *n
            };
            self.shared.runs.lock().unwrap().push(self.key.clone());

            if self.script.panic {
                panic!("fake step {} exploded", self.key);
            }
            if self.script.wait_release {
                tokio::select! {
                    _ = self.shared.release.cancelled() => {}
                    _ = cancel.cancelled() => return Ok(-1),
                }
            }
            if self.script.sleep_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.script.sleep_ms)) => {}
                    _ = cancel.cancelled() => return Ok(-1),
                }
            }
            if attempt <= self.script.fail_times {
                return Ok(1);
            }
            Ok(self.script.code)
        })
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.shared.cleared.lock().unwrap().push(self.key.clone());
        Ok(())
    }
}
