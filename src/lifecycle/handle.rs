// src/lifecycle/handle.rs

//! In-memory execution handle for one live task or step.
//!
//! The handle carries the cancellation token handed to executors, the reason
//! it was cancelled (kill vs timeout), and the pause gate that holds back
//! work which has not started yet.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Why a handle's token was cancelled. The first cause recorded wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    Killed,
    Timeout,
}

#[derive(Debug)]
pub struct ExecutionHandle {
    name: String,
    token: CancellationToken,
    cause: Mutex<Option<CancelCause>>,
    control: Mutex<Option<CancellationToken>>,
    parent: Option<Arc<ExecutionHandle>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl ExecutionHandle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            token: CancellationToken::new(),
            cause: Mutex::new(None),
            control: Mutex::new(None),
            parent: None,
        })
    }

    /// Handle whose token is cancelled whenever `self`'s token is.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            token: self.token.child_token(),
            cause: Mutex::new(None),
            control: Mutex::new(None),
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cause of cancellation, inherited from the parent when this handle was
    /// cancelled through it.
    pub fn cause(&self) -> Option<CancelCause> {
        if let Some(cause) = *lock(&self.cause) {
            return Some(cause);
        }
        if self.token.is_cancelled() {
            return self.parent.as_ref().and_then(|p| p.cause());
        }
        None
    }

    fn cancel_with(&self, cause: CancelCause) {
        {
            let mut slot = lock(&self.cause);
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.token.cancel();
    }

    /// Forced termination requested by an operator.
    pub fn kill(&self) {
        self.cancel_with(CancelCause::Killed);
    }

    /// Deadline exceeded.
    pub fn expire(&self) {
        self.cancel_with(CancelCause::Timeout);
    }

    /// Close the pause gate. Returns the live control token and whether
    /// this call closed it; an already closed gate hands back its token.
    /// Cancelling the control token releases the gate.
    pub fn try_pause(&self) -> (CancellationToken, bool) {
        let mut control = lock(&self.control);
        if let Some(token) = control.as_ref() {
            return (token.clone(), false);
        }
        let token = CancellationToken::new();
        *control = Some(token.clone());
        (token, true)
    }

    /// Open the pause gate. Returns `false` when it was not closed.
    pub fn try_resume(&self) -> bool {
        match lock(&self.control).take() {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.control).is_some()
    }

    /// Wait until neither this handle nor any ancestor is paused.
    ///
    /// Returns `false` if the handle got cancelled while waiting.
    pub async fn wait_until_released(&self) -> bool {
        loop {
            if self.token.is_cancelled() {
                return false;
            }
            let gate = self.current_gate();
            let Some(gate) = gate else {
                return true;
            };
            tokio::select! {
                _ = gate.cancelled() => {}
                _ = self.token.cancelled() => return false,
            }
        }
    }

    fn current_gate(&self) -> Option<CancellationToken> {
        if let Some(gate) = lock(&self.control).clone() {
            return Some(gate);
        }
        self.parent.as_ref().and_then(|p| p.current_gate())
    }

    /// Drive `work` and expire the handle once `timeout` elapses.
    ///
    /// `work` is expected to observe the token and return soon after.
    pub async fn run_with_deadline<F, T>(&self, timeout: Option<Duration>, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let Some(timeout) = timeout.filter(|d| !d.is_zero()) else {
            return work.await;
        };
        tokio::pin!(work);
        tokio::select! {
            res = &mut work => return res,
            _ = tokio::time::sleep(timeout) => self.expire(),
        }
        work.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cause_wins() {
        let h = ExecutionHandle::new("t");
        h.expire();
        h.kill();
        assert_eq!(h.cause(), Some(CancelCause::Timeout));
        assert!(h.is_cancelled());
    }

    #[test]
    fn child_inherits_parent_cause() {
        let task = ExecutionHandle::new("t");
        let step = task.child("t/s");
        task.kill();
        assert!(step.is_cancelled());
        assert_eq!(step.cause(), Some(CancelCause::Killed));
    }

    #[tokio::test]
    async fn gate_blocks_until_resume() {
        let task = ExecutionHandle::new("t");
        let step = task.child("t/s");
        let (first, closed) = task.try_pause();
        assert!(closed);
        let (again, closed_again) = task.try_pause();
        assert!(!closed_again);
        assert!(!again.is_cancelled());

        let waiter = {
            let step = Arc::clone(&step);
            tokio::spawn(async move { step.wait_until_released().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(task.try_resume());
        assert!(first.is_cancelled());
        // The second pause handed out the same gate.
        assert!(again.is_cancelled());
        assert!(waiter.await.unwrap());
        assert!(!task.try_resume());
    }

    #[tokio::test]
    async fn kill_releases_waiters() {
        let h = ExecutionHandle::new("s");
        h.try_pause();
        let waiter = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.wait_until_released().await })
        };
        h.kill();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn deadline_expires_handle() {
        let h = ExecutionHandle::new("s");
        let token = h.token();
        let res = h
            .run_with_deadline(Some(Duration::from_millis(20)), async move {
                token.cancelled().await;
                "stopped"
            })
            .await;
        assert_eq!(res, "stopped");
        assert_eq!(h.cause(), Some(CancelCause::Timeout));
    }
}
