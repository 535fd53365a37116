//! Start/stop bookkeeping shared by the background services.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CollectorError, Result};

/// Service lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Running,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Running => write!(f, "running"),
        }
    }
}

/// Holds a service's running flag for as long as its loop is alive.
/// Dropping the guard clears the flag, including on panic or early return.
#[derive(Debug)]
pub struct RunningGuard {
    running: Arc<AtomicBool>,
}

impl RunningGuard {
    /// Claim the flag; `None` when another run already holds it
    pub fn acquire(running: &Arc<AtomicBool>) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                running: running.clone(),
            })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One spawned loop per service, with a stop token and a join handle
pub struct ServiceHandle {
    name: &'static str,
    running: Arc<AtomicBool>,
    task: Mutex<Option<RunningTask>>,
}

impl ServiceHandle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ServiceState {
        if self.is_running() {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        }
    }

    /// Spawn the service loop unless one is already live.
    ///
    /// `run` receives the loop's stop token. Returns false for a repeated start.
    pub fn spawn<F, Fut>(&self, run: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut task = self.lock();
        let Some(guard) = RunningGuard::acquire(&self.running) else {
            debug!(service = self.name, "already running, start ignored");
            return false;
        };

        let cancel = CancellationToken::new();
        let fut = run(cancel.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });

        *task = Some(RunningTask { cancel, handle });
        true
    }

    /// Signal the loop to exit without waiting for it
    pub fn signal_stop(&self) {
        if let Some(task) = self.lock().as_ref() {
            task.cancel.cancel();
        }
    }

    /// Signal the loop to exit and wait until it has.
    /// The running flag is clear by the time this returns.
    pub async fn stop(&self) {
        let task = self.lock().take();
        let Some(task) = task else {
            return;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(service = self.name, error = %e, "service task ended abnormally");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CollectorError::Cancelled),
        res = fut => res,
    }
}

/// Sleep for `duration` unless `cancel` fires first
pub async fn sleep_or_cancel(
    cancel: &CancellationToken,
    duration: std::time::Duration,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CollectorError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// A token cancelled by either parent
pub fn linked_token(service: &CancellationToken, caller: &CancellationToken) -> CancellationToken {
    let child = service.child_token();
    if caller.is_cancelled() {
        child.cancel();
        return child;
    }
    let linked = child.clone();
    let caller = caller.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => linked.cancel(),
            _ = linked.cancelled() => {}
        }
    });
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_double_spawn_keeps_one_loop() {
        let handle = ServiceHandle::new("test");
        let first = handle.spawn(|cancel| async move { cancel.cancelled().await });
        let second = handle.spawn(|cancel| async move { cancel.cancelled().await });

        assert!(first);
        assert!(!second);
        assert_eq!(handle.state(), ServiceState::Running);

        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let handle = ServiceHandle::new("test");
        assert!(handle.spawn(|cancel| async move { cancel.cancelled().await }));
        handle.stop().await;
        assert!(handle.spawn(|cancel| async move { cancel.cancelled().await }));
        handle.stop().await;
        assert_eq!(handle.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let handle = ServiceHandle::new("test");
        handle.stop().await;
        handle.signal_stop();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_guard_is_exclusive() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = RunningGuard::acquire(&flag).unwrap();
        assert!(RunningGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(RunningGuard::acquire(&flag).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linked_token_follows_caller() {
        let service = CancellationToken::new();
        let caller = CancellationToken::new();
        let linked = linked_token(&service, &caller);

        caller.cancel();
        tokio::time::timeout(Duration::from_secs(1), linked.cancelled())
            .await
            .unwrap();
        assert!(!service.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<u32> = cancellable(&cancel, async { Ok(7) }).await;
        assert!(res.unwrap_err().is_cancelled());
    }
}
