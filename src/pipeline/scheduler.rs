//! Cooperative scheduler thread
//!
//! A dedicated thread runs a current-thread tokio runtime driving a
//! [`LocalSet`]. Other threads never touch its state: they post closures
//! through a [`SchedulerHandle`], which run on the scheduler thread with access
//! to the [`SchedulerContext`] (session slot, local task spawning, shutdown
//! token).

use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use std::thread::{JoinHandle, ThreadId};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::assets::{HEALTH_LOG_INTERVAL, STALL_THRESHOLD};
use crate::pipeline::health::PipelineHealth;
use crate::session::Session;

/// How long shutdown waits for local tasks after cancelling them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to start scheduler: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("scheduler is not running")]
    Stopped,

    #[error("blocking request issued from the scheduler thread")]
    Reentrant,
}

type Job = Box<dyn FnOnce(&SchedulerContext) + Send>;

enum Command {
    Run(Job),
    Shutdown,
}

/// State reachable only from the scheduler thread
#[derive(Clone)]
pub struct SchedulerContext {
    session: Rc<RefCell<Option<Session>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SchedulerContext {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            session: Rc::new(RefCell::new(None)),
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    /// Move the session out of its slot, e.g. to await a connector call
    pub fn take_session(&self) -> Option<Session> {
        self.session.borrow_mut().take()
    }

    pub fn set_session(&self, session: Session) {
        *self.session.borrow_mut() = Some(session);
    }

    pub fn has_session(&self) -> bool {
        self.session.borrow().is_some()
    }

    /// Cancelled when the scheduler shuts down
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.tasks.spawn_local(future)
    }
}

/// Cloneable sender side of the scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    thread_id: ThreadId,
}

impl SchedulerHandle {
    /// Post `job` to run on the scheduler thread, in submission order
    pub fn call_soon<F>(&self, job: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&SchedulerContext) + Send + 'static,
    {
        self.tx
            .send(Command::Run(Box::new(job)))
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Run the future built by `f` on the scheduler and block until it completes
    pub fn run_blocking<F, Fut, T>(&self, f: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&SchedulerContext) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        if self.is_scheduler_thread() {
            return Err(SchedulerError::Reentrant);
        }

        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        self.call_soon(move |ctx| {
            let future = f(ctx);
            ctx.spawn(async move {
                let _ = reply_tx.send(future.await);
            });
        })?;
        reply_rx.recv().map_err(|_| SchedulerError::Stopped)
    }

    pub fn is_scheduler_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner of the scheduler thread
pub struct Scheduler {
    handle: SchedulerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(health: Arc<PipelineHealth>) -> Result<Self, SchedulerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name(String::from("kandar-scheduler"))
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&runtime, run(rx, health));
                debug!("Scheduler: thread exiting");
            })?;

        let handle = SchedulerHandle {
            tx,
            thread_id: thread.thread().id(),
        };
        info!("Scheduler: started");

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop the event loop and wait for the thread to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.handle.tx.send(Command::Shutdown);
        if self.handle.is_scheduler_thread() {
            error!("Scheduler: shutdown requested from its own thread, not joining");
            return;
        }
        if thread.join().is_err() {
            error!("Scheduler: thread panicked");
        }
        info!("Scheduler: stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Log the periodic health line. Returns whether the pipeline looks stalled.
fn report_health(health: &PipelineHealth) -> bool {
    let stalled = health.is_stalled(STALL_THRESHOLD);
    if stalled {
        warn!(
            "Pipeline: nothing forwarded for over {:?}. {}",
            STALL_THRESHOLD,
            health.summary()
        );
    } else {
        info!("Pipeline: {}", health.summary());
    }
    stalled
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, health: Arc<PipelineHealth>) {
    let cancel = CancellationToken::new();
    let ctx = SchedulerContext::new(cancel.clone());

    let token = cancel.clone();
    ctx.spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    report_health(&health);
                }
            }
        }
    });

    while let Some(command) = rx.recv().await {
        match command {
            Command::Run(job) => job(&ctx),
            Command::Shutdown => break,
        }
    }

    cancel.cancel();
    if ctx.has_session() {
        error!("Scheduler: shutting down with a live session");
    }

    ctx.tasks.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, ctx.tasks.wait())
        .await
        .is_err()
    {
        error!(
            "Scheduler: {} task(s) ignored cancellation, dropping them",
            ctx.tasks.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler() -> Scheduler {
        Scheduler::spawn(Arc::new(PipelineHealth::new())).unwrap()
    }

    #[test]
    fn test_call_soon_runs_in_order_on_scheduler_thread() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        let (tx, rx) = std::sync::mpsc::channel();

        for i in 0..5 {
            let tx = tx.clone();
            let inner = handle.clone();
            handle
                .call_soon(move |_| {
                    tx.send((i, inner.is_scheduler_thread())).unwrap();
                })
                .unwrap();
        }

        let got: Vec<_> = (0..5).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, (0..5).map(|i| (i, true)).collect::<Vec<_>>());
        assert!(!handle.is_scheduler_thread());
        scheduler.shutdown();
    }

    #[test]
    fn test_run_blocking_returns_future_output() {
        let scheduler = scheduler();
        let value = scheduler
            .handle()
            .run_blocking(|_| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                42
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_session_slot_survives_between_jobs() {
        let scheduler = scheduler();
        let handle = scheduler.handle();

        handle
            .run_blocking(|ctx| {
                ctx.set_session(Session::new("s-1", "wss://example.test"));
                async {}
            })
            .unwrap();
        let id = handle
            .run_blocking(|ctx| {
                let session = ctx.take_session();
                async move { session.map(|s| s.id) }
            })
            .unwrap();
        assert_eq!(id.as_deref(), Some("s-1"));
    }

    #[test]
    fn test_reentrant_blocking_call_rejected() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        let inner = handle.clone();

        let result = handle
            .run_blocking(move |_| {
                let nested = inner.run_blocking(|_| async {});
                async move { nested }
            })
            .unwrap();
        assert!(matches!(result, Err(SchedulerError::Reentrant)));
    }

    #[test]
    fn test_health_report_flags_stall() {
        let health = PipelineHealth::new();
        assert!(!report_health(&health));

        let stale = health.last_frame_time.load(Ordering::Relaxed)
            - (STALL_THRESHOLD.as_micros() as u64 + 1_000_000);
        health.last_frame_time.store(stale, Ordering::Relaxed);
        assert!(report_health(&health));
    }

    #[test]
    fn test_shutdown_joins_and_cancels_tasks() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        handle
            .call_soon(move |ctx| {
                let token = ctx.cancellation();
                ctx.spawn(async move {
                    token.cancelled().await;
                    done.fetch_add(1, Ordering::SeqCst);
                });
            })
            .unwrap();

        scheduler.shutdown();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.call_soon(|_| {}),
            Err(SchedulerError::Stopped)
        ));
    }
}
