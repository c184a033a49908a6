use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinHandle, LocalSet};
use tokio::time::{self, MissedTickBehavior};

use super::config::SchedulerConfig;
use super::supervisor::Supervisor;
use super::{is_shutdown, wait_for_shutdown};
use crate::error::{NodeError, NodeResult, TaskFault};

/// Counters describing what the run-loop has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub spawned: u64,
    pub completed: u64,
    pub faults: u64,
    pub panics: u64,
    pub sweeps: u64,
    pub periodic_runs: u64,
    pub periodic_errors: u64,
    pub active: usize,
}

type FaultHook = Rc<dyn Fn(&TaskFault)>;

struct SchedulerShared {
    stats: RefCell<SchedulerStats>,
    fault_hooks: RefCell<Vec<FaultHook>>,
    shutdown: watch::Receiver<bool>,
    last_fault: RefCell<Option<TaskFault>>,
}

impl SchedulerShared {
    fn report(&self, fault: TaskFault) {
        {
            let mut stats = self.stats.borrow_mut();
            stats.faults += 1;
            if fault.panicked {
                stats.panics += 1;
            }
        }
        log::error!("{}", fault);
        // hooks may register further hooks, so call a snapshot
        let hooks: Vec<FaultHook> = self.fault_hooks.borrow().clone();
        for hook in hooks {
            hook(&fault);
        }
        *self.last_fault.borrow_mut() = Some(fault);
    }
}

/// Thread-safe trigger for a cooperative shutdown
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Cloneable handle for spawning onto the run-loop.
///
/// Spawning through a handle must happen from code already running on the
/// scheduler; use [`Scheduler::spawn`] from outside.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Rc<SchedulerShared>,
}

impl SchedulerHandle {
    /// Spawn a named task. An error or panic is caught at the task boundary,
    /// reported to the fault hooks and the task is abandoned.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> JoinHandle<()>
    where
        F: Future<Output = NodeResult<()>> + 'static,
    {
        tokio::task::spawn_local(supervised(self.shared.clone(), name.into(), future))
    }

    /// Run `task` every `period`, first invocation immediately, until shutdown.
    ///
    /// An invocation returning an error is logged and the cadence continues. A panic
    /// abandons the task.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: impl Into<String>,
        period: Duration,
        task: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + 'static,
        Fut: Future<Output = NodeResult<()>> + 'static,
    {
        let name = name.into();
        let body = periodic(self.shared.clone(), name.clone(), period, task);
        self.spawn(name, body)
    }

    /// Surface a fault raised outside a scheduled task, e.g. in a message handler.
    pub fn report_fault(&self, fault: TaskFault) {
        self.shared.report(fault);
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        is_shutdown(&self.shared.shutdown)
    }

    /// Resolves once shutdown has been requested
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shared.shutdown.clone();
        wait_for_shutdown(&mut rx).await;
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.borrow().clone()
    }
}

// Counted as active from the moment it is spawned, not first polled.
fn supervised<F>(
    shared: Rc<SchedulerShared>,
    name: String,
    future: F,
) -> impl Future<Output = ()> + 'static
where
    F: Future<Output = NodeResult<()>> + 'static,
{
    {
        let mut stats = shared.stats.borrow_mut();
        stats.spawned += 1;
        stats.active += 1;
    }
    async move {
        let outcome = AssertUnwindSafe(future).catch_unwind().await;
        shared.stats.borrow_mut().active -= 1;
        match outcome {
            Ok(Ok(())) => {
                shared.stats.borrow_mut().completed += 1;
                log::debug!("Task '{}' finished", name);
            }
            Ok(Err(e)) => shared.report(TaskFault::from_error(&name, &e)),
            Err(payload) => shared.report(TaskFault::from_panic(&name, payload)),
        }
    }
}

async fn periodic<F, Fut>(
    shared: Rc<SchedulerShared>,
    name: String,
    period: Duration,
    mut task: F,
) -> NodeResult<()>
where
    F: FnMut() -> Fut + 'static,
    Fut: Future<Output = NodeResult<()>> + 'static,
{
    let mut shutdown = shared.shutdown.clone();
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            _ = ticker.tick() => {}
        }
        shared.stats.borrow_mut().periodic_runs += 1;
        if let Err(e) = task().await {
            shared.stats.borrow_mut().periodic_errors += 1;
            log::warn!("Periodic task '{}' failed: {}", name, e);
        }
    }
}

fn current_thread_runtime() -> NodeResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| NodeError::Scheduling(format!("failed to build runtime: {}", e)))
}

/// Single-threaded cooperative run-loop.
///
/// Tasks run on a tokio `LocalSet` until they suspend. Every sweep period the loop
/// passes the supervisor's service point, so a task that never yields starves the
/// watchdog and triggers a restart.
pub struct Scheduler {
    config: SchedulerConfig,
    local: LocalSet,
    shared: Rc<SchedulerShared>,
    shutdown: Arc<watch::Sender<bool>>,
    supervisor: Option<Rc<Supervisor>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            config,
            local: LocalSet::new(),
            shared: Rc::new(SchedulerShared {
                stats: RefCell::new(SchedulerStats::default()),
                fault_hooks: RefCell::new(Vec::new()),
                shutdown: rx,
                last_fault: RefCell::new(None),
            }),
            shutdown: Arc::new(tx),
            supervisor: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: Rc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn supervisor(&self) -> Option<&Rc<Supervisor>> {
        self.supervisor.as_ref()
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: self.shutdown.clone(),
        }
    }

    /// Register a hook called for every task fault, in registration order.
    pub fn on_fault(&self, hook: impl Fn(&TaskFault) + 'static) {
        self.shared.fault_hooks.borrow_mut().push(Rc::new(hook));
    }

    pub fn last_fault(&self) -> Option<TaskFault> {
        self.shared.last_fault.borrow().clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.borrow().clone()
    }

    /// Spawn from outside the run-loop. The task starts once the loop runs.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> JoinHandle<()>
    where
        F: Future<Output = NodeResult<()>> + 'static,
    {
        self.local
            .spawn_local(supervised(self.shared.clone(), name.into(), future))
    }

    /// Run the loop until `future` completes, sweeping all the while.
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        if let Some(supervisor) = &self.supervisor {
            if !supervisor.is_armed() {
                if let Err(e) = supervisor.arm() {
                    log::error!("Cannot arm liveness supervisor: {}", e);
                }
            }
        }

        self.local
            .run_until(async {
                tokio::pin!(future);
                let mut sweep = time::interval(self.config.sweep_period);
                sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        output = &mut future => return output,
                        _ = sweep.tick() => self.sweep(),
                    }
                }
            })
            .await
    }

    /// Sweep until shutdown is requested, then give tasks the grace period to wind
    /// down and disarm the supervisor.
    pub async fn run(&self) {
        let mut shutdown = self.shared.shutdown.clone();
        self.run_until(async move { wait_for_shutdown(&mut shutdown).await })
            .await;
        log::info!("Shutdown requested, draining tasks");
        self.drain().await;
        if let Some(supervisor) = &self.supervisor {
            supervisor.disarm();
        }
    }

    /// Run for at most `duration`, or until shutdown.
    pub async fn run_for(&self, duration: Duration) {
        let mut shutdown = self.shared.shutdown.clone();
        self.run_until(async move {
            tokio::select! {
                _ = time::sleep(duration) => {}
                _ = wait_for_shutdown(&mut shutdown) => {}
            }
        })
        .await;
    }

    /// Build a current-thread runtime and run `future` to completion on the loop.
    pub fn block_on<F: Future>(&self, future: F) -> NodeResult<F::Output> {
        Ok(current_thread_runtime()?.block_on(self.run_until(future)))
    }

    /// [`run`](Self::run) on a fresh current-thread runtime.
    pub fn run_blocking(&self) -> NodeResult<()> {
        current_thread_runtime()?.block_on(self.run());
        Ok(())
    }

    fn sweep(&self) {
        self.shared.stats.borrow_mut().sweeps += 1;
        if let Some(supervisor) = &self.supervisor {
            supervisor.refresh();
        }
    }

    async fn drain(&self) {
        let grace = self.config.shutdown_grace;
        let shared = self.shared.clone();
        let drained = self
            .run_until(time::timeout(grace, async move {
                while shared.stats.borrow().active > 0 {
                    time::sleep(Duration::from_millis(10)).await;
                }
            }))
            .await;
        if drained.is_err() {
            log::warn!(
                "{} task(s) still running after {:?} grace period",
                self.stats().active,
                grace
            );
        }
    }
}
