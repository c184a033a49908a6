//! Liveness supervisor
//!
//! The scheduler's sweep refreshes a watchdog timer that lives outside the run-loop:
//! either a dedicated OS thread or the Linux watchdog device. If the loop wedges and
//! stops refreshing, the timer fires on its own and the process is restarted.

use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{SupervisorSettings, WatchdogBackend};
use crate::error::{NodeError, NodeResult};

/// A deadline that must be pushed forward at least once per timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogTicket {
    timeout: Duration,
    deadline: Instant,
}

impl WatchdogTicket {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            deadline: now + timeout,
        }
    }

    /// Move the deadline to `now + timeout`. Never moves it backwards.
    pub fn refresh(&mut self, now: Instant) {
        self.deadline = self.deadline.max(now + self.timeout);
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A ticket that reports expiry exactly once.
#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    ticket: WatchdogTicket,
    fired: bool,
}

impl Countdown {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            ticket: WatchdogTicket::new(timeout, now),
            fired: false,
        }
    }

    /// Refreshing after expiry has no effect; the expiry already happened.
    pub fn refresh(&mut self, now: Instant) {
        if !self.fired {
            self.ticket.refresh(now);
        }
    }

    /// True on the first poll at or past the deadline, false ever after
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.fired || !self.ticket.expired(now) {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    pub fn deadline(&self) -> Instant {
        self.ticket.deadline()
    }
}

/// Independent timer serviced by the scheduler's sweep
pub trait WatchdogTimer: Send {
    fn arm(&mut self, timeout: Duration) -> NodeResult<()>;

    fn feed(&mut self) -> NodeResult<()>;

    fn disarm(&mut self) -> NodeResult<()>;

    fn name(&self) -> &'static str;
}

/// What the thread backend does when the countdown runs out
#[derive(Clone)]
pub enum ExpiryAction {
    /// Re-exec the current binary
    Restart,
    Abort,
    Custom(Arc<dyn Fn() + Send + Sync>),
}

impl ExpiryAction {
    fn run(&self) {
        match self {
            ExpiryAction::Restart => restart_process(),
            ExpiryAction::Abort => std::process::abort(),
            ExpiryAction::Custom(action) => action(),
        }
    }
}

impl std::fmt::Debug for ExpiryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpiryAction::Restart => f.write_str("Restart"),
            ExpiryAction::Abort => f.write_str("Abort"),
            ExpiryAction::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Default)]
struct ThreadState {
    countdown: Option<Countdown>,
    stop: bool,
    expirations: u64,
}

type SharedState = Arc<(Mutex<ThreadState>, Condvar)>;

/// Software watchdog running on its own OS thread
pub struct ThreadWatchdog {
    state: SharedState,
    thread: Option<JoinHandle<()>>,
}

impl ThreadWatchdog {
    pub fn new(action: ExpiryAction) -> NodeResult<Self> {
        let state: SharedState = Arc::new((Mutex::new(ThreadState::default()), Condvar::new()));
        let worker = state.clone();
        let thread = std::thread::Builder::new()
            .name("smartnode-watchdog".to_string())
            .spawn(move || watch(worker, action))
            .map_err(|e| NodeError::Supervisor(format!("failed to start watchdog thread: {}", e)))?;
        Ok(Self {
            state,
            thread: Some(thread),
        })
    }

    /// Number of times the countdown has expired
    pub fn expirations(&self) -> u64 {
        self.state.0.lock().expirations
    }

    /// Shared counter handle usable after the watchdog moves into a supervisor
    pub fn expiration_counter(&self) -> ExpirationCounter {
        ExpirationCounter {
            state: self.state.clone(),
        }
    }
}

/// Read-only view of a [`ThreadWatchdog`]'s expiry count
#[derive(Clone)]
pub struct ExpirationCounter {
    state: SharedState,
}

impl ExpirationCounter {
    pub fn expirations(&self) -> u64 {
        self.state.0.lock().expirations
    }
}

enum Step {
    Wait,
    WaitUntil(Instant),
    Fire,
}

fn watch(state: SharedState, action: ExpiryAction) {
    let (lock, cvar) = &*state;
    let mut guard = lock.lock();
    loop {
        if guard.stop {
            return;
        }
        let now = Instant::now();
        let step = match guard.countdown.as_mut() {
            Some(countdown) if !countdown.fired() => {
                if countdown.poll(now) {
                    Step::Fire
                } else {
                    Step::WaitUntil(countdown.deadline())
                }
            }
            _ => Step::Wait,
        };
        match step {
            Step::Wait => cvar.wait(&mut guard),
            Step::WaitUntil(deadline) => {
                cvar.wait_until(&mut guard, deadline);
            }
            Step::Fire => {
                guard.expirations += 1;
                log::error!("Watchdog expired; the run-loop stopped refreshing");
                drop(guard);
                action.run();
                guard = lock.lock();
            }
        }
    }
}

impl WatchdogTimer for ThreadWatchdog {
    fn arm(&mut self, timeout: Duration) -> NodeResult<()> {
        let (lock, cvar) = &*self.state;
        lock.lock().countdown = Some(Countdown::new(timeout, Instant::now()));
        cvar.notify_one();
        Ok(())
    }

    fn feed(&mut self) -> NodeResult<()> {
        if let Some(countdown) = self.state.0.lock().countdown.as_mut() {
            countdown.refresh(Instant::now());
        }
        Ok(())
    }

    fn disarm(&mut self) -> NodeResult<()> {
        let (lock, cvar) = &*self.state;
        lock.lock().countdown = None;
        cvar.notify_one();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "thread"
    }
}

impl Drop for ThreadWatchdog {
    fn drop(&mut self) {
        {
            let (lock, cvar) = &*self.state;
            lock.lock().stop = true;
            cvar.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

/// Linux hardware watchdog (`/dev/watchdog`).
///
/// Opening the device starts the hardware countdown with the timeout configured in
/// the driver. Each feed writes one byte; disarming writes the magic `V` before
/// closing so the driver stops the timer.
pub struct DeviceWatchdog {
    path: PathBuf,
    file: Option<File>,
}

impl DeviceWatchdog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }
}

impl WatchdogTimer for DeviceWatchdog {
    fn arm(&mut self, timeout: Duration) -> NodeResult<()> {
        if self.file.is_none() {
            let file = OpenOptions::new().write(true).open(&self.path).map_err(|e| {
                NodeError::Supervisor(format!("cannot open {}: {}", self.path.display(), e))
            })?;
            log::info!(
                "Hardware watchdog {} armed (driver timeout applies, requested {:?})",
                self.path.display(),
                timeout
            );
            self.file = Some(file);
        }
        self.feed()
    }

    fn feed(&mut self) -> NodeResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(b"\0")?;
            file.flush()?;
        }
        Ok(())
    }

    fn disarm(&mut self) -> NodeResult<()> {
        if let Some(mut file) = self.file.take() {
            file.write_all(b"V")?;
            file.flush()?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "device"
    }
}

/// Owns the watchdog timer and decides what a fatal run-loop failure does.
pub struct Supervisor {
    timer: RefCell<Box<dyn WatchdogTimer>>,
    timeout: Duration,
    restart_on_fault: bool,
    armed: Cell<bool>,
    refreshes: Cell<u64>,
}

impl Supervisor {
    pub fn new(timer: Box<dyn WatchdogTimer>, timeout: Duration, restart_on_fault: bool) -> Self {
        Self {
            timer: RefCell::new(timer),
            timeout,
            restart_on_fault,
            armed: Cell::new(false),
            refreshes: Cell::new(0),
        }
    }

    /// Build the configured backend. Returns `None` when supervision is disabled.
    pub fn from_settings(settings: &SupervisorSettings) -> NodeResult<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        let timer: Box<dyn WatchdogTimer> = match settings.backend {
            WatchdogBackend::Thread => Box::new(ThreadWatchdog::new(ExpiryAction::Restart)?),
            WatchdogBackend::Device => Box::new(DeviceWatchdog::new(&settings.device_path)),
        };
        Ok(Some(Self::new(
            timer,
            Duration::from_secs(settings.timeout_secs),
            settings.restart_on_fault,
        )))
    }

    pub fn arm(&self) -> NodeResult<()> {
        let mut timer = self.timer.borrow_mut();
        timer.arm(self.timeout)?;
        self.armed.set(true);
        log::info!(
            "Liveness supervisor armed ({} backend, timeout {:?})",
            timer.name(),
            self.timeout
        );
        Ok(())
    }

    /// Service point called once per sweep
    pub fn refresh(&self) {
        if !self.armed.get() {
            return;
        }
        if let Err(e) = self.timer.borrow_mut().feed() {
            log::warn!("Failed to feed watchdog: {}", e);
        }
        self.refreshes.set(self.refreshes.get() + 1);
    }

    pub fn disarm(&self) {
        if !self.armed.replace(false) {
            return;
        }
        if let Err(e) = self.timer.borrow_mut().disarm() {
            log::warn!("Failed to disarm watchdog: {}", e);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.get()
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.get()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn restart_on_fault(&self) -> bool {
        self.restart_on_fault
    }

    /// The run-loop itself failed. Restart, or halt with the watchdog disarmed so the
    /// device can be inspected.
    pub fn handle_fatal(&self, reason: &str) -> ! {
        if self.restart_on_fault {
            log::error!("Fatal run-loop failure, restarting: {}", reason);
            restart_process()
        }
        log::error!("Fatal run-loop failure, halting for inspection: {}", reason);
        self.disarm();
        loop {
            std::thread::park();
        }
    }
}

/// Replace the current process with a fresh copy of itself.
pub fn restart_process() -> ! {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            log::error!("Cannot locate current executable: {}", e);
            std::process::abort();
        }
    };
    let args: Vec<String> = std::env::args().skip(1).collect();
    replace_process(&exe, &args)
}

#[cfg(unix)]
fn replace_process(exe: &Path, args: &[String]) -> ! {
    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(exe).args(args).exec();
    log::error!("Re-exec of {} failed: {}", exe.display(), err);
    std::process::abort()
}

#[cfg(not(unix))]
fn replace_process(exe: &Path, args: &[String]) -> ! {
    if let Err(e) = std::process::Command::new(exe).args(args).spawn() {
        log::error!("Restart of {} failed: {}", exe.display(), e);
        std::process::abort();
    }
    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_countdown_fires_once_after_refreshes_stop() {
        let unit = Duration::from_secs(1);
        let start = Instant::now();
        let mut countdown = Countdown::new(unit * 10, start);

        for t in 1..=100u32 {
            let now = start + unit * t;
            assert!(!countdown.poll(now), "fired at {}", t);
            if t % 5 == 0 {
                countdown.refresh(now);
            }
        }

        let mut fired_at = Vec::new();
        for t in 101..=150u32 {
            if countdown.poll(start + unit * t) {
                fired_at.push(t);
            }
        }
        assert_eq!(fired_at, vec![110]);
    }

    #[test]
    fn test_ticket_never_moves_backwards() {
        let start = Instant::now();
        let mut ticket = WatchdogTicket::new(Duration::from_secs(10), start + Duration::from_secs(5));
        let before = ticket.deadline();
        ticket.refresh(start);
        assert_eq!(ticket.deadline(), before);
        assert!(!ticket.expired(start + Duration::from_secs(14)));
        assert!(ticket.expired(start + Duration::from_secs(15)));
    }

    #[test]
    fn test_refresh_after_fire_is_ignored() {
        let start = Instant::now();
        let mut countdown = Countdown::new(Duration::from_secs(1), start);
        assert!(countdown.poll(start + Duration::from_secs(2)));
        countdown.refresh(start + Duration::from_secs(2));
        assert!(!countdown.poll(start + Duration::from_secs(10)));
        assert!(countdown.fired());
    }

    #[test]
    fn test_thread_watchdog_fed_then_starved() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut watchdog = ThreadWatchdog::new(ExpiryAction::Custom(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        watchdog.arm(Duration::from_millis(200)).unwrap();
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(40));
            watchdog.feed().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.expirations(), 1);

        // fires at most once per arm
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarmed_watchdog_stays_quiet() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut watchdog = ThreadWatchdog::new(ExpiryAction::Custom(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        watchdog.arm(Duration::from_millis(50)).unwrap();
        watchdog.disarm().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    struct RecordingTimer {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl WatchdogTimer for RecordingTimer {
        fn arm(&mut self, _timeout: Duration) -> NodeResult<()> {
            self.calls.lock().push("arm");
            Ok(())
        }

        fn feed(&mut self) -> NodeResult<()> {
            self.calls.lock().push("feed");
            Ok(())
        }

        fn disarm(&mut self) -> NodeResult<()> {
            self.calls.lock().push("disarm");
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[test]
    fn test_supervisor_only_feeds_while_armed() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let supervisor = Supervisor::new(
            Box::new(RecordingTimer {
                calls: calls.clone(),
            }),
            Duration::from_secs(30),
            true,
        );

        supervisor.refresh();
        supervisor.arm().unwrap();
        supervisor.refresh();
        supervisor.refresh();
        supervisor.disarm();
        supervisor.disarm();
        supervisor.refresh();

        assert_eq!(*calls.lock(), vec!["arm", "feed", "feed", "disarm"]);
        assert_eq!(supervisor.refreshes(), 2);
        assert!(!supervisor.is_armed());
    }

    #[test]
    fn test_device_watchdog_writes_feed_and_magic_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog");
        std::fs::write(&path, b"").unwrap();

        let mut device = DeviceWatchdog::new(&path);
        device.arm(Duration::from_secs(15)).unwrap();
        device.feed().unwrap();
        device.disarm().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"\0\0V");
    }
}
