// Liveness supervision of the run-loop, on real time
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use smartnode_core::scheduling::{
    ExpiryAction, Scheduler, SchedulerConfig, Supervisor, ThreadWatchdog,
};

fn counting_watchdog() -> (ThreadWatchdog, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let watchdog = ThreadWatchdog::new(ExpiryAction::Custom(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();
    (watchdog, fired)
}

fn supervised_scheduler(watchdog: ThreadWatchdog) -> Scheduler {
    let supervisor = Supervisor::new(Box::new(watchdog), Duration::from_millis(300), true);
    Scheduler::new(SchedulerConfig::standard().with_sweep_period(Duration::from_millis(50)))
        .with_supervisor(Rc::new(supervisor))
}

#[tokio::test]
async fn test_healthy_loop_keeps_watchdog_fed() {
    let (watchdog, fired) = counting_watchdog();
    let scheduler = supervised_scheduler(watchdog);
    scheduler.spawn("busy", async {
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        Ok(())
    });

    scheduler.run_for(Duration::from_millis(1200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    let supervisor = scheduler.supervisor().unwrap();
    assert!(supervisor.is_armed());
    assert!(supervisor.refreshes() >= 10);
}

#[tokio::test]
async fn test_wedged_loop_trips_watchdog_once() {
    let (watchdog, fired) = counting_watchdog();
    let counter = watchdog.expiration_counter();
    let scheduler = supervised_scheduler(watchdog);
    scheduler.spawn("wedged", async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        // never yields for longer than the watchdog window
        std::thread::sleep(Duration::from_millis(1000));
        Ok(())
    });

    scheduler.run_for(Duration::from_millis(1500)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(counter.expirations(), 1);
}

#[tokio::test]
async fn test_shutdown_disarms() {
    let (watchdog, fired) = counting_watchdog();
    let scheduler = supervised_scheduler(watchdog);
    let trigger = scheduler.shutdown_trigger();
    scheduler.spawn("stopper", async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.trigger();
        Ok(())
    });

    scheduler.run().await;
    assert!(!scheduler.supervisor().unwrap().is_armed());

    // nothing refreshes any more, and nothing fires either
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
