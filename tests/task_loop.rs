use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use servicevisor::{LoopError, LoopState, TaskError, TaskLoop};

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn run_executes_until_stopped() {
    let tl = TaskLoop::new("sync");
    let log = Arc::new(Mutex::new(Vec::new()));
    for id in 0..3 {
        let log = Arc::clone(&log);
        tl.push(move || log.lock().unwrap().push(id));
    }
    let stopper = tl.clone();
    tl.push(move || stopper.stop());

    assert_eq!(tl.run(), Ok(()));
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(tl.state(), LoopState::Idle);
}

#[tokio::test]
async fn run_async_resolves_after_stop() {
    let tl = TaskLoop::new("async");
    let done = tl.run_async().unwrap();
    assert_eq!(tl.state(), LoopState::RunningAsync);

    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    tl.push(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));

    tl.stop();
    assert_eq!(done.await, Ok(()));
    assert_eq!(tl.state(), LoopState::Idle);
}

#[test]
fn rerun_while_running_is_rejected() {
    let tl = TaskLoop::new("busy");
    let _done = tl.run_async().unwrap();

    assert_eq!(tl.run(), Err(LoopError::AlreadyRunning));
    assert!(matches!(tl.run_async(), Err(LoopError::AlreadyRunning)));
    assert_eq!(tl.state(), LoopState::RunningAsync);

    tl.stop();
    tl.stop();
    assert_eq!(tl.state(), LoopState::Idle);
}

#[test]
fn stop_wakes_a_blocked_loop() {
    let tl = TaskLoop::new("blocked");
    tl.push_single_shot(Duration::from_secs(30), || ());
    let _done = tl.run_async().unwrap();
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    tl.stop();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!tl.is_running());
    assert_eq!(tl.queue().len(), 1);
}

#[test]
fn runtime_error_without_handler_ends_loop() {
    let tl = TaskLoop::new("unhandled");
    tl.push(|| Err::<(), _>(TaskError::runtime("disk full")));
    tl.push(|| -> () { unreachable!("loop must end before") });

    assert_eq!(
        tl.run(),
        Err(LoopError::Runtime {
            error: "disk full".into()
        })
    );
    assert_eq!(tl.queue().len(), 1);
}

#[test]
fn runtime_error_with_handler_keeps_running() {
    let tl = TaskLoop::new("handled");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    tl.set_runtime_error_handler(move |e| s.lock().unwrap().push(e.clone()));

    tl.push(|| Err::<(), _>(TaskError::runtime("first")));
    tl.push(|| -> () { panic!("second") });
    let stopper = tl.clone();
    tl.push(move || stopper.stop());

    assert_eq!(tl.run(), Ok(()));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], TaskError::runtime("first"));
    assert!(matches!(&seen[1], TaskError::Runtime { error } if error.contains("second")));
}

#[test]
fn repeated_task_runs_periodically() {
    let tl = TaskLoop::new("repeat");
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    let task = tl.push_repeated(Duration::from_millis(10), move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    let _done = tl.run_async().unwrap();

    assert!(wait_for(|| hits.load(Ordering::SeqCst) >= 5));
    task.set_enabled(false);
    thread::sleep(Duration::from_millis(30));
    let frozen = hits.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), frozen);
    tl.stop();
}

#[test]
fn method_task_follows_receiver_lifetime() {
    struct Ticker(AtomicUsize);

    let tl = TaskLoop::new("method");
    let ticker = Arc::new(Ticker(AtomicUsize::new(0)));
    tl.push_repeated_method(Duration::from_millis(5), &ticker, |t: &Ticker| {
        t.0.fetch_add(1, Ordering::SeqCst);
    });
    let _done = tl.run_async().unwrap();

    assert!(wait_for(|| ticker.0.load(Ordering::SeqCst) >= 3));
    drop(ticker);
    thread::sleep(Duration::from_millis(20));
    tl.stop();
    assert_eq!(tl.state(), LoopState::Idle);
}
