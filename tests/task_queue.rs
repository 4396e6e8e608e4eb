use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use servicevisor::{MethodTask, TaskFn, TaskQueue, TaskRef};

fn recorder(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> TaskRef {
    let log = Arc::clone(log);
    TaskFn::task_ref(move || log.lock().unwrap().push(id))
}

fn drain(queue: &TaskQueue) {
    while let Some(task) = queue.pull_task() {
        task.execute().unwrap();
    }
}

#[test]
fn push_task_is_fifo() {
    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    for id in 0..20 {
        queue.push_task(recorder(&log, id));
    }
    drain(&queue);
    assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    assert!(!queue.is_remaining_tasks());
}

#[test]
fn immediate_task_goes_first() {
    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    queue.push_task(recorder(&log, 1));
    queue.push_task(recorder(&log, 2));
    queue.push_immediate_task(recorder(&log, 0));
    queue.push_immediate_task(recorder(&log, 100));
    drain(&queue);
    assert_eq!(*log.lock().unwrap(), vec![100, 0, 1, 2]);
}

#[test]
fn single_shot_is_due_after_its_delay() {
    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();
    queue.push_single_shot_task(Duration::from_millis(100), recorder(&log, 100));
    queue.push_single_shot_task(Duration::from_millis(50), recorder(&log, 50));

    assert!(queue.pull_task().is_none());
    let first = queue.wait_for_task(None).expect("task due");
    let elapsed = start.elapsed();
    first.execute().unwrap();

    assert!(elapsed >= Duration::from_millis(50), "popped too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(100), "popped too late: {elapsed:?}");
    assert_eq!(*log.lock().unwrap(), vec![50]);
    assert!(queue.is_remaining_tasks());
}

#[test]
fn wait_times_out_without_due_task() {
    let queue = TaskQueue::new();
    queue.push_single_shot_task(Duration::from_secs(10), TaskFn::task_ref(|| ()));
    let start = Instant::now();
    assert!(queue.wait_for_task(Some(Duration::from_millis(30))).is_none());
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(queue.last_timestamp().is_none());
}

#[test]
fn earlier_push_wakes_waiter() {
    let queue = Arc::new(TaskQueue::new());
    queue.push_single_shot_task(Duration::from_secs(10), TaskFn::task_ref(|| ()));

    let waiter = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let start = Instant::now();
            let task = queue.wait_for_task(Some(Duration::from_secs(5)));
            (task.is_some(), start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(30));
    queue.push_task(TaskFn::task_ref(|| ()));

    let (got, elapsed) = waiter.join().unwrap();
    assert!(got);
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn repeated_task_reschedules_until_disabled() {
    let queue = TaskQueue::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    let period = Duration::from_millis(10);
    let task = queue.push_repeated_task(
        period,
        TaskFn::task_ref(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let mut previous = None;
    for _ in 0..3 {
        let popped = queue.wait_for_task(Some(Duration::from_secs(1))).expect("repeat due");
        popped.execute().unwrap();
        let stamp = queue.last_timestamp().expect("watermark");
        if let Some(previous) = previous {
            assert_eq!(stamp - previous, period);
        }
        previous = Some(stamp);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    task.set_enabled(false);
    assert!(queue.wait_for_task(Some(Duration::from_millis(50))).is_none());
    assert!(queue.is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn method_task_with_dropped_receiver_does_nothing() {
    struct Counter(AtomicUsize);

    let queue = TaskQueue::new();
    let counter = Arc::new(Counter(AtomicUsize::new(0)));
    queue.push_task(MethodTask::task_ref(&counter, |c: &Counter| {
        c.0.fetch_add(1, Ordering::SeqCst);
    }));
    let observer = Arc::downgrade(&counter);
    drop(counter);

    let task = queue.pull_task().expect("task queued");
    assert_eq!(task.execute(), Ok(()));
    assert!(observer.upgrade().is_none());
}

#[test]
fn clear_drops_everything() {
    let queue = TaskQueue::new();
    queue.push_task(TaskFn::task_ref(|| ()));
    queue.push_repeated_task(Duration::from_millis(5), TaskFn::task_ref(|| ()));
    assert_eq!(queue.len(), 2);
    queue.clear_tasks();
    assert!(!queue.is_remaining_tasks());
}

#[test]
fn wait_until_deadline_returns_due_task() {
    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    queue.push_single_shot_task(Duration::from_millis(20), recorder(&log, 20));

    let early = Instant::now() + Duration::from_millis(5);
    assert!(queue.wait_until_task(early).is_none());

    let late = Instant::now() + Duration::from_secs(1);
    let task = queue.wait_until_task(late).expect("task due before deadline");
    task.execute().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![20]);
}
