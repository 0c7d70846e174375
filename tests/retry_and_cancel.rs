//! Retry, timeout, cancellation and shutdown integration tests

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use common::{Gate, WAIT, noop, occupy_worker, wait_until};
use taskqueue::{
    ErrorKind, EventType, Priority, QueueError, RetryPolicy, Scheduler, TaskConfig, TaskFailure, TaskSpec, TaskStatus,
};

fn with_retries(spec: TaskSpec, max_retries: u32) -> TaskSpec {
    spec.config(
        TaskConfig::builder("flaky").retry(RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))),
    )
}

#[test]
fn test_retry_then_succeed() {
    let scheduler = Scheduler::new(2).unwrap();
    let retries = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&retries);
    scheduler.subscribe(EventType::Retrying, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let spec = TaskSpec::new("flaky", move |ctx| {
        let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(ctx.attempt(), n);
        if n < 3 {
            return Err(TaskFailure::new(format!("transient {}", n)));
        }
        Ok(())
    });
    let id = scheduler.submit(with_retries(spec, 3)).unwrap();

    let result = scheduler.wait_for(&id, WAIT).unwrap();
    assert_eq!(result.status(), TaskStatus::Completed);
    assert!(result.error().is_none());
    assert_eq!(result.attempt(), 3);

    let task = scheduler.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.progress, 1.0);
    assert!(wait_until(WAIT, || retries.load(Ordering::SeqCst) == 2));
}

#[test]
fn test_always_failing_task_exhausts_retries() {
    let scheduler = Scheduler::new(1).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let spec = TaskSpec::new("doomed", move |_ctx| {
        let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
        Err(TaskFailure::new(format!("boom {}", n)))
    });
    let id = scheduler.submit(with_retries(spec, 2)).unwrap();

    match scheduler.wait_for(&id, WAIT) {
        Err(QueueError::Execution { kind, message }) => {
            assert_eq!(kind, ErrorKind::Execution);
            assert_eq!(message, "boom 3");
        }
        other => panic!("expected execution error, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let task = scheduler.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    let result = scheduler.get_result(&id).unwrap().unwrap();
    assert_eq!(result.error().unwrap().message, "boom 3");
}

#[test]
fn test_permanent_failure_skips_retries() {
    let scheduler = Scheduler::new(1).unwrap();
    let spec = TaskSpec::new("bad input", |_ctx| Err(TaskFailure::permanent("unsupported format")));
    let id = scheduler.submit(with_retries(spec, 5)).unwrap();

    assert!(matches!(scheduler.wait_for(&id, WAIT), Err(QueueError::Execution { .. })));
    assert_eq!(scheduler.get_task(&id).unwrap().attempts, 1);
}

#[test]
fn test_panicking_body_is_a_failed_attempt() {
    let scheduler = Scheduler::new(1).unwrap();
    let spec = TaskSpec::new("panics", |_ctx| panic!("index out of range"));
    let id = scheduler.submit(with_retries(spec, 1)).unwrap();

    match scheduler.wait_for(&id, WAIT) {
        Err(QueueError::Execution { kind, message }) => {
            assert_eq!(kind, ErrorKind::Panic);
            assert!(message.contains("index out of range"));
        }
        other => panic!("expected panic failure, got {:?}", other),
    }
    assert_eq!(scheduler.get_task(&id).unwrap().attempts, 2);

    // The worker survived and keeps serving
    let next = scheduler.submit(noop("after", Priority::Normal)).unwrap();
    assert!(scheduler.wait_for(&next, WAIT).is_ok());
}

#[test]
fn test_timeout_surfaces_timeout_kind() {
    let scheduler = Scheduler::new(1).unwrap();
    let spec = TaskSpec::new("slow", |ctx| {
        ctx.sleep(Duration::from_secs(10))?;
        Ok(())
    })
    .config(
        TaskConfig::builder("slow")
            .timeout(Duration::from_millis(30))
            .retry(RetryPolicy::none()),
    );
    let id = scheduler.submit(spec).unwrap();

    assert!(matches!(scheduler.wait_for(&id, WAIT), Err(QueueError::Timeout(_))));
    let result = scheduler.get_result(&id).unwrap().unwrap();
    assert_eq!(result.error().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(scheduler.get_status(&id).unwrap(), TaskStatus::Failed);
}

#[test]
fn test_timeout_is_retried() {
    let scheduler = Scheduler::new(1).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let spec = TaskSpec::new("slow once", move |ctx| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            ctx.sleep(Duration::from_secs(10))?;
        }
        Ok(())
    })
    .config(
        TaskConfig::builder("slow")
            .timeout(Duration::from_millis(30))
            .retry(RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1))),
    );
    let id = scheduler.submit(spec).unwrap();

    assert!(scheduler.wait_for(&id, WAIT).is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cancel_running_task() {
    let scheduler = Scheduler::new(1).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);
    let spec = TaskSpec::new("long", move |ctx| {
        started_tx.lock().unwrap().send(()).unwrap();
        while !ctx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(TaskFailure::cancelled())
    });
    let id = scheduler.submit(with_retries(spec, 3)).unwrap();

    started_rx.recv_timeout(WAIT).unwrap();
    assert!(scheduler.cancel(&id));
    assert!(matches!(scheduler.wait_for(&id, WAIT), Err(QueueError::Cancelled(_))));
    assert_eq!(scheduler.get_status(&id).unwrap(), TaskStatus::Cancelled);
    assert_eq!(scheduler.get_task(&id).unwrap().attempts, 1);
    assert!(!scheduler.cancel(&id));
}

#[test]
fn test_success_after_cancel_request_still_completes() {
    let scheduler = Scheduler::new(1).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);
    let release = Gate::new();
    let held = Arc::clone(&release);
    let id = scheduler
        .submit(TaskSpec::new("stubborn", move |_ctx| {
            started_tx.lock().unwrap().send(()).unwrap();
            held.wait();
            Ok(())
        }))
        .unwrap();

    started_rx.recv_timeout(WAIT).unwrap();
    assert!(scheduler.cancel(&id));
    release.open();
    assert!(scheduler.wait_for(&id, WAIT).is_ok());
    assert_eq!(scheduler.get_status(&id).unwrap(), TaskStatus::Completed);
}

#[test]
fn test_cancel_during_backoff_aborts_retries() {
    let scheduler = Scheduler::new(1).unwrap();
    let (retry_tx, retry_rx) = mpsc::channel();
    let retry_tx = Mutex::new(retry_tx);
    scheduler.subscribe(EventType::Retrying, move |event| {
        retry_tx.lock().unwrap().send(event.attempt).unwrap();
        Ok(())
    });

    let spec = TaskSpec::new("failing", |_ctx| Err(TaskFailure::new("nope"))).config(
        TaskConfig::builder("patient").retry(RetryPolicy::new(3, Duration::from_secs(30), Duration::from_secs(30))),
    );
    let id = scheduler.submit(spec).unwrap();

    assert_eq!(retry_rx.recv_timeout(WAIT).unwrap(), Some(1));
    assert!(scheduler.cancel(&id));
    assert!(matches!(scheduler.wait_for(&id, WAIT), Err(QueueError::Cancelled(_))));
    assert_eq!(scheduler.get_task(&id).unwrap().attempts, 1);
}

#[test]
fn test_add_metric_after_completion_is_state_error() {
    let scheduler = Scheduler::new(1).unwrap();
    let id = scheduler
        .submit(TaskSpec::new("measured", |ctx| {
            ctx.add_metric("rows", 42.0)?;
            ctx.record_timeline_event("loaded")?;
            ctx.report_progress(0.5);
            Ok(())
        }))
        .unwrap();

    let mut result = scheduler.wait_for(&id, WAIT).unwrap();
    assert_eq!(result.metric("rows"), Some(42.0));
    assert_eq!(result.timeline().len(), 1);
    assert!(result.is_finalized());
    assert!(matches!(result.add_metric("late", 1.0), Err(QueueError::InvalidState(_))));
}

#[test]
fn test_invalid_metric_fails_the_attempt_permanently() {
    let scheduler = Scheduler::new(1).unwrap();
    let spec = TaskSpec::new("bad metric", |ctx| {
        ctx.add_metric("rows", -3.0)?;
        Ok(())
    });
    let id = scheduler.submit(with_retries(spec, 3)).unwrap();

    match scheduler.wait_for(&id, WAIT) {
        Err(QueueError::Execution { kind, .. }) => assert_eq!(kind, ErrorKind::Validation),
        other => panic!("expected validation failure, got {:?}", other),
    }
    assert_eq!(scheduler.get_task(&id).unwrap().attempts, 1);
}

#[test]
fn test_body_reads_configuration() {
    use taskqueue::ParamDefinition;
    use taskqueue::ParamType;

    let scheduler = Scheduler::new(1).unwrap();
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let spec = TaskSpec::new("resize", move |ctx| {
        let width = ctx.config().get_i64("width");
        let mode = ctx.config().get_str("mode").map(str::to_string);
        *sink.lock().unwrap() = Some((width, mode));
        Ok(())
    })
    .config(
        TaskConfig::builder("resize")
            .param(ParamDefinition::new("width", ParamType::Integer).min(1.0))
            .param(ParamDefinition::new("mode", ParamType::String).default_value("fit"))
            .value("width", 640),
    );
    let id = scheduler.submit(spec).unwrap();
    scheduler.wait_for(&id, WAIT).unwrap();

    assert_eq!(*seen.lock().unwrap(), Some((Some(640), Some("fit".to_string()))));
    assert_eq!(scheduler.get_task(&id).unwrap().config_name.as_deref(), Some("resize"));
}

#[test]
fn test_submit_after_shutdown_fails() {
    let scheduler = Scheduler::new(1).unwrap();
    scheduler.shutdown(true);
    assert!(!scheduler.is_accepting());
    assert!(matches!(
        scheduler.submit(noop("late", Priority::Normal)),
        Err(QueueError::ShuttingDown)
    ));
}

#[test]
fn test_shutdown_cancels_queued_and_drains_running() {
    let scheduler = Scheduler::builder().max_workers(1).build().unwrap();
    let (running, gate) = occupy_worker(&scheduler);
    let queued = scheduler.submit(noop("queued", Priority::High)).unwrap();

    let opener = Arc::clone(&gate);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        opener.open();
    });
    scheduler.shutdown(true);
    handle.join().unwrap();

    assert_eq!(scheduler.get_status(&queued).unwrap(), TaskStatus::Cancelled);
    assert_eq!(scheduler.get_status(&running).unwrap(), TaskStatus::Completed);
    assert_eq!(scheduler.queue_stats().queued, 0);
}

#[test]
fn test_shutdown_without_drain_cancels_in_flight() {
    let scheduler = Scheduler::new(1).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);
    let id = scheduler
        .submit(TaskSpec::new("cooperative", move |ctx| {
            started_tx.lock().unwrap().send(()).unwrap();
            ctx.sleep(Duration::from_secs(30))?;
            Ok(())
        }))
        .unwrap();

    started_rx.recv_timeout(WAIT).unwrap();
    scheduler.shutdown(false);
    assert!(matches!(scheduler.wait_for(&id, WAIT), Err(QueueError::Cancelled(_))));
}

#[test]
fn test_unbounded_wait_for_finished_task() {
    let scheduler = Scheduler::new(1).unwrap();
    let id = scheduler.submit(noop("quick", Priority::Normal)).unwrap();
    scheduler.wait_for(&id, WAIT).unwrap();

    let result = scheduler.wait_for(&id, Duration::MAX).unwrap();
    assert_eq!(result.status(), TaskStatus::Completed);
}

#[test]
fn test_unbounded_sleep_ends_on_cancel() {
    let scheduler = Scheduler::new(1).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);
    let spec = TaskSpec::new("indefinite", move |ctx| {
        started_tx.lock().unwrap().send(()).unwrap();
        ctx.sleep(Duration::MAX)?;
        Ok(())
    })
    .config(
        TaskConfig::builder("indefinite")
            .timeout(Duration::MAX)
            .retry(RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))),
    );
    let id = scheduler.submit(spec).unwrap();

    started_rx.recv_timeout(WAIT).unwrap();
    assert!(scheduler.cancel(&id));
    assert!(matches!(scheduler.wait_for(&id, Duration::MAX), Err(QueueError::Cancelled(_))));
    assert_eq!(scheduler.get_status(&id).unwrap(), TaskStatus::Cancelled);
    assert_eq!(scheduler.get_task(&id).unwrap().attempts, 1);
}
