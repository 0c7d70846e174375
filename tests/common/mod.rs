//! Helpers shared by the integration tests
#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use taskqueue::{Priority, Scheduler, TaskId, TaskSpec, TaskStatus};

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// One-shot latch a task body can block on
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

/// Occupy a worker with a task that runs until the gate opens.
///
/// Returns once the blocker is RUNNING, so later submissions stay queued.
pub fn occupy_worker(scheduler: &Scheduler) -> (TaskId, Arc<Gate>) {
    let gate = Gate::new();
    let held = Arc::clone(&gate);
    let id = scheduler
        .submit(
            TaskSpec::new("blocker", move |_ctx| {
                held.wait();
                Ok(())
            })
            .priority(Priority::Critical),
        )
        .unwrap();
    assert!(wait_until(WAIT, || scheduler.get_status(&id).unwrap() == TaskStatus::Running));
    (id, gate)
}

/// A task that succeeds immediately
pub fn noop(title: &str, priority: Priority) -> TaskSpec {
    TaskSpec::new(title, |_ctx| Ok(())).priority(priority)
}
