// Bounded worker pool for inbound handler dispatch.
//
// Admission is synchronous from the caller's point of view: the reader task
// calls `schedule` and must not outrun the configured memory allowance, yet
// must never block on handler execution itself. The pool's queue, not the
// reader, is the buffer between the two.
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminate {
    /// Let queued tasks run and wait for everything in flight.
    Graceful,
    /// Cancel queued tasks and request cancellation of running ones.
    Immediate,
}

pub(crate) struct WorkerPool {
    budget: Arc<Budget>,
    workers: Arc<Semaphore>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

struct Budget {
    limit: usize,
    used: Mutex<usize>,
    freed: Notify,
}

impl Budget {
    fn release(&self, cost: usize) {
        let mut used = self.used.lock().expect("budget lock");
        *used = used.saturating_sub(cost);
        drop(used);
        self.freed.notify_waiters();
    }
}

// Refunds a task's cost on every exit path, including handler panics and
// aborted tasks.
struct BudgetGuard {
    budget: Arc<Budget>,
    cost: usize,
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        self.budget.release(self.cost);
    }
}

impl WorkerPool {
    pub(crate) fn new(workers: usize, memory: usize) -> Self {
        Self {
            budget: Arc::new(Budget {
                limit: memory,
                used: Mutex::new(0),
                freed: Notify::new(),
            }),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Admits a task costing `cost` bytes. Returns false if the cost can
    /// never fit the pool's allowance (the caller drops the task); otherwise
    /// blocks until the memory is available and schedules the task. A task
    /// that has not started running within `timeout_ms` (0 = no limit) is
    /// silently discarded and its memory refunded.
    pub(crate) async fn schedule<F>(&self, cost: usize, timeout_ms: u64, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if cost > self.budget.limit {
            return false;
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            let freed = self.budget.freed.notified();
            {
                let mut used = self.budget.used.lock().expect("budget lock");
                if *used + cost <= self.budget.limit {
                    *used += cost;
                    break;
                }
            }
            freed.await;
        }

        let guard = BudgetGuard {
            budget: Arc::clone(&self.budget),
            cost,
        };
        let workers = Arc::clone(&self.workers);
        self.tasks.lock().await.spawn(async move {
            let _refund = guard;
            let permit = if timeout_ms == 0 {
                workers.acquire_owned().await.ok()
            } else {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    workers.acquire_owned(),
                )
                .await
                {
                    Ok(permit) => permit.ok(),
                    Err(_) => None,
                }
            };
            if permit.is_some() {
                task.await;
            }
        });
        true
    }

    pub(crate) async fn terminate(&self, mode: Terminate) {
        self.closed.store(true, Ordering::Release);
        self.budget.freed.notify_waiters();

        let mut tasks = self.tasks.lock().await;
        if mode == Terminate::Immediate {
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}
    }
}
