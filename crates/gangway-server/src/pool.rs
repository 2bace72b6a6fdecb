//! WorkerPool: bounded concurrent executor for connection tasks.
//!
//! The pool is the single admission-control point of a server: every
//! accepted connection passes through [`WorkerPool::add`], which either
//! spawns the task holding one of `capacity` permits or rejects it
//! synchronously. No other component performs its own concurrency limiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use gangway_core::{Error, Result};

use crate::task::{Task, TaskContext};

/// Bounded concurrent executor.
pub struct WorkerPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Create a pool that runs at most `capacity` tasks concurrently.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            tasks: Mutex::new(JoinSet::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Submit a task.
    ///
    /// Admission is synchronous: a stopped pool fails with
    /// [`Error::PoolClosed`], a saturated pool with [`Error::PoolSaturated`].
    /// An admitted task runs holding its permit until completion.
    pub async fn add(&self, cx: TaskContext, task: Task) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| Error::PoolSaturated)?;

        let mut tasks = self.tasks.lock().await;
        // Reap tasks that already finished so the set does not grow without
        // bound on long-lived servers.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "worker task panicked");
            }
        }
        tasks.spawn(async move {
            let _permit = permit;
            task.run(cx).await;
        });
        Ok(())
    }

    /// Request drain and block until every outstanding task has finished.
    /// Duplicate calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("worker pool already stopped");
            return;
        }

        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task panicked");
            }
        }
        debug!("worker pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Notify;

    use crate::task::{Handler, TaskArgs, TaskTemplate};

    async fn bound_task(template: &TaskTemplate) -> (Task, TaskContext) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (template.bind(server, peer), TaskContext::new(0, peer))
    }

    /// Handler that parks until released, so tests can hold pool capacity.
    struct ParkUntil(Arc<Notify>);

    #[async_trait]
    impl Handler for ParkUntil {
        async fn handle(
            &self,
            _cx: &TaskContext,
            _conn: &mut TcpStream,
            _args: &TaskArgs,
        ) -> Result<()> {
            self.0.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_rejects_when_saturated() {
        let release = Arc::new(Notify::new());
        let template = TaskTemplate::new(Arc::new(ParkUntil(Arc::clone(&release))));
        let pool = WorkerPool::new(1);

        let (first, cx1) = bound_task(&template).await;
        pool.add(cx1, first).await.unwrap();

        // Give the spawned task a moment to take its permit.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.available(), 0);

        let (second, cx2) = bound_task(&template).await;
        let err = pool.add(cx2, second).await.unwrap_err();
        assert!(matches!(err, Error::PoolSaturated));

        release.notify_waiters();
        pool.stop().await;
    }

    #[tokio::test]
    async fn pool_runs_up_to_capacity_concurrently() {
        let release = Arc::new(Notify::new());
        let template = TaskTemplate::new(Arc::new(ParkUntil(Arc::clone(&release))));
        let pool = WorkerPool::new(3);

        for _ in 0..3 {
            let (task, cx) = bound_task(&template).await;
            pool.add(cx, task).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.available(), 0);

        release.notify_waiters();
        pool.stop().await;
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn stopped_pool_refuses_new_tasks() {
        let template = TaskTemplate::new(Arc::new(ParkUntil(Arc::new(Notify::new()))));
        let pool = WorkerPool::new(1);
        pool.stop().await;

        let (task, cx) = bound_task(&template).await;
        assert!(matches!(pool.add(cx, task).await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn duplicate_stop_is_a_no_op() {
        let pool = WorkerPool::new(1);
        pool.stop().await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn permits_free_up_as_tasks_finish() {
        let release = Arc::new(Notify::new());
        let template = TaskTemplate::new(Arc::new(ParkUntil(Arc::clone(&release))));
        let pool = WorkerPool::new(1);

        let (task, cx) = bound_task(&template).await;
        pool.add(cx, task).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Capacity is available again without stopping the pool.
        assert_eq!(pool.available(), 1);
        let (task, cx) = bound_task(&template).await;
        pool.add(cx, task).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        release.notify_waiters();
        pool.stop().await;
    }
}
