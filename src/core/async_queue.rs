use std::future::Future;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{internal_error, terminated, ReplicaResult};
use crate::platform::runtime;

type Job = BoxFuture<'static, ()>;

/// Runs jobs one at a time in submission order.
///
/// Every state change of the engine happens on this queue, including stream
/// callbacks and timers, so no two of them ever interleave. A job must never
/// enqueue another job and wait for it.
#[derive(Clone)]
pub struct AsyncQueue {
    sender: async_channel::Sender<Job>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<Job>();
        runtime::spawn_detached(async move {
            while let Ok(job) = receiver.recv().await {
                job.await;
            }
            log::debug!("async queue drained");
        });
        Self { sender }
    }

    /// Runs `job` after every previously enqueued job and returns its result.
    pub async fn enqueue<T, F>(&self, job: F) -> ReplicaResult<T>
    where
        T: Send + 'static,
        F: Future<Output = ReplicaResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped = async move {
            let _ = tx.send(job.await);
        }
        .boxed();
        self.sender
            .send(wrapped)
            .await
            .map_err(|_| terminated("The engine has been terminated"))?;
        rx.await
            .map_err(|_| internal_error("Queued job was dropped before completing"))?
    }

    /// Enqueues `job` without waiting for it. Jobs submitted after shutdown
    /// are dropped.
    pub fn enqueue_and_forget<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.sender.try_send(job.boxed()).is_err() {
            log::debug!("dropping job enqueued after shutdown");
        }
    }

    /// Enqueues `job` once `delay` has passed.
    pub fn enqueue_after_delay<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let queue = self.clone();
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            queue.enqueue_and_forget(job);
        });
    }

    /// Stops accepting jobs. Jobs already enqueued still run.
    pub fn shutdown(&self) {
        self.sender.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}
