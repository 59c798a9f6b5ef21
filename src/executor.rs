//! The serialized executor: a single-consumer FIFO queue so live-router
//! actions and subscription-management actions never race with each other
//! (`spec.md` §4.6).

use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

type BoxedWork = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, ()> + Send>;

/// Handle used to enqueue work. Cloning shares the same queue.
#[derive(Clone)]
pub struct Executor {
    sender: mpsc::UnboundedSender<BoxedWork>,
}

impl Executor {
    /// Spawns the consumer task and returns a handle plus a join handle the
    /// caller can await for graceful shutdown (the consumer drains its
    /// backlog before returning once the last `Executor` handle is dropped).
    pub fn spawn() -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxedWork>();
        let join = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job().await;
            }
        });
        (Self { sender }, join)
    }

    /// Enqueue `work`, not waiting for it to run. Silently dropped if the
    /// consumer has already shut down.
    #[instrument(skip(self, work))]
    pub fn schedule<F>(&self, work: F)
    where
        F: FnOnce() -> futures::future::BoxFuture<'static, ()> + Send + 'static,
    {
        if self.sender.send(Box::new(work)).is_err() {
            warn!("executor queue closed; dropping scheduled work");
        }
    }

    /// Enqueue `work` and await its result via a oneshot reply channel.
    pub async fn schedule_and_wait<T, F, Fut>(&self, work: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: BoxedWork = Box::new(move || {
            Box::pin(async move {
                let result = work().await;
                let _ = reply_tx.send(result);
            })
        });
        if self.sender.send(job).is_err() {
            panic!("executor queue closed while scheduling an awaited job");
        }
        reply_rx.await.expect("executor dropped the reply sender without responding")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn schedule_and_wait_returns_the_result() {
        let (executor, _join) = Executor::spawn();
        let got = executor.schedule_and_wait(|| async { 1 + 1 }).await;
        assert_eq!(got, 2);
    }

    #[tokio::test]
    async fn work_runs_in_fifo_order() {
        let (executor, _join) = Executor::spawn();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            executor.schedule(move || {
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                })
            });
        }
        // Drain by scheduling one more item and waiting on it.
        executor.schedule_and_wait(|| async {}).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn schedule_counts_pending_callbacks() {
        let (executor, _join) = Executor::spawn();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        executor.schedule(move || {
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
        });
        executor.schedule_and_wait(|| async {}).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
