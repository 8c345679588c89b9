//! Fixed-size worker pool.
//!
//! Work is queued on a bounded channel and picked up by exactly one of `size`
//! long-lived worker tasks. A worker only takes the next item after the
//! current one has finished, so at most `size` items run at once. Every
//! dispatch returns a one-shot [`DispatchHandle`] that resolves to the
//! outcome of that single item.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("worker pool size must be at least 1")]
    ZeroWorkers,
    #[error("worker pool has shut down")]
    Closed,
    #[error("worker dropped the result before delivering it")]
    WorkerLost,
}

type Work<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

struct Envelope<T> {
    work: Work<T>,
    reply: oneshot::Sender<anyhow::Result<T>>,
}

pub struct WorkerDispatcher<T> {
    queue: mpsc::Sender<Envelope<T>>,
}

impl<T: Send + 'static> WorkerDispatcher<T> {
    /// Spawn `size` workers on the current tokio runtime.
    pub fn new(name: &str, size: usize) -> Result<Self, DispatchError> {
        if size == 0 {
            return Err(DispatchError::ZeroWorkers);
        }
        let (queue, rx) = mpsc::channel::<Envelope<T>>(size);
        let rx = Arc::new(Mutex::new(rx));
        // Workers exit on their own once every sender is dropped.
        for id in 0..size {
            tokio::spawn(worker_loop(format!("{}-{}", name, id), rx.clone()));
        }
        Ok(Self { queue })
    }

    /// Queue `work`. Waits only for queue capacity, never for the work itself.
    pub async fn dispatch<F, Fut>(&self, work: F) -> Result<DispatchHandle<T>, DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            work: Box::new(move || work().boxed()),
            reply,
        };
        self.queue
            .send(envelope)
            .await
            .map_err(|_| DispatchError::Closed)?;
        Ok(DispatchHandle { rx })
    }
}

async fn worker_loop<T>(name: String, queue: Arc<Mutex<mpsc::Receiver<Envelope<T>>>>) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(Envelope { work, reply }) = next else {
            debug!("worker {} stopping, queue closed", name);
            return;
        };
        let outcome = match AssertUnwindSafe(work()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("worker {}: dispatched work panicked", name);
                Err(anyhow::anyhow!("dispatched work panicked"))
            }
        };
        if reply.send(outcome).is_err() {
            debug!("worker {}: result handle was dropped before delivery", name);
        }
    }
}

/// Single-consumer result of one dispatched item.
pub struct DispatchHandle<T> {
    rx: oneshot::Receiver<anyhow::Result<T>>,
}

impl<T> Future for DispatchHandle<T> {
    type Output = anyhow::Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|delivered| delivered.unwrap_or_else(|_| Err(DispatchError::WorkerLost.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_workers_is_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let e = WorkerDispatcher::<()>::new("test", 0).err().unwrap();
            assert!(matches!(e, DispatchError::ZeroWorkers));
        });
    }

    #[tokio::test]
    async fn results_and_errors_are_delivered() {
        let pool = WorkerDispatcher::new("test", 2).unwrap();
        let ok = pool.dispatch(|| async { Ok(21 * 2) }).await.unwrap();
        let failed = pool
            .dispatch(|| async { Err(anyhow::anyhow!("boom")) })
            .await
            .unwrap();
        assert_eq!(ok.await.unwrap(), 42);
        assert_eq!(failed.await.unwrap_err().to_string(), "boom");
    }

    #[tokio::test]
    async fn single_slot_serializes_work() {
        let pool = WorkerDispatcher::new("test", 1).unwrap();
        let (release, gate) = oneshot::channel::<()>();
        let second_started = Arc::new(AtomicBool::new(false));

        let first = pool
            .dispatch(|| async move {
                gate.await.ok();
                Ok(1)
            })
            .await
            .unwrap();
        let flag = second_started.clone();
        let second = pool
            .dispatch(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second_started.load(Ordering::SeqCst));

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
        assert!(second_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_pool_size() {
        let pool = WorkerDispatcher::new("test", 3).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                pool.dispatch(move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap(),
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn a_panicking_item_does_not_kill_the_worker() {
        let pool = WorkerDispatcher::<u8>::new("test", 1).unwrap();
        let panicked = pool
            .dispatch(|| async {
                if true {
                    panic!("bad work");
                }
                Ok(0)
            })
            .await
            .unwrap();
        assert!(panicked.await.is_err());
        let after = pool.dispatch(|| async { Ok(7) }).await.unwrap();
        assert_eq!(after.await.unwrap(), 7);
    }
}
