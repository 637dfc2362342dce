//! Worker pool for the in-process dispatch queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::notification::dispatcher::Dispatcher;
use crate::notification::queue::DispatchTask;

/// A pool of dispatch workers sharing one task receiver.
pub struct WorkerPool {
    workers: usize,
    cancellation_token: CancellationToken,
    processed: Arc<AtomicU64>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize, cancellation_token: CancellationToken) -> Self {
        Self {
            workers: workers.max(1),
            cancellation_token,
            processed: Arc::new(AtomicU64::new(0)),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start(&self, dispatcher: Arc<Dispatcher>, receiver: mpsc::UnboundedReceiver<DispatchTask>) {
        let receiver = Arc::new(Mutex::new(receiver));
        info!("Starting dispatch worker pool with {} workers", self.workers);

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return;
        };

        for i in 0..self.workers {
            let receiver = receiver.clone();
            let dispatcher = dispatcher.clone();
            let token = self.cancellation_token.clone();
            let processed = self.processed.clone();

            join_set.spawn(async move {
                debug!("Dispatch worker {} started", i);
                loop {
                    let task = tokio::select! {
                        _ = token.cancelled() => break,
                        task = async { receiver.lock().await.recv().await } => task,
                    };
                    let Some(task) = task else {
                        debug!("Dispatch queue closed, worker {} exiting", i);
                        break;
                    };

                    let delivery_id = task.delivery_id.clone();
                    match dispatcher.dispatch(task).await {
                        Ok(outcome) => {
                            debug!(worker = i, delivery_id = %delivery_id, ?outcome, "Task processed");
                        }
                        Err(e) => {
                            error!(worker = i, delivery_id = %delivery_id, error = %e, "Dispatch failed");
                        }
                    }
                    processed.fetch_add(1, Ordering::Relaxed);
                }
                debug!("Dispatch worker {} shutting down", i);
            });
        }
    }

    /// Tasks handled since start, successful or not.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Cancel the workers and wait for them to finish their current task.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }
        info!("Dispatch worker pool stopped");
    }
}
