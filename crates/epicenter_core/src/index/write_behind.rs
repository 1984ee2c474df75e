//! Debounced background flushing.
//!
//! A [`WriteBehind`] owns a tokio task that collects keys sent from observer
//! callbacks and hands them to a flush closure once the stream has been quiet
//! for the debounce interval. Keys are deduplicated and keep their first-seen
//! order. A continuous stream of keys is still flushed at least every
//! `MAX_DELAY_FACTOR` intervals.

use std::hash::Hash;
use std::time::Duration;

use indexmap::IndexSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MAX_DELAY_FACTOR: u32 = 4;

/// Handle to a debounced flush task.
pub struct WriteBehind<K> {
    tx: mpsc::UnboundedSender<K>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<K> WriteBehind<K>
where
    K: Eq + Hash + Send + 'static,
{
    /// Spawn the flush task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<F>(debounce: Duration, flush: F) -> Self
    where
        F: FnMut(Vec<K>) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(rx, shutdown_rx, debounce, flush));
        Self {
            tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// A sender for observer callbacks. Sending never blocks.
    pub fn sender(&self) -> mpsc::UnboundedSender<K> {
        self.tx.clone()
    }

    /// Queue a key for the next flush.
    pub fn schedule(&self, key: K) {
        let _ = self.tx.send(key);
    }

    /// Stop the task. Pending keys are discarded and no flush runs after this
    /// returns.
    pub async fn shutdown(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            log::warn!("Write-behind task ended abnormally: {}", e);
        }
    }
}

impl<K> Drop for WriteBehind<K> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<K, F>(
    mut rx: mpsc::UnboundedReceiver<K>,
    mut shutdown_rx: oneshot::Receiver<()>,
    debounce: Duration,
    mut flush: F,
) where
    K: Eq + Hash,
    F: FnMut(Vec<K>),
{
    let mut pending: IndexSet<K> = IndexSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => return,
            key = rx.recv() => match key {
                Some(key) => {
                    pending.insert(key);
                }
                None => return,
            },
        }

        let deadline = Instant::now() + debounce * MAX_DELAY_FACTOR;
        let sleep = tokio::time::sleep(debounce);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => return,
                _ = &mut sleep => break,
                key = rx.recv() => match key {
                    Some(key) => {
                        pending.insert(key);
                        let next = (Instant::now() + debounce).min(deadline);
                        sleep.as_mut().reset(next);
                    }
                    None => break,
                },
            }
        }

        flush(pending.drain(..).collect());
    }
}
