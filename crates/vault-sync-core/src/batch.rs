//! Micro-batching: collect items until a deadline passes or the batch is full.
//!
//! `MicroBatch` is the synchronous core (used directly by the watcher, which
//! drives its own clock); `spawn_batcher` wraps it in a tokio task for
//! channel-fed producers such as the UI feed.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
pub struct MicroBatch<T> {
    items: Vec<T>,
    opened_at: Option<Instant>,
    max_wait: Duration,
    max_size: usize,
}

impl<T> MicroBatch<T> {
    pub fn new(max_wait: Duration, max_size: usize) -> Self {
        Self {
            items: Vec::new(),
            opened_at: None,
            max_wait,
            max_size: max_size.max(1),
        }
    }

    /// Add an item. Returns the batch when this push filled it.
    pub fn push(&mut self, item: T, now: Instant) -> Option<Vec<T>> {
        if self.items.is_empty() {
            self.opened_at = Some(now);
        }
        self.items.push(item);
        if self.items.len() >= self.max_size {
            return Some(self.take());
        }
        None
    }

    /// When the current batch must be flushed, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.max_wait)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| now >= d)
    }

    pub fn take(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Spawn a task that turns a stream of items into batches.
///
/// The batch channel closes after the input side is dropped and the last
/// partial batch has been flushed.
pub fn spawn_batcher<T: Send + 'static>(
    max_wait: Duration,
    max_size: usize,
) -> (mpsc::UnboundedSender<T>, mpsc::UnboundedReceiver<Vec<T>>) {
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<T>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<T>>();

    tokio::spawn(async move {
        let mut batch = MicroBatch::new(max_wait, max_size);
        loop {
            let deadline = batch.deadline();
            tokio::select! {
                item = in_rx.recv() => match item {
                    Some(item) => {
                        if let Some(full) = batch.push(item, Instant::now())
                            && out_tx.send(full).is_err()
                        {
                            return;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            let _ = out_tx.send(batch.take());
                        }
                        return;
                    }
                },
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if out_tx.send(batch.take()).is_err() {
                        return;
                    }
                }
            }
        }
    });

    (in_tx, out_rx)
}
