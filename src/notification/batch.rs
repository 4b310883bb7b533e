//! Batch Notifier
//!
//! A background task that accumulates notifications and hands them to a
//! subscriber in batches. Producers never wait for delivery.
//!
//! A batch is flushed when either `max_batch_size` items are pending or the
//! flush interval elapses, whichever comes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Default number of pending items that forces a flush.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

/// Default time between flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Returned by [`BatchNotifier::notify`] once shutdown has begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Notifier is closed")]
pub struct NotifierClosed;

/// Receives flushed batches.
#[async_trait]
pub trait Notify<T: Send + 'static>: Send + Sync + 'static {
    async fn notify(&self, items: Vec<T>);
}

/// Flush triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

enum Message<T> {
    Item(T),
    Shutdown(oneshot::Sender<()>),
}

struct Shared<T> {
    sender: mpsc::UnboundedSender<Message<T>>,
    accepting: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running batch notifier. Cloning shares the same background task.
pub struct BatchNotifier<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BatchNotifier<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> BatchNotifier<T> {
    /// Spawns the background loop on the current tokio runtime.
    pub fn start<N>(subscriber: N, config: BatchConfig) -> Self
    where
        N: Notify<T>,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(drain(receiver, subscriber, config));

        Self {
            shared: Arc::new(Shared {
                sender,
                accepting: AtomicBool::new(true),
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Queues an item without waiting for it to be delivered.
    pub fn notify(&self, item: T) -> Result<(), NotifierClosed> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(NotifierClosed);
        }

        self.shared
            .sender
            .send(Message::Item(item))
            .map_err(|_| NotifierClosed)
    }

    /// Returns true once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        !self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Stops intake, flushes everything already queued and waits for the
    /// background task to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shared.accepting.swap(false, Ordering::SeqCst) {
            let (ack, done) = oneshot::channel();
            if self.shared.sender.send(Message::Shutdown(ack)).is_ok() {
                let _ = done.await;
            }
        }

        if let Some(task) = self.shared.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn drain<T, N>(
    mut receiver: mpsc::UnboundedReceiver<Message<T>>,
    subscriber: N,
    config: BatchConfig,
) where
    T: Send + 'static,
    N: Notify<T>,
{
    let max_batch_size = config.max_batch_size.max(1);
    let period = config.flush_interval.max(Duration::from_millis(1));
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending = Vec::new();

    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(Message::Item(item)) => {
                    pending.push(item);
                    if pending.len() >= max_batch_size {
                        flush(&subscriber, &mut pending).await;
                    }
                }
                Some(Message::Shutdown(ack)) => {
                    // Items that raced past the intake check are still delivered.
                    receiver.close();
                    while let Ok(message) = receiver.try_recv() {
                        if let Message::Item(item) = message {
                            pending.push(item);
                        }
                    }
                    flush(&subscriber, &mut pending).await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    flush(&subscriber, &mut pending).await;
                    break;
                }
            },
            _ = ticker.tick() => flush(&subscriber, &mut pending).await,
        }
    }

    debug!("Batch notifier stopped");
}

async fn flush<T, N>(subscriber: &N, pending: &mut Vec<T>)
where
    T: Send + 'static,
    N: Notify<T>,
{
    if pending.is_empty() {
        return;
    }

    let batch = std::mem::take(pending);
    debug!("Flushing {} notifications", batch.len());
    subscriber.notify(batch).await;
}
