use crate::model::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

pub const DEFAULT_CAPACITY: usize = 4096;

/// Producer half, held by the session worker. Never waits on the consumer.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    overflow: Arc<AtomicU64>,
}

/// Consumer half. Drained at whatever pace the consumer likes.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
    overflow: Arc<AtomicU64>,
}

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let overflow = Arc::new(AtomicU64::new(0));
    (
        EventSender {
            tx,
            overflow: overflow.clone(),
        },
        EventReceiver { rx, overflow },
    )
}

impl EventSender {
    /// Queues `event`, or drops it and bumps the overflow counter when the
    /// channel is full. Events already queued keep their order.
    pub fn push(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "event bridge full, dropping events");
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("event bridge has no consumer");
            }
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub(crate) fn overflow_handle(&self) -> Arc<AtomicU64> {
        self.overflow.clone()
    }
}

impl EventReceiver {
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Waits for the next event. `None` once the session worker is gone and
    /// the queue is empty.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}
