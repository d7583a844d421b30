//! Task Queue
//!
//! Ordered in-process channel between one worker and one pipeline. The queue
//! remembers whether a terminal event went through; the first terminal push
//! wins and every later push is reported as stale.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::events::QueueMessage;

/// Result of pushing onto a [`TaskQueue`]
#[derive(Debug)]
pub(crate) enum PushOutcome {
    /// The message is queued
    Enqueued,
    /// A terminal event was already queued; the message is dropped
    Stale(QueueMessage),
    /// The receiving side is gone
    Closed,
}

pub(crate) struct TaskQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueueMessage>>>,
    terminated: AtomicBool,
    published: AtomicU64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            terminated: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    /// Push a message, enforcing a single terminal event
    pub(crate) fn push(&self, message: QueueMessage) -> PushOutcome {
        if message.event.is_terminal() {
            if self
                .terminated
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return PushOutcome::Stale(message);
            }
        } else if self.terminated.load(Ordering::Acquire) {
            return PushOutcome::Stale(message);
        }

        match self.tx.send(message) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Enqueued
            }
            Err(_) => PushOutcome::Closed,
        }
    }

    /// Take the receiving half; only the first caller gets it
    pub(crate) fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<QueueMessage>> {
        self.rx.lock().take()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TaskId;
    use crate::queue::events::{PublishFrom, QueueEvent, StopReason};

    fn message(event: QueueEvent) -> QueueMessage {
        QueueMessage::new(TaskId::new("t"), event, PublishFrom::Worker)
    }

    #[test]
    fn test_first_terminal_wins() {
        let queue = TaskQueue::new();
        assert!(matches!(
            queue.push(message(QueueEvent::text("a"))),
            PushOutcome::Enqueued
        ));
        assert!(matches!(
            queue.push(message(QueueEvent::Stop(StopReason::UserManual))),
            PushOutcome::Enqueued
        ));
        assert!(queue.is_terminated());
        assert!(matches!(
            queue.push(message(QueueEvent::Stop(StopReason::Timeout))),
            PushOutcome::Stale(_)
        ));
        assert!(matches!(
            queue.push(message(QueueEvent::text("late"))),
            PushOutcome::Stale(_)
        ));
        assert_eq!(queue.published_count(), 2);
    }

    #[test]
    fn test_receiver_taken_once() {
        let queue = TaskQueue::new();
        assert!(queue.take_receiver().is_some());
        assert!(queue.take_receiver().is_none());
    }

    #[test]
    fn test_push_after_receiver_dropped() {
        let queue = TaskQueue::new();
        drop(queue.take_receiver());
        assert!(matches!(
            queue.push(message(QueueEvent::text("a"))),
            PushOutcome::Closed
        ));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new();
        let mut rx = queue.take_receiver().unwrap();
        for text in ["a", "b", "c"] {
            queue.push(message(QueueEvent::text(text)));
        }
        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let QueueEvent::TextChunk { text, .. } = msg.event {
                seen.push(text);
            }
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }
}
