//! Bounded relay queue between a worker's reader thread and the call path.
//!
//! Capacity is fixed at two items: one reply in flight, one pending. Both
//! halves are move-only, so each queue has exactly one producer and one
//! consumer. The producer ends its life by delivering a [`RelayItem::Closed`]
//! sentinel, either explicitly through [`RelayProducer::close`] or on drop.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use thiserror::Error;

/// Number of items the queue holds before `push` blocks.
pub const RELAY_CAPACITY: usize = 2;

/// One item delivered from the reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayItem {
    /// A complete frame payload (possibly empty).
    Payload(Vec<u8>),
    /// Terminal marker: the reader hit an error and will never push again.
    Closed(String),
}

/// Failure of a queue operation.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The bounded wait expired.
    #[error("relay queue wait timed out")]
    Timeout,
    /// The other half of the queue is gone.
    #[error("relay queue disconnected")]
    Disconnected,
}

/// Create a connected producer/consumer pair.
pub fn relay_queue() -> (RelayProducer, RelayConsumer) {
    let (tx, rx) = bounded(RELAY_CAPACITY);
    (
        RelayProducer {
            tx,
            closed: false,
        },
        RelayConsumer { rx },
    )
}

/// Producing half, owned by the reader thread.
#[derive(Debug)]
pub struct RelayProducer {
    tx: Sender<RelayItem>,
    closed: bool,
}

impl RelayProducer {
    /// Push a payload, blocking while the queue is full.
    pub fn push(&self, payload: Vec<u8>) -> Result<(), RelayError> {
        self.tx
            .send(RelayItem::Payload(payload))
            .map_err(|_| RelayError::Disconnected)
    }

    /// Push a payload, giving up after `timeout`.
    pub fn push_timeout(&self, payload: Vec<u8>, timeout: Duration) -> Result<(), RelayError> {
        self.tx
            .send_timeout(RelayItem::Payload(payload), timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => RelayError::Timeout,
                SendTimeoutError::Disconnected(_) => RelayError::Disconnected,
            })
    }

    /// Deliver the terminal sentinel. Consumes the producer.
    pub fn close(mut self, reason: impl Into<String>) {
        self.send_sentinel(reason.into());
    }

    fn send_sentinel(&mut self, reason: String) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Blocks until the consumer makes room; fails only if it is gone.
        let _ = self.tx.send(RelayItem::Closed(reason));
    }
}

impl Drop for RelayProducer {
    fn drop(&mut self) {
        self.send_sentinel("reader exited without closing".to_string());
    }
}

/// Consuming half, owned by the worker process handle.
#[derive(Debug)]
pub struct RelayConsumer {
    rx: Receiver<RelayItem>,
}

impl RelayConsumer {
    /// Pop the next item, blocking while the queue is empty.
    pub fn pop(&self) -> Result<RelayItem, RelayError> {
        self.rx.recv().map_err(|_| RelayError::Disconnected)
    }

    /// Pop the next item, giving up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<RelayItem, RelayError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => RelayError::Timeout,
            RecvTimeoutError::Disconnected => RelayError::Disconnected,
        })
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let (producer, consumer) = relay_queue();
        producer.push(b"first".to_vec()).unwrap();
        producer.push(Vec::new()).unwrap();

        assert_eq!(consumer.len(), 2);
        assert_eq!(consumer.pop().unwrap(), RelayItem::Payload(b"first".to_vec()));
        assert_eq!(consumer.pop().unwrap(), RelayItem::Payload(Vec::new()));
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_third_push_blocks_until_pop() {
        let (producer, consumer) = relay_queue();
        let pushed = Arc::new(AtomicUsize::new(0));

        let counter = pushed.clone();
        let reader = thread::spawn(move || {
            for i in 0..3u8 {
                producer.push(vec![i]).unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }
            producer.close("done");
        });

        thread::sleep(Duration::from_millis(200));
        assert_eq!(pushed.load(Ordering::SeqCst), RELAY_CAPACITY);

        assert_eq!(consumer.pop().unwrap(), RelayItem::Payload(vec![0]));
        assert_eq!(consumer.pop().unwrap(), RelayItem::Payload(vec![1]));
        assert_eq!(consumer.pop().unwrap(), RelayItem::Payload(vec![2]));
        assert_eq!(consumer.pop().unwrap(), RelayItem::Closed("done".to_string()));

        reader.join().unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_push_timeout_when_full() {
        let (producer, _consumer) = relay_queue();
        producer.push(vec![1]).unwrap();
        producer.push(vec![2]).unwrap();

        let err = producer
            .push_timeout(vec![3], Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout);
    }

    #[test]
    fn test_pop_timeout_when_empty() {
        let (_producer, consumer) = relay_queue();
        let err = consumer.pop_timeout(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, RelayError::Timeout);
    }

    #[test]
    fn test_drop_delivers_exactly_one_sentinel() {
        let (producer, consumer) = relay_queue();
        producer.push(b"last".to_vec()).unwrap();
        drop(producer);

        assert_eq!(consumer.pop().unwrap(), RelayItem::Payload(b"last".to_vec()));
        assert!(matches!(consumer.pop().unwrap(), RelayItem::Closed(_)));
        assert_eq!(consumer.pop().unwrap_err(), RelayError::Disconnected);
    }

    #[test]
    fn test_push_after_consumer_dropped() {
        let (producer, consumer) = relay_queue();
        drop(consumer);
        assert_eq!(producer.push(vec![1]).unwrap_err(), RelayError::Disconnected);
    }
}
