// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pull sequence used throughout the resend pipeline.
//!
//! A [`ResendStream`] is the consuming end: `next()` pulls, `pause()` stops
//! the producer at the next send, `resume()` releases it and `cancel()`
//! tears the producer down before any further item is delivered.

use streamr_protocol::StreamMessage;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::ResendError;

/// Create a connected producer/stream pair.
pub fn resend_channel(capacity: usize) -> (ResendProducer, ResendStream) {
    let (tx, rx) = mpsc::channel(capacity);
    let (pause_tx, pause_rx) = watch::channel(false);
    let cancel = CancellationToken::new();
    (
        ResendProducer {
            tx,
            paused: pause_rx,
            cancel: cancel.clone(),
        },
        ResendStream {
            rx,
            pause: pause_tx,
            cancel,
        },
    )
}

/// Producing end; held by a strategy task or the resend handler.
#[derive(Debug)]
pub struct ResendProducer {
    tx: mpsc::Sender<StreamMessage>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl ResendProducer {
    /// Deliver one message, waiting while the consumer has paused the
    /// sequence. Fails once the consumer cancelled or dropped the stream.
    pub async fn send(&mut self, message: StreamMessage) -> Result<(), ResendError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ResendError::Cancelled);
            }
            if !*self.paused.borrow() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ResendError::Cancelled),
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return Err(ResendError::Cancelled);
                    }
                }
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ResendError::Cancelled),
            sent = self.tx.send(message) => sent.map_err(|_| ResendError::Cancelled),
        }
    }
}

/// Consuming end of a resend sequence.
#[derive(Debug)]
pub struct ResendStream {
    rx: mpsc::Receiver<StreamMessage>,
    pause: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl ResendStream {
    /// Pull the next message; `None` once the sequence ended or was
    /// cancelled.
    pub async fn next(&mut self) -> Option<StreamMessage> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }

    pub fn pause(&self) {
        let _ = self.pause.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause.send(false);
    }

    /// Stop the sequence; the producer observes this before it can deliver
    /// anything further.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use streamr_protocol::{MessageId, StreamKey, StreamMessage};

    use super::resend_channel;

    fn message(timestamp: i64) -> StreamMessage {
        let id = MessageId::new(StreamKey::new("s", 0), timestamp, 0, "p", "c");
        StreamMessage::new(id, Vec::new())
    }

    #[tokio::test]
    async fn delivers_in_order_and_ends_when_producer_drops() {
        let (mut producer, mut stream) = resend_channel(4);
        tokio::spawn(async move {
            for timestamp in 0..3 {
                producer.send(message(timestamp)).await.unwrap();
            }
        });
        for timestamp in 0..3 {
            assert_eq!(stream.next().await.unwrap().id.timestamp, timestamp);
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn pause_holds_the_producer_until_resume() {
        let (mut producer, mut stream) = resend_channel(1);
        stream.pause();

        let sender = tokio::spawn(async move { producer.send(message(1)).await });
        // The producer cannot make progress while paused.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());

        stream.resume();
        assert_eq!(stream.next().await.unwrap().id.timestamp, 1);
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_releases_a_paused_producer() {
        let (mut producer, stream) = resend_channel(1);
        stream.pause();
        let sender = tokio::spawn(async move { producer.send(message(1)).await });
        stream.cancel();
        assert!(sender.await.unwrap().is_err());
    }
}
