// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fulfils historical-message requests by chaining strategies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::strategies::ResendStrategy;
use super::stream::{resend_channel, ResendStream};
use super::{ResendError, ResendRequest};

/// Default silence allowed from one strategy before it is timed out.
pub const DEFAULT_MAX_INACTIVITY_PERIOD: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct ResendContext {
    context_id: u64,
    request: ResendRequest,
    started_at: Instant,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Ongoing {
    /// In-flight contexts grouped by requesting peer.
    contexts: HashMap<String, Vec<ResendContext>>,
    /// Per-source serialisation locks; one resend at a time per requester.
    locks: HashMap<String, Arc<AsyncMutex<()>>>,
}

/// Walks an ordered strategy list per request and streams the answer.
#[derive(Clone, Debug)]
pub struct ResendHandler {
    strategies: Arc<Vec<Arc<dyn ResendStrategy>>>,
    max_inactivity: Duration,
    ongoing: Arc<Mutex<Ongoing>>,
    next_context_id: Arc<AtomicU64>,
    error_tx: Option<mpsc::UnboundedSender<(ResendRequest, ResendError)>>,
}

impl ResendHandler {
    pub fn new(strategies: Vec<Arc<dyn ResendStrategy>>) -> Self {
        Self {
            strategies: Arc::new(strategies),
            max_inactivity: DEFAULT_MAX_INACTIVITY_PERIOD,
            ongoing: Arc::new(Mutex::new(Ongoing::default())),
            next_context_id: Arc::new(AtomicU64::new(0)),
            error_tx: None,
        }
    }

    pub fn with_max_inactivity(mut self, max_inactivity: Duration) -> Self {
        self.max_inactivity = max_inactivity;
        self
    }

    /// Route strategy errors somewhere observable; they never abort the
    /// strategy walk.
    pub fn with_error_notifier(
        mut self,
        error_tx: mpsc::UnboundedSender<(ResendRequest, ResendError)>,
    ) -> Self {
        self.error_tx = Some(error_tx);
        self
    }

    /// Open the outbound sequence for a request and fulfil it in the
    /// background.
    ///
    /// Strategies are tried in order; the first one that produces at least
    /// one message is satisfactory and ends the walk. Errors and empty
    /// sequences fall through to the next strategy.
    pub fn handle_request(&self, request: ResendRequest, source: &str) -> ResendStream {
        let (producer, stream) = resend_channel(64);
        let cancel = stream.cancel_token();
        let context_id = self.next_context_id.fetch_add(1, Ordering::Relaxed);

        let source_lock = {
            let Ok(mut ongoing) = self.ongoing.lock() else {
                stream.cancel();
                return stream;
            };
            ongoing
                .contexts
                .entry(source.to_string())
                .or_default()
                .push(ResendContext {
                    context_id,
                    request: request.clone(),
                    started_at: Instant::now(),
                    cancel: cancel.clone(),
                });
            ongoing
                .locks
                .entry(source.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let handler = self.clone();
        let source = source.to_string();
        tokio::spawn(async move {
            let _serialised = source_lock.lock().await;
            handler.fulfil(request, producer, cancel).await;
            handler.unregister(&source, context_id);
        });

        stream
    }

    async fn fulfil(
        &self,
        request: ResendRequest,
        mut producer: super::stream::ResendProducer,
        cancel: CancellationToken,
    ) {
        for strategy in self.strategies.iter() {
            if cancel.is_cancelled() {
                return;
            }
            let mut inner = match strategy.resend(&request).await {
                Ok(inner) => inner,
                Err(err) => {
                    warn!(?strategy, ?err, "resend strategy failed");
                    self.notify_error(&request, err);
                    continue;
                }
            };

            let mut produced = 0usize;
            let satisfied = loop {
                let pulled = tokio::select! {
                    _ = cancel.cancelled() => {
                        inner.cancel();
                        return;
                    }
                    pulled = timeout(self.max_inactivity, inner.next()) => pulled,
                };
                match pulled {
                    Err(_) => {
                        inner.cancel();
                        self.notify_error(
                            &request,
                            ResendError::StrategyTimeout(self.max_inactivity),
                        );
                        break false;
                    }
                    Ok(Some(message)) => {
                        produced += 1;
                        if producer.send(message).await.is_err() {
                            inner.cancel();
                            return;
                        }
                    }
                    Ok(None) => break produced > 0,
                }
            };

            if satisfied {
                debug!(request_id = %request.request_id, produced, "resend satisfied");
                return;
            }
        }
    }

    /// Cancel every outstanding resend a source peer has and hand back the
    /// original requests, so the requester can be re-informed elsewhere.
    pub fn cancel_by_source(&self, source: &str) -> Vec<ResendRequest> {
        let Ok(mut ongoing) = self.ongoing.lock() else {
            return Vec::new();
        };
        ongoing.locks.remove(source);
        ongoing
            .contexts
            .remove(source)
            .map(|contexts| {
                contexts
                    .into_iter()
                    .map(|context| {
                        context.cancel.cancel();
                        context.request
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn num_ongoing(&self) -> usize {
        self.ongoing
            .lock()
            .map(|ongoing| ongoing.contexts.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Mean age of in-flight resend contexts.
    pub fn mean_age(&self) -> Option<Duration> {
        let ongoing = self.ongoing.lock().ok()?;
        let ages: Vec<Duration> = ongoing
            .contexts
            .values()
            .flatten()
            .map(|context| context.started_at.elapsed())
            .collect();
        if ages.is_empty() {
            return None;
        }
        Some(ages.iter().sum::<Duration>() / ages.len() as u32)
    }

    fn unregister(&self, source: &str, context_id: u64) {
        let Ok(mut ongoing) = self.ongoing.lock() else {
            return;
        };
        if let Some(contexts) = ongoing.contexts.get_mut(source) {
            contexts.retain(|context| context.context_id != context_id);
            if contexts.is_empty() {
                ongoing.contexts.remove(source);
                ongoing.locks.remove(source);
            }
        }
    }

    fn notify_error(&self, request: &ResendRequest, error: ResendError) {
        if let Some(error_tx) = &self.error_tx {
            let _ = error_tx.send((request.clone(), error));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use streamr_protocol::{MessageId, StreamKey, StreamMessage};
    use tokio::sync::mpsc;

    use crate::resend::strategies::ResendStrategy;
    use crate::resend::stream::{resend_channel, ResendStream};
    use crate::resend::{ResendError, ResendKind, ResendRequest};

    use super::ResendHandler;

    fn request() -> ResendRequest {
        ResendRequest {
            request_id: "request-1".to_string(),
            stream_key: StreamKey::new("s", 0),
            kind: ResendKind::Last { number_last: 10 },
        }
    }

    fn message(timestamp: i64) -> StreamMessage {
        let id = MessageId::new(StreamKey::new("s", 0), timestamp, 0, "p", "c");
        StreamMessage::new(id, Vec::new())
    }

    #[derive(Debug)]
    struct EmptyStrategy;

    #[async_trait]
    impl ResendStrategy for EmptyStrategy {
        async fn resend(&self, _request: &ResendRequest) -> Result<ResendStream, ResendError> {
            let (producer, stream) = resend_channel(4);
            drop(producer);
            Ok(stream)
        }
    }

    #[derive(Debug)]
    struct FixedStrategy(Vec<i64>);

    #[async_trait]
    impl ResendStrategy for FixedStrategy {
        async fn resend(&self, _request: &ResendRequest) -> Result<ResendStream, ResendError> {
            let (mut producer, stream) = resend_channel(4);
            let timestamps = self.0.clone();
            tokio::spawn(async move {
                for timestamp in timestamps {
                    if producer.send(message(timestamp)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(stream)
        }
    }

    #[derive(Debug)]
    struct FailingStrategy;

    #[async_trait]
    impl ResendStrategy for FailingStrategy {
        async fn resend(&self, _request: &ResendRequest) -> Result<ResendStream, ResendError> {
            Err(ResendError::Strategy("backend unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn empty_strategy_falls_through_to_the_next() {
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let handler = ResendHandler::new(vec![
            Arc::new(EmptyStrategy),
            Arc::new(FixedStrategy(vec![1, 2])),
        ])
        .with_error_notifier(error_tx);

        let mut stream = handler.handle_request(request(), "requester");
        assert_eq!(stream.next().await.unwrap().id.timestamp, 1);
        assert_eq!(stream.next().await.unwrap().id.timestamp, 2);
        assert!(stream.next().await.is_none());

        // The empty strategy is not an error.
        assert!(error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn satisfactory_strategy_stops_the_walk() {
        let handler = ResendHandler::new(vec![
            Arc::new(FixedStrategy(vec![7])),
            Arc::new(FixedStrategy(vec![100, 200])),
        ]);
        let mut stream = handler.handle_request(request(), "requester");
        assert_eq!(stream.next().await.unwrap().id.timestamp, 7);
        // The second strategy is never consulted.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failing_strategy_is_reported_and_skipped() {
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let handler = ResendHandler::new(vec![
            Arc::new(FailingStrategy),
            Arc::new(FixedStrategy(vec![5])),
        ])
        .with_error_notifier(error_tx);

        let mut stream = handler.handle_request(request(), "requester");
        assert_eq!(stream.next().await.unwrap().id.timestamp, 5);
        assert!(stream.next().await.is_none());

        let (failed_request, error) = error_rx.recv().await.unwrap();
        assert_eq!(failed_request.request_id, "request-1");
        assert!(matches!(error, ResendError::Strategy(_)));
    }

    #[tokio::test]
    async fn all_strategies_empty_yields_an_empty_sequence() {
        let handler = ResendHandler::new(vec![Arc::new(EmptyStrategy), Arc::new(EmptyStrategy)]);
        let mut stream = handler.handle_request(request(), "requester");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_by_source_returns_original_requests() {
        let handler = ResendHandler::new(vec![Arc::new(FixedStrategy((0..128).collect()))]);
        let mut stream = handler.handle_request(request(), "requester");
        // Pull one item so the resend is known to be in flight.
        assert!(stream.next().await.is_some());
        assert_eq!(handler.num_ongoing(), 1);
        assert!(handler.mean_age().is_some());

        let cancelled = handler.cancel_by_source("requester");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].request_id, "request-1");

        // The sequence drains to an end after cancellation.
        tokio::time::timeout(Duration::from_secs(1), async {
            while stream.next().await.is_some() {}
        })
        .await
        .unwrap();
        assert_eq!(handler.cancel_by_source("requester").len(), 0);
    }
}
