// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use streamr_protocol::{NodeControlMessage, Status, StreamKey, StreamMessage, TrackerControlMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::endpoint::{
    close_codes, disconnection_reasons, Endpoint, EndpointError, EndpointEvent,
};
use crate::metrics::Metrics;
use crate::peer::PeerInfo;
use crate::protocols::{NodeToNode, NodeToTracker};
use crate::resend::{LocalResendStrategy, ResendHandler, ResendRequest, ResendStream};

use super::streams::StreamManager;
use super::{NodeConfig, NodeError, NodeEvent};

/// Tracker reconnect backoff bounds.
const TRACKER_RECONNECT_BASE: Duration = Duration::from_secs(2);
const TRACKER_RECONNECT_CAP: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub(crate) enum ToNodeActor {
    Subscribe {
        stream: StreamKey,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Unsubscribe {
        stream: StreamKey,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Publish {
        message: StreamMessage,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    FindStorageNodes {
        stream: StreamKey,
        reply: oneshot::Sender<Result<Vec<String>, NodeError>>,
    },
    Metrics {
        reply: oneshot::Sender<BTreeMap<String, u64>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// A connect attempt issued for an instruction finished.
    ConnectFinished {
        stream: StreamKey,
        address: String,
        result: Result<String, EndpointError>,
    },
    /// The no-shared-streams grace period for a peer elapsed.
    CheckNoSharedStreams {
        peer_id: String,
    },
}

/// The node engine: one actor owning subscription state, neighbour
/// bookkeeping and the forwarding path.
pub(crate) struct NodeActor {
    config: NodeConfig,
    endpoint: Endpoint,
    endpoint_events: mpsc::UnboundedReceiver<EndpointEvent>,
    inbox: mpsc::Receiver<ToNodeActor>,
    actor_tx: mpsc::Sender<ToNodeActor>,
    node_adapter: NodeToNode,
    tracker_adapter: NodeToTracker,
    streams: StreamManager,
    /// Connected node and storage peers with their advertised addresses.
    connected: HashMap<String, (PeerInfo, String)>,
    /// Connected trackers and their advertised addresses.
    trackers: HashMap<String, String>,
    /// Addresses we are connecting to per stream, awaiting
    /// connect-then-subscribe.
    pending_subscriptions: HashMap<StreamKey, HashSet<String>>,
    /// Peers with a no-shared-streams check already scheduled.
    pending_disconnects: HashSet<String>,
    pending_storage_queries:
        HashMap<StreamKey, Vec<oneshot::Sender<Result<Vec<String>, NodeError>>>>,
    resend: ResendHandler,
    metrics: Metrics,
    events_tx: broadcast::Sender<NodeEvent>,
    shutdown: CancellationToken,
}

impl NodeActor {
    pub(crate) fn new(
        config: NodeConfig,
        endpoint: Endpoint,
        endpoint_events: mpsc::UnboundedReceiver<EndpointEvent>,
        inbox: mpsc::Receiver<ToNodeActor>,
        actor_tx: mpsc::Sender<ToNodeActor>,
        events_tx: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let node_adapter = NodeToNode::new(endpoint.clone());
        let tracker_adapter = NodeToTracker::new(endpoint.clone());

        let mut strategies = config.resend_strategies.clone();
        if let Some(store) = &config.message_store {
            strategies.insert(0, std::sync::Arc::new(LocalResendStrategy::new(store.clone())));
        }
        let resend = ResendHandler::new(strategies)
            .with_max_inactivity(config.max_inactivity_period);

        Self {
            config,
            endpoint,
            endpoint_events,
            inbox,
            actor_tx,
            node_adapter,
            tracker_adapter,
            streams: StreamManager::new(),
            connected: HashMap::new(),
            trackers: HashMap::new(),
            pending_subscriptions: HashMap::new(),
            pending_disconnects: HashSet::new(),
            pending_storage_queries: HashMap::new(),
            resend,
            metrics: Metrics::new(),
            events_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        for tracker_url in self.config.trackers.clone() {
            self.spawn_tracker_connect(tracker_url);
        }
        loop {
            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else { break };
                    if self.on_command(command).await {
                        break;
                    }
                }
                event = self.endpoint_events.recv() => {
                    let Some(event) = event else { break };
                    self.on_endpoint_event(event).await;
                }
            }
        }
        debug!(node = %self.endpoint.peer_info(), "node actor stopped");
    }

    /// Returns true when the actor should shut down.
    async fn on_command(&mut self, command: ToNodeActor) -> bool {
        match command {
            ToNodeActor::Subscribe { stream, reply } => {
                self.on_subscribe(stream).await;
                let _ = reply.send(Ok(()));
            }
            ToNodeActor::Unsubscribe { stream, reply } => {
                self.on_unsubscribe(stream).await;
                let _ = reply.send(Ok(()));
            }
            ToNodeActor::Publish { message, reply } => {
                self.on_publish(message).await;
                let _ = reply.send(Ok(()));
            }
            ToNodeActor::FindStorageNodes { stream, reply } => {
                self.on_find_storage_nodes(stream, reply).await;
            }
            ToNodeActor::Metrics { reply } => {
                self.metrics
                    .set("resends:numOfOngoingResends", self.resend.num_ongoing() as u64);
                self.metrics.set(
                    "resends:meanAgeMs",
                    self.resend
                        .mean_age()
                        .map(|age| age.as_millis() as u64)
                        .unwrap_or(0),
                );
                let _ = reply.send(self.metrics.report());
            }
            ToNodeActor::ConnectFinished {
                stream,
                address,
                result,
            } => self.on_connect_finished(stream, address, result).await,
            ToNodeActor::CheckNoSharedStreams { peer_id } => {
                self.on_check_no_shared_streams(peer_id).await;
            }
            ToNodeActor::Shutdown { reply } => {
                self.shutdown.cancel();
                self.endpoint.stop().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn on_endpoint_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::PeerConnected { peer, address } => {
                if peer.is_tracker() {
                    self.trackers.insert(peer.peer_id.clone(), address);
                    self.emit(NodeEvent::TrackerConnected {
                        tracker_id: peer.peer_id.clone(),
                    });
                    self.send_status_to(&peer.peer_id).await;
                } else {
                    self.connected
                        .insert(peer.peer_id.clone(), (peer.clone(), address.clone()));
                    // The surviving socket of a duplicate tiebreak may have
                    // swallowed an in-flight subscribe, so repeat them.
                    self.resubscribe_outbound(&peer.peer_id).await;
                    self.emit(NodeEvent::NodeConnected {
                        peer_id: peer.peer_id,
                        address,
                    });
                }
            }
            EndpointEvent::PeerDisconnected {
                peer,
                address,
                reason,
            } => {
                debug!(peer = %peer, %reason, "peer disconnected");
                self.on_peer_disconnected(peer, address).await;
            }
            EndpointEvent::MessageReceived { peer, payload } => {
                self.on_message_received(peer, payload).await;
            }
            EndpointEvent::HighBackPressure { peer } => {
                self.metrics.record("highBackPressure");
                debug!(peer = %peer, "high back pressure");
            }
            EndpointEvent::LowBackPressure { peer } => {
                debug!(peer = %peer, "back pressure recovered");
            }
        }
    }

    async fn on_peer_disconnected(&mut self, peer: PeerInfo, address: String) {
        if peer.is_tracker() {
            if self.trackers.remove(&peer.peer_id).is_some() {
                self.emit(NodeEvent::TrackerDisconnected {
                    tracker_id: peer.peer_id,
                });
                if !self.shutdown.is_cancelled() {
                    self.spawn_tracker_connect(address);
                }
            }
            return;
        }

        self.connected.remove(&peer.peer_id);
        self.pending_disconnects.remove(&peer.peer_id);
        let changed = self.streams.remove_peer(&peer.peer_id);
        let cancelled = self.resend.cancel_by_source(&peer.peer_id);
        if !cancelled.is_empty() {
            debug!(
                peer = %peer,
                count = cancelled.len(),
                "cancelled resends of disconnected peer"
            );
        }
        self.emit(NodeEvent::NodeDisconnected {
            peer_id: peer.peer_id,
            address,
        });
        if !changed.is_empty() {
            self.send_status_to_all().await;
        }
    }

    async fn on_message_received(&mut self, peer: PeerInfo, payload: Vec<u8>) {
        if peer.is_tracker() {
            match NodeToTracker::decode(&payload) {
                Ok(message) => self.on_tracker_message(peer, message).await,
                Err(err) => self.on_protocol_error(&peer.peer_id, err).await,
            }
        } else {
            match NodeToNode::decode(&payload) {
                Ok(message) => self.on_node_message(peer, message).await,
                Err(err) => self.on_protocol_error(&peer.peer_id, err).await,
            }
        }
    }

    async fn on_protocol_error(&mut self, peer_id: &str, err: streamr_protocol::ProtocolError) {
        warn!(peer = %peer_id, ?err, "closing connection on protocol error");
        self.metrics.record("protocolError");
        self.endpoint
            .close_with_code(
                peer_id,
                close_codes::PROTOCOL_ERROR,
                disconnection_reasons::BAD_PROTOCOL_MESSAGE,
            )
            .await;
    }

    async fn on_tracker_message(&mut self, tracker: PeerInfo, message: TrackerControlMessage) {
        match message {
            TrackerControlMessage::Instruction {
                stream_key,
                node_addresses,
                counter,
            } => {
                self.metrics.record("onInstruction");
                self.on_instruction(&tracker.peer_id, stream_key, node_addresses, counter)
                    .await;
            }
            TrackerControlMessage::StorageNodesResponse {
                stream_key,
                node_addresses,
            } => {
                if let Some(waiting) = self.pending_storage_queries.remove(&stream_key) {
                    for reply in waiting {
                        let _ = reply.send(Ok(node_addresses.clone()));
                    }
                }
            }
            other => {
                debug!(tracker = %tracker, ?other, "unexpected control message from tracker");
            }
        }
    }

    async fn on_node_message(&mut self, peer: PeerInfo, message: NodeControlMessage) {
        if let Some(request) = ResendRequest::from_control(&message) {
            self.metrics.record("onResendRequest");
            self.serve_resend(request, peer.peer_id);
            return;
        }
        match message {
            NodeControlMessage::Broadcast { message } => {
                self.on_data(message, &peer.peer_id).await;
            }
            NodeControlMessage::Unicast {
                request_id,
                message,
            } => {
                self.emit(NodeEvent::UnicastReceived {
                    request_id,
                    message,
                });
            }
            NodeControlMessage::Subscribe { stream_key } => {
                self.on_subscribe_request(stream_key, peer.peer_id).await;
            }
            NodeControlMessage::Unsubscribe { stream_key } => {
                self.on_unsubscribe_request(stream_key, peer.peer_id).await;
            }
            NodeControlMessage::ResendResponse {
                request_id,
                stream_key,
                kind,
            } => {
                self.emit(NodeEvent::ResendResponseReceived {
                    request_id,
                    stream_key,
                    kind,
                });
            }
            NodeControlMessage::ResendLast { .. }
            | NodeControlMessage::ResendFrom { .. }
            | NodeControlMessage::ResendRange { .. } => {
                // Handled through ResendRequest::from_control above.
            }
        }
    }

    async fn on_subscribe(&mut self, stream: StreamKey) {
        if self.streams.set_up(&stream) {
            debug!(stream = %stream, "subscribed");
            self.send_status_to_all().await;
        }
    }

    async fn on_unsubscribe(&mut self, stream: StreamKey) {
        let Some(neighbours) = self.streams.remove(&stream) else {
            return;
        };
        debug!(stream = %stream, "unsubscribed");
        self.pending_subscriptions.remove(&stream);
        for peer_id in &neighbours {
            if let Err(err) = self.node_adapter.send_unsubscribe(peer_id, &stream).await {
                debug!(peer = %peer_id, ?err, "failed to send unsubscribe");
            }
        }
        for peer_id in neighbours {
            if !self.streams.has_shared_streams(&peer_id) {
                self.schedule_disconnect_check(peer_id);
            }
        }
        self.send_status_to_all().await;
    }

    async fn on_publish(&mut self, message: StreamMessage) {
        let stream = message.id.stream_key.clone();
        if self.streams.set_up(&stream) {
            self.send_status_to_all().await;
        }
        if !self.streams.mark_and_check(&message) {
            self.metrics.record("publish:duplicateMessage");
            return;
        }
        if let Some(store) = &self.config.message_store {
            store.insert(message.clone()).await;
        }
        self.metrics.record("publish");
        self.fan_out(&message, &stream, None).await;
    }

    /// A broadcast arrived from a neighbour.
    async fn on_data(&mut self, message: StreamMessage, source: &str) {
        let stream = message.id.stream_key.clone();
        if !self.streams.is_inbound(&stream, source) {
            // Only messages pulled via subscription are accepted.
            self.metrics.record("onDataReceived:ignoredMessage");
            return;
        }
        if !self.streams.mark_and_check(&message) {
            self.metrics.record("onDataReceived:duplicateMessage");
            return;
        }
        if let Some(store) = &self.config.message_store {
            store.insert(message.clone()).await;
        }
        self.metrics.record("onDataReceived");
        self.fan_out(&message, &stream, Some(source)).await;
        self.emit(NodeEvent::MessageReceived { message });
    }

    async fn fan_out(&mut self, message: &StreamMessage, stream: &StreamKey, except: Option<&str>) {
        for peer_id in self.streams.outbound(stream) {
            if Some(peer_id.as_str()) == except {
                continue;
            }
            match self.node_adapter.send_broadcast(&peer_id, message).await {
                Ok(()) => self.metrics.record("sendToNode"),
                Err(err) => {
                    debug!(peer = %peer_id, ?err, "failed to forward message");
                    if matches!(err, EndpointError::NotConnected(_)) {
                        self.streams.remove_outbound(stream, &peer_id);
                    }
                }
            }
        }
    }

    async fn on_subscribe_request(&mut self, stream: StreamKey, source: String) {
        if !self.streams.is_set_up(&stream) {
            debug!(stream = %stream, peer = %source, "subscribe request for unknown stream");
            return;
        }
        self.metrics.record("onSubscribeRequest");
        self.streams.add_inbound(&stream, &source);
        self.emit(NodeEvent::NodeSubscribed {
            peer_id: source,
            stream_key: stream,
        });
        self.send_status_to_all().await;
    }

    async fn on_unsubscribe_request(&mut self, stream: StreamKey, source: String) {
        self.metrics.record("onUnsubscribeRequest");
        self.streams.remove_neighbour(&stream, &source);
        self.emit(NodeEvent::NodeUnsubscribed {
            peer_id: source.clone(),
            stream_key: stream,
        });
        if self.connected.contains_key(&source) && !self.streams.has_shared_streams(&source) {
            self.schedule_disconnect_check(source);
        }
        self.send_status_to_all().await;
    }

    /// Converge towards the neighbour set a tracker instructed for one key.
    async fn on_instruction(
        &mut self,
        tracker_id: &str,
        stream: StreamKey,
        node_addresses: Vec<String>,
        counter: u64,
    ) {
        if !self.streams.is_set_up(&stream) {
            debug!(stream = %stream, "instruction for unknown stream, ignoring");
            return;
        }
        if counter < self.streams.counter(&stream) {
            self.metrics.record("onInstruction:stale");
            debug!(stream = %stream, counter, "stale instruction, ignoring");
            return;
        }
        self.streams.set_counter(&stream, counter);

        let own_url = self.endpoint.advertised_url().to_string();
        let target: HashSet<String> = node_addresses
            .into_iter()
            .filter(|address| address != &own_url)
            .collect();

        // Current outbound neighbours by address.
        let mut current: HashMap<String, String> = HashMap::new();
        for peer_id in self.streams.outbound(&stream) {
            if let Some((_, address)) = self.connected.get(&peer_id) {
                current.insert(address.clone(), peer_id);
            } else {
                self.streams.remove_outbound(&stream, &peer_id);
            }
        }

        // Neighbours the tracker no longer assigns us.
        for (address, peer_id) in &current {
            if target.contains(address) {
                continue;
            }
            if let Err(err) = self.node_adapter.send_unsubscribe(peer_id, &stream).await {
                debug!(peer = %peer_id, ?err, "failed to send unsubscribe");
            }
            self.streams.remove_outbound(&stream, peer_id);
            if !self.streams.has_shared_streams(peer_id) {
                self.schedule_disconnect_check(peer_id.clone());
            }
        }

        // Newly assigned neighbours: subscribe directly when connected,
        // connect first otherwise.
        for address in target {
            if current.contains_key(&address) {
                continue;
            }
            if let Some(peer_id) = self.peer_id_at(&address) {
                self.subscribe_to(&peer_id, &stream).await;
                continue;
            }
            let newly_pending = self
                .pending_subscriptions
                .entry(stream.clone())
                .or_default()
                .insert(address.clone());
            if !newly_pending {
                continue;
            }
            let endpoint = self.endpoint.clone();
            let actor_tx = self.actor_tx.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                let result = endpoint.connect(&address).await;
                let _ = actor_tx
                    .send(ToNodeActor::ConnectFinished {
                        stream,
                        address,
                        result,
                    })
                    .await;
            });
        }

        if self.converged(&stream) {
            self.send_status_to(tracker_id).await;
        }
    }

    async fn on_connect_finished(
        &mut self,
        stream: StreamKey,
        address: String,
        result: Result<String, EndpointError>,
    ) {
        let was_pending = self
            .pending_subscriptions
            .get_mut(&stream)
            .map(|pending| pending.remove(&address))
            .unwrap_or(false);

        match result {
            Ok(peer_id) | Err(EndpointError::Duplicate(peer_id)) => {
                if was_pending && self.streams.is_set_up(&stream) {
                    self.subscribe_to(&peer_id, &stream).await;
                } else if !self.streams.has_shared_streams(&peer_id) {
                    self.schedule_disconnect_check(peer_id);
                }
            }
            Err(err) => {
                warn!(%address, ?err, "failed to connect to instructed neighbour");
                self.metrics.record("connectFailed");
            }
        }

        if was_pending && self.converged(&stream) {
            self.send_status_to_all().await;
        }
    }

    async fn subscribe_to(&mut self, peer_id: &str, stream: &StreamKey) {
        match self.node_adapter.send_subscribe(peer_id, stream).await {
            Ok(()) => {
                self.streams.add_outbound(stream, peer_id);
            }
            Err(err) => {
                debug!(peer = %peer_id, stream = %stream, ?err, "failed to send subscribe");
            }
        }
    }

    /// Repeat subscribes towards a peer for keys it already serves us on;
    /// used after a reconnect or duplicate-socket replacement.
    async fn resubscribe_outbound(&mut self, peer_id: &str) {
        for stream in self.streams.keys() {
            if self.streams.outbound(&stream).contains(&peer_id.to_string()) {
                self.subscribe_to(peer_id, &stream).await;
            }
        }
    }

    fn converged(&self, stream: &StreamKey) -> bool {
        self.pending_subscriptions
            .get(stream)
            .map(|pending| pending.is_empty())
            .unwrap_or(true)
    }

    fn schedule_disconnect_check(&mut self, peer_id: String) {
        if !self.pending_disconnects.insert(peer_id.clone()) {
            return;
        }
        let actor_tx = self.actor_tx.clone();
        let wait = self.config.disconnection_wait_time;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(wait) => {
                    let _ = actor_tx
                        .send(ToNodeActor::CheckNoSharedStreams { peer_id })
                        .await;
                }
            }
        });
    }

    async fn on_check_no_shared_streams(&mut self, peer_id: String) {
        self.pending_disconnects.remove(&peer_id);
        if self.connected.contains_key(&peer_id) && !self.streams.has_shared_streams(&peer_id) {
            debug!(peer = %peer_id, "no shared streams remain, disconnecting");
            self.endpoint
                .close(&peer_id, disconnection_reasons::NO_SHARED_STREAMS)
                .await;
        }
    }

    fn serve_resend(&mut self, request: ResendRequest, source: String) {
        let stream = self.resend.handle_request(request.clone(), &source);
        let adapter = self.node_adapter.clone();
        tokio::spawn(forward_resend(adapter, stream, request, source));
    }

    async fn on_find_storage_nodes(
        &mut self,
        stream: StreamKey,
        reply: oneshot::Sender<Result<Vec<String>, NodeError>>,
    ) {
        let Some(tracker_id) = self.trackers.keys().next().cloned() else {
            let _ = reply.send(Err(NodeError::NoTracker));
            return;
        };
        if let Err(err) = self
            .tracker_adapter
            .send_storage_nodes_request(&tracker_id, &stream)
            .await
        {
            let _ = reply.send(Err(err.into()));
            return;
        }
        self.pending_storage_queries
            .entry(stream)
            .or_default()
            .push(reply);
    }

    async fn send_status_to_all(&mut self) {
        for tracker_id in self.trackers.keys().cloned().collect::<Vec<_>>() {
            self.send_status_to(&tracker_id).await;
        }
    }

    async fn send_status_to(&mut self, tracker_id: &str) {
        let status = Status {
            streams: self.streams.status(),
            rtts: self.endpoint.rtts().await,
        };
        if let Err(err) = self.tracker_adapter.send_status(tracker_id, &status).await {
            debug!(tracker = %tracker_id, ?err, "failed to send status");
            return;
        }
        self.metrics.record("sendStatus");
    }

    /// Keep dialing a tracker until it answers; backs off exponentially.
    fn spawn_tracker_connect(&self, tracker_url: String) {
        let endpoint = self.endpoint.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut backoff = TRACKER_RECONNECT_BASE;
            loop {
                let attempt = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    attempt = endpoint.connect(&tracker_url) => attempt,
                };
                match attempt {
                    Ok(_) | Err(EndpointError::Duplicate(_)) => return,
                    Err(EndpointError::Stopped) => return,
                    Err(err) => {
                        debug!(url = %tracker_url, ?err, "tracker connection failed, retrying");
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(TRACKER_RECONNECT_CAP);
                    }
                }
            }
        });
    }

    fn peer_id_at(&self, address: &str) -> Option<String> {
        self.connected
            .iter()
            .find(|(_, (_, peer_address))| peer_address == address)
            .map(|(peer_id, _)| peer_id.clone())
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Relay one resend answer back to its requester: a `Resending` marker on
/// the first message, a unicast per message, then the terminal marker.
async fn forward_resend(
    adapter: NodeToNode,
    mut stream: ResendStream,
    request: ResendRequest,
    source: String,
) {
    use streamr_protocol::ResendResponseKind;

    let mut sent_any = false;
    while let Some(message) = stream.next().await {
        if !sent_any {
            sent_any = true;
            if adapter
                .send_resend_response(
                    &source,
                    &request.request_id,
                    &request.stream_key,
                    ResendResponseKind::Resending,
                )
                .await
                .is_err()
            {
                stream.cancel();
                return;
            }
        }
        if adapter
            .send_unicast(&source, &request.request_id, message)
            .await
            .is_err()
        {
            stream.cancel();
            return;
        }
    }

    let kind = if sent_any {
        ResendResponseKind::Resent
    } else {
        ResendResponseKind::NoResend
    };
    let _ = adapter
        .send_resend_response(&source, &request.request_id, &request.stream_key, kind)
        .await;
}
