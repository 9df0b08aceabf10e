// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use streamr_protocol::{Status, StreamKey, TrackerControlMessage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::endpoint::{close_codes, disconnection_reasons, Endpoint, EndpointEvent};
use crate::metrics::Metrics;
use crate::peer::PeerInfo;
use crate::protocols::TrackerToNode;

use super::topology::OverlayTopology;
use super::TopologySnapshot;

#[derive(Debug)]
pub(crate) enum ToTrackerActor {
    GetTopology {
        reply: oneshot::Sender<TopologySnapshot>,
    },
    Metrics {
        reply: oneshot::Sender<std::collections::BTreeMap<String, u64>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Owns the per-stream overlays and reacts to node statuses.
pub(crate) struct TrackerActor {
    endpoint: Endpoint,
    endpoint_events: mpsc::UnboundedReceiver<EndpointEvent>,
    inbox: mpsc::Receiver<ToTrackerActor>,
    adapter: TrackerToNode,
    max_neighbours: usize,
    overlays: HashMap<StreamKey, OverlayTopology>,
    /// Per-key instruction counters; survive overlay teardown so counters
    /// stay strictly increasing for every key.
    counters: HashMap<StreamKey, u64>,
    /// Connected node and storage peers with their advertised addresses.
    connected: HashMap<String, (PeerInfo, String)>,
    metrics: Metrics,
}

impl TrackerActor {
    pub(crate) fn new(
        endpoint: Endpoint,
        endpoint_events: mpsc::UnboundedReceiver<EndpointEvent>,
        inbox: mpsc::Receiver<ToTrackerActor>,
        max_neighbours: usize,
    ) -> Self {
        let adapter = TrackerToNode::new(endpoint.clone());
        Self {
            endpoint,
            endpoint_events,
            inbox,
            adapter,
            max_neighbours,
            overlays: HashMap::new(),
            counters: HashMap::new(),
            connected: HashMap::new(),
            metrics: Metrics::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        ToTrackerActor::GetTopology { reply } => {
                            let _ = reply.send(self.topology_snapshot());
                        }
                        ToTrackerActor::Metrics { reply } => {
                            let _ = reply.send(self.metrics.report());
                        }
                        ToTrackerActor::Shutdown { reply } => {
                            self.endpoint.stop().await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
                event = self.endpoint_events.recv() => {
                    let Some(event) = event else { break };
                    self.on_endpoint_event(event).await;
                }
            }
        }
        debug!("tracker actor stopped");
    }

    async fn on_endpoint_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::PeerConnected { peer, address } => {
                if peer.is_tracker() {
                    debug!(peer = %peer, "ignoring tracker-to-tracker connection");
                    return;
                }
                self.connected
                    .insert(peer.peer_id.clone(), (peer, address));
            }
            EndpointEvent::PeerDisconnected { peer, reason, .. } => {
                debug!(peer = %peer, %reason, "node disconnected");
                self.connected.remove(&peer.peer_id);
                self.on_node_disconnected(&peer.peer_id).await;
            }
            EndpointEvent::MessageReceived { peer, payload } => {
                match TrackerToNode::decode(&payload) {
                    Ok(message) => self.on_message(peer, message).await,
                    Err(err) => {
                        warn!(peer = %peer, ?err, "closing connection on protocol error");
                        self.metrics.record("protocolError");
                        self.endpoint
                            .close_with_code(
                                &peer.peer_id,
                                close_codes::PROTOCOL_ERROR,
                                disconnection_reasons::BAD_PROTOCOL_MESSAGE,
                            )
                            .await;
                    }
                }
            }
            EndpointEvent::HighBackPressure { .. } | EndpointEvent::LowBackPressure { .. } => {}
        }
    }

    async fn on_message(&mut self, peer: PeerInfo, message: TrackerControlMessage) {
        match message {
            TrackerControlMessage::Status { status } => {
                self.metrics.record("onStatus");
                self.on_status(&peer.peer_id, status).await;
            }
            TrackerControlMessage::StorageNodesRequest { stream_key } => {
                self.metrics.record("onStorageNodesRequest");
                self.on_storage_nodes_request(&peer.peer_id, stream_key)
                    .await;
            }
            other => {
                debug!(peer = %peer, ?other, "unexpected control message from node");
            }
        }
    }

    /// Reconcile one node report: register the node under every reported
    /// key, drop it from keys it stopped reporting, top its neighbour sets
    /// up and instruct every node whose neighbour set changed.
    async fn on_status(&mut self, node_id: &str, status: Status) {
        let mut reported: HashMap<StreamKey, HashSet<String>> = HashMap::new();
        for (key, stream_status) in status.streams {
            match StreamKey::from_str(&key) {
                Ok(stream) => {
                    reported.insert(stream, stream_status.outbound.into_iter().collect());
                }
                Err(err) => warn!(%node_id, ?err, "skipping malformed stream key in status"),
            }
        }

        let mut instructions: BTreeSet<(StreamKey, String)> = BTreeSet::new();

        // Keys the node no longer reports: it unsubscribed.
        let mut emptied = Vec::new();
        for (stream, overlay) in self.overlays.iter_mut() {
            if overlay.contains(node_id) && !reported.contains_key(stream) {
                for affected in overlay.remove_node(node_id) {
                    instructions.insert((stream.clone(), affected));
                }
                if overlay.is_empty() {
                    emptied.push(stream.clone());
                }
            }
        }
        for stream in emptied {
            self.overlays.remove(&stream);
        }

        let max_neighbours = self.max_neighbours;
        for (stream, outbound) in reported {
            let overlay = self
                .overlays
                .entry(stream.clone())
                .or_insert_with(|| OverlayTopology::new(max_neighbours));
            let newly_joined = !overlay.contains(node_id);

            for changed in overlay.update(node_id, &outbound) {
                instructions.insert((stream.clone(), changed));
            }
            for changed in overlay.fill_neighbours(node_id) {
                instructions.insert((stream.clone(), changed));
            }
            if newly_joined {
                instructions.insert((stream.clone(), node_id.to_string()));
            }
        }

        for (stream, target) in instructions {
            self.send_instruction(&stream, &target).await;
        }
    }

    /// Remove a vanished node and its incident edges, instructing the
    /// former neighbours of the shrinkage. Replacement neighbours are
    /// assigned later through the normal status round-trip, once the
    /// affected nodes report their changed sets.
    async fn on_node_disconnected(&mut self, node_id: &str) {
        let mut instructions: BTreeSet<(StreamKey, String)> = BTreeSet::new();
        let mut emptied = Vec::new();
        for (stream, overlay) in self.overlays.iter_mut() {
            if !overlay.contains(node_id) {
                continue;
            }
            for affected in overlay.remove_node(node_id) {
                instructions.insert((stream.clone(), affected));
            }
            if overlay.is_empty() {
                emptied.push(stream.clone());
            }
        }
        for stream in emptied {
            self.overlays.remove(&stream);
        }
        for (stream, target) in instructions {
            self.send_instruction(&stream, &target).await;
        }
    }

    async fn send_instruction(&mut self, stream: &StreamKey, node_id: &str) {
        let Some(overlay) = self.overlays.get(stream) else {
            return;
        };
        if !overlay.contains(node_id) || !self.connected.contains_key(node_id) {
            return;
        }
        let addresses: Vec<String> = overlay
            .neighbours(node_id)
            .iter()
            .filter_map(|neighbour| {
                self.connected
                    .get(neighbour)
                    .map(|(_, address)| address.clone())
            })
            .collect();
        let counter = {
            let counter = self.counters.entry(stream.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        debug!(node = %node_id, stream = %stream, counter, ?addresses, "sending instruction");
        if let Err(err) = self
            .adapter
            .send_instruction(node_id, stream, addresses, counter)
            .await
        {
            debug!(node = %node_id, ?err, "failed to send instruction");
            return;
        }
        self.metrics.record("instructionsSent");
    }

    async fn on_storage_nodes_request(&mut self, source: &str, stream: StreamKey) {
        let storage_addresses: Vec<String> = self
            .overlays
            .get(&stream)
            .map(|overlay| {
                overlay
                    .node_ids()
                    .iter()
                    .filter_map(|node_id| match self.connected.get(node_id) {
                        Some((peer, address)) if peer.is_storage() => Some(address.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Err(err) = self
            .adapter
            .send_storage_nodes_response(source, &stream, storage_addresses)
            .await
        {
            debug!(node = %source, ?err, "failed to send storage nodes response");
        }
    }

    fn topology_snapshot(&self) -> TopologySnapshot {
        self.overlays
            .iter()
            .map(|(stream, overlay)| (stream.to_string(), overlay.snapshot()))
            .collect()
    }
}
