// SPDX-License-Identifier: MIT OR Apache-2.0

//! The network node.
//!
//! A node subscribes to stream keys, reports its neighbour sets to the
//! configured trackers, follows their instructions by opening and closing
//! peer connections, forwards published messages across the overlay without
//! duplicates and serves historical-message requests through the resend
//! pipeline.

mod actor;
mod streams;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use streamr_protocol::{ResendResponseKind, StreamKey, StreamMessage};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::endpoint::{Endpoint, EndpointConfig, EndpointError, TlsConfig, DEFAULT_PING_INTERVAL};
use crate::peer::{PeerInfo, PeerType};
use crate::resend::{MessageStore, ResendStrategy, DEFAULT_MAX_INACTIVITY_PERIOD};

use actor::{NodeActor, ToNodeActor};

/// Default grace before a peer with no shared streams is disconnected.
pub const DEFAULT_DISCONNECTION_WAIT_TIME: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is not running")]
    Stopped,

    #[error("no tracker connection available")]
    NoTracker,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Everything a node reports to the embedding application.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A fresh message was delivered locally (after dedup).
    MessageReceived { message: StreamMessage },
    /// A historical message arrived in response to a resend request.
    UnicastReceived {
        request_id: String,
        message: StreamMessage,
    },
    /// A resend exchange progressed or terminated.
    ResendResponseReceived {
        request_id: String,
        stream_key: StreamKey,
        kind: ResendResponseKind,
    },
    NodeSubscribed {
        peer_id: String,
        stream_key: StreamKey,
    },
    NodeUnsubscribed {
        peer_id: String,
        stream_key: StreamKey,
    },
    NodeConnected {
        peer_id: String,
        address: String,
    },
    NodeDisconnected {
        peer_id: String,
        address: String,
    },
    TrackerConnected {
        tracker_id: String,
    },
    TrackerDisconnected {
        tracker_id: String,
    },
}

#[derive(Clone)]
pub struct NodeConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub peer_type: PeerType,
    pub trackers: Vec<String>,
    pub advertised_ws_url: Option<String>,
    pub ping_interval: Duration,
    pub disconnection_wait_time: Duration,
    pub max_inactivity_period: Duration,
    pub resend_strategies: Vec<Arc<dyn ResendStrategy>>,
    pub message_store: Option<Arc<dyn MessageStore>>,
    pub tls: Option<TlsConfig>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            peer_type: PeerType::Node,
            trackers: Vec::new(),
            advertised_ws_url: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            disconnection_wait_time: DEFAULT_DISCONNECTION_WAIT_TIME,
            max_inactivity_period: DEFAULT_MAX_INACTIVITY_PERIOD,
            resend_strategies: Vec::new(),
            message_store: None,
            tls: None,
        }
    }

    pub fn with_trackers(mut self, trackers: Vec<String>) -> Self {
        self.trackers = trackers;
        self
    }

    pub fn with_advertised_ws_url(mut self, url: impl Into<String>) -> Self {
        self.advertised_ws_url = Some(url.into());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_disconnection_wait_time(mut self, wait: Duration) -> Self {
        self.disconnection_wait_time = wait;
        self
    }

    pub fn with_max_inactivity_period(mut self, period: Duration) -> Self {
        self.max_inactivity_period = period;
        self
    }

    pub fn with_resend_strategy(mut self, strategy: Arc<dyn ResendStrategy>) -> Self {
        self.resend_strategies.push(strategy);
        self
    }

    /// Attach a message store; the node records every delivered message in
    /// it and advertises itself as a storage peer.
    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self.peer_type = PeerType::Storage;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Handle to a running node.
#[derive(Clone)]
pub struct Node {
    actor_tx: mpsc::Sender<ToNodeActor>,
    events_tx: broadcast::Sender<NodeEvent>,
    peer_info: PeerInfo,
    advertised_url: String,
}

impl Node {
    /// Bind the node endpoint, spawn the engine actor and begin connecting
    /// to the configured trackers.
    pub async fn start(config: NodeConfig) -> Result<Node, NodeError> {
        let peer_info = PeerInfo::new(&config.id, config.peer_type);
        let mut endpoint_config = EndpointConfig::new(peer_info.clone(), &config.host, config.port)
            .with_ping_interval(config.ping_interval);
        if let Some(url) = &config.advertised_ws_url {
            endpoint_config = endpoint_config.with_advertised_ws_url(url);
        }
        if let Some(tls) = &config.tls {
            endpoint_config = endpoint_config.with_tls(tls.clone());
        }
        let (endpoint, endpoint_events) = Endpoint::start(endpoint_config).await?;
        let advertised_url = endpoint.advertised_url().to_string();

        let (actor_tx, inbox) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(256);
        let actor = NodeActor::new(
            config,
            endpoint,
            endpoint_events,
            inbox,
            actor_tx.clone(),
            events_tx.clone(),
        );
        tokio::spawn(actor.run());

        Ok(Node {
            actor_tx,
            events_tx,
            peer_info,
            advertised_url,
        })
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn advertised_url(&self) -> &str {
        &self.advertised_url
    }

    /// Subscribe to the node's event feed.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events_tx.subscribe()
    }

    /// Start carrying a stream key and announce it to the trackers.
    /// Idempotent.
    pub async fn subscribe(&self, stream_id: &str, partition: u32) -> Result<(), NodeError> {
        self.command(|reply| ToNodeActor::Subscribe {
            stream: StreamKey::new(stream_id, partition),
            reply,
        })
        .await
    }

    /// Stop carrying a stream key; notifies neighbours and trackers. A no-op
    /// for unknown keys.
    pub async fn unsubscribe(&self, stream_id: &str, partition: u32) -> Result<(), NodeError> {
        self.command(|reply| ToNodeActor::Unsubscribe {
            stream: StreamKey::new(stream_id, partition),
            reply,
        })
        .await
    }

    /// Publish a message into its stream's overlay.
    pub async fn publish(&self, message: StreamMessage) -> Result<(), NodeError> {
        self.command(|reply| ToNodeActor::Publish { message, reply })
            .await
    }

    /// Ask a tracker which storage peers carry a stream key.
    pub async fn find_storage_nodes(
        &self,
        stream_id: &str,
        partition: u32,
    ) -> Result<Vec<String>, NodeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToNodeActor::FindStorageNodes {
                stream: StreamKey::new(stream_id, partition),
                reply,
            })
            .await
            .map_err(|_| NodeError::Stopped)?;
        reply_rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn metrics(&self) -> Result<BTreeMap<String, u64>, NodeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToNodeActor::Metrics { reply })
            .await
            .map_err(|_| NodeError::Stopped)?;
        reply_rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Stop the node, closing every connection gracefully.
    pub async fn shutdown(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .actor_tx
            .send(ToNodeActor::Shutdown { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    async fn command<F>(&self, make: F) -> Result<(), NodeError>
    where
        F: FnOnce(oneshot::Sender<Result<(), NodeError>>) -> ToNodeActor,
    {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(make(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        reply_rx.await.map_err(|_| NodeError::Stopped)?
    }
}
