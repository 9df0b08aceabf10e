// SPDX-License-Identifier: MIT OR Apache-2.0

//! The tracker: topology coordinator of the network.
//!
//! Nodes report their per-stream neighbour sets; the tracker maintains one
//! overlay graph per stream key and answers every report with instructions
//! that tell the affected nodes which peers to hold as forwarding
//! neighbours.

mod actor;
pub mod topology;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::endpoint::{Endpoint, EndpointConfig, EndpointError, TlsConfig, DEFAULT_PING_INTERVAL};
use crate::peer::PeerInfo;

use actor::{ToTrackerActor, TrackerActor};

pub use topology::OverlayTopology;

/// Default forwarding fan-out per node and stream.
pub const DEFAULT_MAX_NEIGHBOURS: usize = 4;

/// `{stream key → {node id → [neighbour ids]}}`, in overlay insertion order.
pub type TopologySnapshot = HashMap<String, HashMap<String, Vec<String>>>;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker is not running")]
    Stopped,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub advertised_ws_url: Option<String>,
    pub ping_interval: Duration,
    pub max_neighbours: usize,
    pub tls: Option<TlsConfig>,
}

impl TrackerConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            advertised_ws_url: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_neighbours: DEFAULT_MAX_NEIGHBOURS,
            tls: None,
        }
    }

    pub fn with_advertised_ws_url(mut self, url: impl Into<String>) -> Self {
        self.advertised_ws_url = Some(url.into());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_neighbours(mut self, max_neighbours: usize) -> Self {
        self.max_neighbours = max_neighbours;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Handle to a running tracker.
#[derive(Clone, Debug)]
pub struct Tracker {
    actor_tx: mpsc::Sender<ToTrackerActor>,
    peer_info: PeerInfo,
    advertised_url: String,
}

impl Tracker {
    /// Bind the tracker endpoint and spawn the actor.
    pub async fn start(config: TrackerConfig) -> Result<Tracker, TrackerError> {
        let peer_info = PeerInfo::tracker(&config.id);
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
        let actor = TrackerActor::new(endpoint, endpoint_events, inbox, config.max_neighbours);
        tokio::spawn(actor.run());

        Ok(Tracker {
            actor_tx,
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

    /// Point-in-time view of every overlay.
    pub async fn get_topology(&self) -> Result<TopologySnapshot, TrackerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToTrackerActor::GetTopology { reply })
            .await
            .map_err(|_| TrackerError::Stopped)?;
        reply_rx.await.map_err(|_| TrackerError::Stopped)
    }

    pub async fn metrics(&self) -> Result<BTreeMap<String, u64>, TrackerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToTrackerActor::Metrics { reply })
            .await
            .map_err(|_| TrackerError::Stopped)?;
        reply_rx.await.map_err(|_| TrackerError::Stopped)
    }

    /// Stop the tracker, closing every node connection gracefully.
    pub async fn shutdown(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .actor_tx
            .send(ToTrackerActor::Shutdown { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }
}
