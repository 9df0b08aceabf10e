// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bidirectional WebSocket transport.
//!
//! The endpoint accepts inbound and opens outbound connections, enforces one
//! socket per peer, measures liveness with application-level pings and
//! signals back pressure over its send queues. Nodes and trackers own
//! exactly one endpoint each and talk to it through the [`Endpoint`] handle;
//! everything the transport observes comes back as [`EndpointEvent`]s.

mod actor;
mod connection;
mod handshake;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use crate::peer::{PeerError, PeerInfo};

use actor::{run_listener, EndpointActor, ToEndpointActor};

pub use handshake::{ADDRESS_QUERY_PARAM, PEER_ID_HEADER, PEER_TYPE_HEADER};

/// Queued bytes above which a connection reports high back pressure.
pub const HIGH_BACK_PRESSURE: usize = 2 * 1024 * 1024;

/// Queued bytes below which a high-pressure connection recovers.
pub const LOW_BACK_PRESSURE: usize = 1024 * 1024;

/// Hard cap on queued bytes; a connection exceeding it is terminated.
pub const MAX_BUFFERED_BYTES: usize = HIGH_BACK_PRESSURE + 1024 * 1024;

/// Largest accepted WebSocket payload.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default liveness ping cadence.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
}

pub mod disconnection_reasons {
    pub const GRACEFUL_SHUTDOWN: &str = "streamr:node:graceful-shutdown";
    pub const NO_SHARED_STREAMS: &str = "streamr:node:no-shared-streams";
    pub const DUPLICATE_SOCKET: &str = "streamr:endpoint:duplicate-connection";
    pub const MISSING_REQUIRED_PARAMETER: &str = "streamr:node:missing-required-parameter";
    pub const DEAD_CONNECTION: &str = "streamr:endpoint:dead-connection";
    pub const BAD_PROTOCOL_MESSAGE: &str = "streamr:node:bad-protocol-message";
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_PAYLOAD_BYTES),
        max_frame_size: Some(MAX_PAYLOAD_BYTES),
        ..Default::default()
    }
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("not connected to peer {0}")]
    NotConnected(String),

    #[error("send to peer {peer_id} failed: {reason}")]
    SendFailed { peer_id: String, reason: String },

    #[error("handshake with {0} did not supply peer headers")]
    HeadersMissing(String),

    #[error("refusing connection to own address {0}")]
    OwnAddress(String),

    #[error("an existing connection to peer {0} is preferred")]
    Duplicate(String),

    #[error("endpoint is stopped")]
    Stopped,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Everything the transport reports to its owner.
#[derive(Clone, Debug)]
pub enum EndpointEvent {
    PeerConnected {
        peer: PeerInfo,
        address: String,
    },
    PeerDisconnected {
        peer: PeerInfo,
        address: String,
        reason: String,
    },
    MessageReceived {
        peer: PeerInfo,
        payload: Vec<u8>,
    },
    HighBackPressure {
        peer: PeerInfo,
    },
    LowBackPressure {
        peer: PeerInfo,
    },
}

/// TLS key material for `wss` listeners, in PKCS#8 PEM form.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub peer_info: PeerInfo,
    pub host: String,
    pub port: u16,
    /// Override for NAT setups where the bind address is not reachable.
    pub advertised_ws_url: Option<String>,
    pub ping_interval: Duration,
    pub tls: Option<TlsConfig>,
}

impl EndpointConfig {
    pub fn new(peer_info: PeerInfo, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_info,
            host: host.into(),
            port,
            advertised_ws_url: None,
            ping_interval: DEFAULT_PING_INTERVAL,
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

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    fn advertised_url(&self) -> String {
        match &self.advertised_ws_url {
            Some(url) => url.clone(),
            None => {
                let scheme = if self.tls.is_some() { "wss" } else { "ws" };
                format!("{}://{}:{}", scheme, self.host, self.port)
            }
        }
    }
}

/// Handle to a running endpoint. Cheap to clone; all clones address the same
/// actor.
#[derive(Clone, Debug)]
pub struct Endpoint {
    actor_tx: mpsc::Sender<ToEndpointActor>,
    peer_info: PeerInfo,
    advertised_url: String,
}

impl Endpoint {
    /// Bind the listener and spawn the endpoint actor.
    ///
    /// The returned receiver is the single event feed for the owner; dropping
    /// it discards events but does not stop the endpoint.
    pub async fn start(
        config: EndpointConfig,
    ) -> Result<(Endpoint, mpsc::UnboundedReceiver<EndpointEvent>), EndpointError> {
        // Identity material must survive a trip through HTTP headers.
        handshake::header_value(&config.peer_info.peer_id)?;

        let advertised_url = config.advertised_url();
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|err| {
                EndpointError::Transport(format!(
                    "failed to bind {}:{}: {err}",
                    config.host, config.port
                ))
            })?;
        let tls = match &config.tls {
            Some(tls) => Some(load_tls_acceptor(tls).await?),
            None => None,
        };

        let (actor_tx, inbox) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let listener_token = CancellationToken::new();

        tokio::spawn(run_listener(
            listener,
            tls,
            actor_tx.clone(),
            config.peer_info.clone(),
            listener_token.clone(),
        ));
        let actor = EndpointActor::new(
            config.peer_info.clone(),
            advertised_url.clone(),
            config.ping_interval,
            inbox,
            actor_tx.clone(),
            events_tx,
            listener_token,
        );
        tokio::spawn(actor.run());

        let endpoint = Endpoint {
            actor_tx,
            peer_info: config.peer_info,
            advertised_url,
        };
        Ok((endpoint, events_rx))
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn advertised_url(&self) -> &str {
        &self.advertised_url
    }

    /// Open an outbound connection and return the remote peer id.
    pub async fn connect(&self, peer_url: &str) -> Result<String, EndpointError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToEndpointActor::Connect {
                peer_url: peer_url.to_string(),
                reply,
            })
            .await
            .map_err(|_| EndpointError::Stopped)?;
        reply_rx.await.map_err(|_| EndpointError::Stopped)?
    }

    /// Queue a frame to a connected peer.
    pub async fn send(&self, peer_id: &str, frame: Vec<u8>) -> Result<String, EndpointError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToEndpointActor::Send {
                peer_id: peer_id.to_string(),
                frame,
                reply,
            })
            .await
            .map_err(|_| EndpointError::Stopped)?;
        reply_rx.await.map_err(|_| EndpointError::Stopped)?
    }

    /// Close a connection with a normal close code, swallowing transport
    /// errors.
    pub async fn close(&self, peer_id: &str, reason: &str) {
        self.close_with_code(peer_id, close_codes::NORMAL, reason)
            .await;
    }

    pub(crate) async fn close_with_code(&self, peer_id: &str, code: u16, reason: &str) {
        let _ = self
            .actor_tx
            .send(ToEndpointActor::Close {
                peer_id: peer_id.to_string(),
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Current round-trip estimates in milliseconds, per connected peer.
    pub async fn rtts(&self) -> HashMap<String, u64> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .actor_tx
            .send(ToEndpointActor::Rtts { reply })
            .await
            .is_err()
        {
            return HashMap::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Close every connection gracefully and stop listening.
    pub async fn stop(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .actor_tx
            .send(ToEndpointActor::Stop { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }
}

async fn load_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, EndpointError> {
    let cert = tokio::fs::read(&config.cert_path)
        .await
        .map_err(|err| EndpointError::Transport(format!("failed to read tls cert: {err}")))?;
    let key = tokio::fs::read(&config.key_path)
        .await
        .map_err(|err| EndpointError::Transport(format!("failed to read tls key: {err}")))?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|err| EndpointError::Transport(format!("failed to load tls identity: {err}")))?;
    let acceptor = native_tls::TlsAcceptor::new(identity)
        .map_err(|err| EndpointError::Transport(format!("failed to build tls acceptor: {err}")))?;
    Ok(TlsAcceptor::from(acceptor))
}
