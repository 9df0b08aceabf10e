// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async_with_config, connect_async_with_config, MaybeTlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::peer::{PeerBook, PeerInfo};

use super::connection::{Connection, Direction, WriterCommand, WsStream};
use super::handshake::{self, HandshakeSlot, IncomingHandshake};
use super::{
    close_codes, disconnection_reasons, ws_config, EndpointError, EndpointEvent,
    HIGH_BACK_PRESSURE, LOW_BACK_PRESSURE, MAX_BUFFERED_BYTES,
};

/// Time allowed for close frames to flush during `stop()`.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(crate) enum ToEndpointActor {
    Connect {
        peer_url: String,
        reply: oneshot::Sender<Result<String, EndpointError>>,
    },
    Send {
        peer_id: String,
        frame: Vec<u8>,
        reply: oneshot::Sender<Result<String, EndpointError>>,
    },
    Close {
        peer_id: String,
        code: u16,
        reason: String,
    },
    Rtts {
        reply: oneshot::Sender<HashMap<String, u64>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Incoming {
        stream: Box<WsStream>,
        remote: PeerInfo,
        address: String,
    },
    OutboundEstablished {
        stream: Box<WsStream>,
        remote: PeerInfo,
        address: String,
        reply: oneshot::Sender<Result<String, EndpointError>>,
    },
    FrameReceived {
        peer_id: String,
        conn_id: u64,
        payload: Vec<u8>,
    },
    PongReceived {
        peer_id: String,
        conn_id: u64,
    },
    Drained {
        peer_id: String,
        conn_id: u64,
    },
    Closed {
        peer_id: String,
        conn_id: u64,
        reason: String,
    },
    TransportFailed {
        peer_id: String,
        conn_id: u64,
        error: String,
    },
}

/// Sole owner of the connection map; everything else talks to it through
/// commands and events.
pub(crate) struct EndpointActor {
    own_info: PeerInfo,
    advertised_url: String,
    ping_interval: Duration,
    inbox: mpsc::Receiver<ToEndpointActor>,
    actor_tx: mpsc::Sender<ToEndpointActor>,
    events_tx: mpsc::UnboundedSender<EndpointEvent>,
    connections: HashMap<String, Connection>,
    peer_book: PeerBook,
    next_conn_id: u64,
    stopped: bool,
    listener_token: CancellationToken,
}

impl EndpointActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        own_info: PeerInfo,
        advertised_url: String,
        ping_interval: Duration,
        inbox: mpsc::Receiver<ToEndpointActor>,
        actor_tx: mpsc::Sender<ToEndpointActor>,
        events_tx: mpsc::UnboundedSender<EndpointEvent>,
        listener_token: CancellationToken,
    ) -> Self {
        Self {
            own_info,
            advertised_url,
            ping_interval,
            inbox,
            actor_tx,
            events_tx,
            connections: HashMap::new(),
            peer_book: PeerBook::new(),
            next_conn_id: 0,
            stopped: false,
            listener_token,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ping_timer = interval(self.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ping_timer.tick() => self.on_ping_tick(),
                message = self.inbox.recv() => {
                    let Some(message) = message else { break };
                    if self.on_message(message).await {
                        break;
                    }
                }
            }
        }
        debug!(endpoint = %self.own_info, "endpoint actor stopped");
    }

    /// Returns true when the actor should shut down.
    async fn on_message(&mut self, message: ToEndpointActor) -> bool {
        match message {
            ToEndpointActor::Connect { peer_url, reply } => self.on_connect(peer_url, reply),
            ToEndpointActor::Send {
                peer_id,
                frame,
                reply,
            } => self.on_send(peer_id, frame, reply),
            ToEndpointActor::Close {
                peer_id,
                code,
                reason,
            } => self.on_close(&peer_id, code, &reason),
            ToEndpointActor::Rtts { reply } => {
                let rtts = self
                    .connections
                    .iter()
                    .filter_map(|(peer_id, connection)| {
                        connection
                            .rtt
                            .map(|rtt| (peer_id.clone(), rtt.as_millis() as u64))
                    })
                    .collect();
                let _ = reply.send(rtts);
            }
            ToEndpointActor::Incoming {
                stream,
                remote,
                address,
            } => self.admit(*stream, remote, address, Direction::Inbound, None),
            ToEndpointActor::OutboundEstablished {
                stream,
                remote,
                address,
                reply,
            } => self.admit(*stream, remote, address, Direction::Outbound, Some(reply)),
            ToEndpointActor::FrameReceived {
                peer_id,
                conn_id,
                payload,
            } => {
                if let Some(connection) = self.current(&peer_id, conn_id) {
                    let peer = connection.peer_info.clone();
                    self.emit(EndpointEvent::MessageReceived { peer, payload });
                }
            }
            ToEndpointActor::PongReceived { peer_id, conn_id } => {
                if let Some(connection) = self.current_mut(&peer_id, conn_id) {
                    connection.awaiting_pong = false;
                    if let Some(start) = connection.rtt_start.take() {
                        connection.rtt = Some(start.elapsed());
                    }
                }
            }
            ToEndpointActor::Drained { peer_id, conn_id } => self.on_drained(&peer_id, conn_id),
            ToEndpointActor::Closed {
                peer_id,
                conn_id,
                reason,
            } => self.on_closed(&peer_id, conn_id, reason),
            ToEndpointActor::TransportFailed {
                peer_id,
                conn_id,
                error,
            } => self.on_closed(&peer_id, conn_id, error),
            ToEndpointActor::Stop { reply } => {
                self.on_stop().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn on_connect(
        &mut self,
        peer_url: String,
        reply: oneshot::Sender<Result<String, EndpointError>>,
    ) {
        if self.stopped {
            let _ = reply.send(Err(EndpointError::Stopped));
            return;
        }
        if peer_url == self.advertised_url {
            let _ = reply.send(Err(EndpointError::OwnAddress(peer_url)));
            return;
        }
        if let Ok(peer_id) = self.peer_book.peer_id(&peer_url) {
            if self.connections.contains_key(peer_id) {
                let _ = reply.send(Ok(peer_id.to_string()));
                return;
            }
        }

        let own_url = self.advertised_url.clone();
        let own_info = self.own_info.clone();
        let actor_tx = self.actor_tx.clone();
        tokio::spawn(async move {
            match dial(&peer_url, &own_url, &own_info).await {
                Ok((stream, remote)) => {
                    let established = ToEndpointActor::OutboundEstablished {
                        stream: Box::new(stream),
                        remote,
                        address: peer_url,
                        reply,
                    };
                    if let Err(rejected) = actor_tx.send(established).await {
                        if let ToEndpointActor::OutboundEstablished { reply, .. } = rejected.0 {
                            let _ = reply.send(Err(EndpointError::Stopped));
                        }
                    }
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            }
        });
    }

    fn on_send(
        &mut self,
        peer_id: String,
        frame: Vec<u8>,
        reply: oneshot::Sender<Result<String, EndpointError>>,
    ) {
        if self.peer_book.address(&peer_id).is_err() || !self.connections.contains_key(&peer_id) {
            let _ = reply.send(Err(EndpointError::NotConnected(peer_id)));
            return;
        }

        let mut high_event = None;
        let mut failure = None;
        if let Some(connection) = self.connections.get_mut(&peer_id) {
            match connection.enqueue_frame(frame) {
                Ok(buffered) if buffered > MAX_BUFFERED_BYTES => {
                    failure = Some("outgoing buffer limit exceeded");
                }
                Ok(buffered) => {
                    if buffered > HIGH_BACK_PRESSURE && !connection.high_back_pressure {
                        connection.high_back_pressure = true;
                        high_event = Some(EndpointEvent::HighBackPressure {
                            peer: connection.peer_info.clone(),
                        });
                    }
                }
                Err(()) => failure = Some("writer task gone"),
            }
        }

        if let Some(reason) = failure {
            self.on_close(
                &peer_id,
                close_codes::PROTOCOL_ERROR,
                disconnection_reasons::DEAD_CONNECTION,
            );
            let _ = reply.send(Err(EndpointError::SendFailed {
                peer_id,
                reason: reason.to_string(),
            }));
            return;
        }
        if let Some(event) = high_event {
            self.emit(event);
        }
        let _ = reply.send(Ok(peer_id));
    }

    /// Deliberate local close; cleans up immediately and reports the reason.
    fn on_close(&mut self, peer_id: &str, code: u16, reason: &str) {
        if let Some(connection) = self.connections.remove(peer_id) {
            connection.close(code, reason);
            connection.abort_reader();
            self.emit(EndpointEvent::PeerDisconnected {
                peer: connection.peer_info,
                address: connection.address,
                reason: reason.to_string(),
            });
        }
    }

    fn on_drained(&mut self, peer_id: &str, conn_id: u64) {
        let mut low_event = None;
        if let Some(connection) = self.current_mut(peer_id, conn_id) {
            if connection.high_back_pressure
                && connection.buffered.load(Ordering::Relaxed) < LOW_BACK_PRESSURE
            {
                connection.high_back_pressure = false;
                low_event = Some(EndpointEvent::LowBackPressure {
                    peer: connection.peer_info.clone(),
                });
            }
        }
        if let Some(event) = low_event {
            self.emit(event);
        }
    }

    /// Remote close or transport failure.
    fn on_closed(&mut self, peer_id: &str, conn_id: u64, reason: String) {
        let is_current = self
            .connections
            .get(peer_id)
            .map(|connection| connection.conn_id == conn_id)
            .unwrap_or(false);
        if !is_current {
            // A socket we already replaced or dropped.
            return;
        }
        if reason == disconnection_reasons::DUPLICATE_SOCKET {
            // The remote lost us in a tiebreak; its winning socket is already
            // live or about to be admitted, so this is not a disconnect.
            debug!(peer = %peer_id, "duplicate-socket close ignored");
            self.connections.remove(peer_id);
            return;
        }
        if let Some(connection) = self.connections.remove(peer_id) {
            connection.abort_reader();
            self.emit(EndpointEvent::PeerDisconnected {
                peer: connection.peer_info,
                address: connection.address,
                reason,
            });
        }
    }

    fn on_ping_tick(&mut self) {
        let mut dead = Vec::new();
        for (peer_id, connection) in self.connections.iter_mut() {
            if connection.awaiting_pong {
                dead.push(peer_id.clone());
                continue;
            }
            connection.awaiting_pong = true;
            connection.rtt_start = Some(Instant::now());
            let _ = connection.writer_tx.send(WriterCommand::Ping(Vec::new()));
        }
        for peer_id in dead {
            warn!(peer = %peer_id, "ping went unanswered, terminating connection");
            self.on_close(
                &peer_id,
                close_codes::PROTOCOL_ERROR,
                disconnection_reasons::DEAD_CONNECTION,
            );
        }
    }

    async fn on_stop(&mut self) {
        self.stopped = true;
        self.listener_token.cancel();
        for (_, connection) in self.connections.drain() {
            connection.close(
                close_codes::NORMAL,
                disconnection_reasons::GRACEFUL_SHUTDOWN,
            );
            connection.abort_reader();
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }

    /// Admit a freshly opened socket, applying own-address and duplicate
    /// checks. `reply` is present for outbound dials.
    fn admit(
        &mut self,
        stream: WsStream,
        remote: PeerInfo,
        address: String,
        direction: Direction,
        reply: Option<oneshot::Sender<Result<String, EndpointError>>>,
    ) {
        if self.stopped {
            spawn_close(
                stream,
                close_codes::NORMAL,
                disconnection_reasons::GRACEFUL_SHUTDOWN,
            );
            if let Some(reply) = reply {
                let _ = reply.send(Err(EndpointError::Stopped));
            }
            return;
        }
        if address == self.advertised_url {
            spawn_close(
                stream,
                close_codes::PROTOCOL_ERROR,
                disconnection_reasons::DUPLICATE_SOCKET,
            );
            if let Some(reply) = reply {
                let _ = reply.send(Err(EndpointError::OwnAddress(address)));
            }
            return;
        }

        let peer_id = remote.peer_id.clone();
        if self.connections.contains_key(&peer_id) {
            if !self.new_connection_wins(&address, direction) {
                debug!(peer = %peer_id, "lost duplicate-socket tiebreak, closing new socket");
                spawn_close(
                    stream,
                    close_codes::PROTOCOL_ERROR,
                    disconnection_reasons::DUPLICATE_SOCKET,
                );
                if let Some(reply) = reply {
                    let _ = reply.send(Err(EndpointError::Duplicate(peer_id)));
                }
                return;
            }
            if let Some(existing) = self.connections.remove(&peer_id) {
                debug!(peer = %peer_id, "won duplicate-socket tiebreak, replacing socket");
                existing.close(
                    close_codes::PROTOCOL_ERROR,
                    disconnection_reasons::DUPLICATE_SOCKET,
                );
                existing.abort_reader();
            }
        }

        if let Err(err) = self.peer_book.insert(&peer_id, &address) {
            error!(peer = %peer_id, %address, ?err, "peer book rejected connection");
            spawn_close(
                stream,
                close_codes::PROTOCOL_ERROR,
                disconnection_reasons::DUPLICATE_SOCKET,
            );
            if let Some(reply) = reply {
                let _ = reply.send(Err(err.into()));
            }
            return;
        }

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let connection = Connection::spawn(
            conn_id,
            remote.clone(),
            address.clone(),
            stream,
            self.actor_tx.clone(),
        );
        self.connections.insert(peer_id.clone(), connection);

        // Emitted again when a tiebreak replaced the socket: frames in
        // flight on the losing socket are gone, and the owner reacts to the
        // event by repeating its subscribes.
        self.emit(EndpointEvent::PeerConnected {
            peer: remote,
            address,
        });
        if let Some(reply) = reply {
            let _ = reply.send(Ok(peer_id));
        }
    }

    /// Duplicate-socket tiebreak: the surviving socket is the one dialed by
    /// the peer with the lexicographically greater advertised URL.
    fn new_connection_wins(&self, peer_url: &str, direction: Direction) -> bool {
        let winner = if self.advertised_url.as_str() > peer_url {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        direction == winner
    }

    fn current(&self, peer_id: &str, conn_id: u64) -> Option<&Connection> {
        self.connections
            .get(peer_id)
            .filter(|connection| connection.conn_id == conn_id)
    }

    fn current_mut(&mut self, peer_id: &str, conn_id: u64) -> Option<&mut Connection> {
        self.connections
            .get_mut(peer_id)
            .filter(|connection| connection.conn_id == conn_id)
    }

    fn emit(&self, event: EndpointEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Open an outbound socket and exchange identities.
async fn dial(
    peer_url: &str,
    own_url: &str,
    own_info: &PeerInfo,
) -> Result<(WsStream, PeerInfo), EndpointError> {
    let request = handshake::client_request(peer_url, own_url, own_info)?;
    let (stream, response) = connect_async_with_config(request, Some(ws_config()), false)
        .await
        .map_err(|err| EndpointError::Transport(err.to_string()))?;
    match handshake::remote_peer(response.headers()) {
        Some(remote) => Ok((stream, remote)),
        None => Err(EndpointError::HeadersMissing(peer_url.to_string())),
    }
}

/// Accept loop; one task per endpoint.
pub(crate) async fn run_listener(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    actor_tx: mpsc::Sender<ToEndpointActor>,
    own_info: PeerInfo,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (tcp, _) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(?err, "failed to accept tcp connection");
                        continue;
                    }
                };
                let tls = tls.clone();
                let actor_tx = actor_tx.clone();
                let own_info = own_info.clone();
                tokio::spawn(async move {
                    if let Err(err) = accept_connection(tcp, tls, actor_tx, own_info).await {
                        debug!(?err, "incoming connection handshake failed");
                    }
                });
            }
        }
    }
}

async fn accept_connection(
    tcp: TcpStream,
    tls: Option<TlsAcceptor>,
    actor_tx: mpsc::Sender<ToEndpointActor>,
    own_info: PeerInfo,
) -> Result<()> {
    let stream = match tls {
        Some(acceptor) => MaybeTlsStream::NativeTls(
            acceptor
                .accept(tcp)
                .await
                .context("tls handshake failed")?,
        ),
        None => MaybeTlsStream::Plain(tcp),
    };

    let slot: HandshakeSlot = Default::default();
    let callback = handshake::server_callback(own_info, slot.clone());
    let mut ws = accept_hdr_async_with_config(stream, callback, Some(ws_config()))
        .await
        .context("websocket upgrade failed")?;

    let parsed = slot.lock().ok().and_then(|mut guard| guard.take());
    match parsed {
        Some(IncomingHandshake {
            address: Some(address),
            peer: Some(peer),
        }) => {
            let incoming = ToEndpointActor::Incoming {
                stream: Box::new(ws),
                remote: peer,
                address,
            };
            let _ = actor_tx.send(incoming).await;
        }
        _ => {
            // The upgrade succeeded but the dialer failed to identify itself.
            let frame = CloseFrame {
                code: CloseCode::from(close_codes::PROTOCOL_ERROR),
                reason: disconnection_reasons::MISSING_REQUIRED_PARAMETER.into(),
            };
            let _ = ws.close(Some(frame)).await;
        }
    }
    Ok(())
}

fn spawn_close(stream: WsStream, code: u16, reason: &'static str) {
    tokio::spawn(async move {
        let mut ws = stream;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        let _ = ws.close(Some(frame)).await;
    });
}
