// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-socket reader and writer tasks.
//!
//! Each admitted WebSocket is split into a reader half feeding the endpoint
//! actor and a writer half draining a command queue. Events carry the
//! connection id so the actor can discard stragglers from sockets it has
//! already replaced or dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::peer::PeerInfo;

use super::actor::ToEndpointActor;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug)]
pub(crate) enum WriterCommand {
    Frame(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Live-connection record owned by the endpoint actor.
#[derive(Debug)]
pub(crate) struct Connection {
    pub conn_id: u64,
    pub peer_info: PeerInfo,
    pub address: String,
    pub writer_tx: mpsc::UnboundedSender<WriterCommand>,
    pub buffered: Arc<AtomicUsize>,
    pub high_back_pressure: bool,
    pub awaiting_pong: bool,
    pub rtt_start: Option<Instant>,
    pub rtt: Option<Duration>,
    reader_handle: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn spawn(
        conn_id: u64,
        peer_info: PeerInfo,
        address: String,
        stream: WsStream,
        actor_tx: mpsc::Sender<ToEndpointActor>,
    ) -> Self {
        let peer_id = peer_info.peer_id.clone();
        let (sink, stream) = stream.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_writer(
            sink,
            writer_rx,
            buffered.clone(),
            actor_tx.clone(),
            peer_id.clone(),
            conn_id,
        ));
        let reader_handle = tokio::spawn(run_reader(
            stream,
            actor_tx,
            peer_id,
            conn_id,
            writer_tx.clone(),
        ));

        Self {
            conn_id,
            peer_info,
            address,
            writer_tx,
            buffered,
            high_back_pressure: false,
            awaiting_pong: false,
            rtt_start: None,
            rtt: None,
            reader_handle,
        }
    }

    /// Queue a frame for sending and return the queued byte count afterwards.
    pub(crate) fn enqueue_frame(&self, frame: Vec<u8>) -> Result<usize, ()> {
        self.buffered.fetch_add(frame.len(), Ordering::Relaxed);
        self.writer_tx
            .send(WriterCommand::Frame(frame))
            .map_err(|_| ())?;
        Ok(self.buffered.load(Ordering::Relaxed))
    }

    pub(crate) fn close(&self, code: u16, reason: &str) {
        let _ = self.writer_tx.send(WriterCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub(crate) fn abort_reader(&self) {
        self.reader_handle.abort();
    }
}

async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut inbox: mpsc::UnboundedReceiver<WriterCommand>,
    buffered: Arc<AtomicUsize>,
    actor_tx: mpsc::Sender<ToEndpointActor>,
    peer_id: String,
    conn_id: u64,
) {
    while let Some(command) = inbox.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                let len = frame.len();
                let result = sink.send(Message::Binary(frame)).await;
                buffered.fetch_sub(len, Ordering::Relaxed);
                match result {
                    Ok(()) => {
                        let drained = ToEndpointActor::Drained {
                            peer_id: peer_id.clone(),
                            conn_id,
                        };
                        if actor_tx.send(drained).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let failed = ToEndpointActor::TransportFailed {
                            peer_id: peer_id.clone(),
                            conn_id,
                            error: err.to_string(),
                        };
                        let _ = actor_tx.send(failed).await;
                        return;
                    }
                }
            }
            WriterCommand::Ping(payload) => {
                if sink.send(Message::Ping(payload)).await.is_err() {
                    return;
                }
            }
            WriterCommand::Pong(payload) => {
                if sink.send(Message::Pong(payload)).await.is_err() {
                    return;
                }
            }
            WriterCommand::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                let _ = sink.close().await;
                return;
            }
        }
    }
}

async fn run_reader(
    mut stream: SplitStream<WsStream>,
    actor_tx: mpsc::Sender<ToEndpointActor>,
    peer_id: String,
    conn_id: u64,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
) {
    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Binary(payload)) => {
                let received = ToEndpointActor::FrameReceived {
                    peer_id: peer_id.clone(),
                    conn_id,
                    payload,
                };
                if actor_tx.send(received).await.is_err() {
                    return;
                }
            }
            Ok(Message::Text(text)) => {
                let received = ToEndpointActor::FrameReceived {
                    peer_id: peer_id.clone(),
                    conn_id,
                    payload: text.into_bytes(),
                };
                if actor_tx.send(received).await.is_err() {
                    return;
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = writer_tx.send(WriterCommand::Pong(payload));
            }
            Ok(Message::Pong(_)) => {
                let pong = ToEndpointActor::PongReceived {
                    peer_id: peer_id.clone(),
                    conn_id,
                };
                if actor_tx.send(pong).await.is_err() {
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|frame| frame.reason.into_owned())
                    .unwrap_or_default();
                let closed = ToEndpointActor::Closed {
                    peer_id,
                    conn_id,
                    reason,
                };
                let _ = actor_tx.send(closed).await;
                return;
            }
            Ok(Message::Frame(_)) => {}
            Err(err) => {
                let failed = ToEndpointActor::TransportFailed {
                    peer_id,
                    conn_id,
                    error: err.to_string(),
                };
                let _ = actor_tx.send(failed).await;
                return;
            }
        }
    }

    // Socket ended without a close frame.
    let closed = ToEndpointActor::Closed {
        peer_id,
        conn_id,
        reason: String::new(),
    };
    let _ = actor_tx.send(closed).await;
}
