//! WebSocket transport adapters.
//!
//! A peer's pumps do not care which side of the mesh opened the
//! connection. Inbound connections arrive through the axum upgrade
//! handler; outbound mesh dials go through tokio-tungstenite. Both are
//! reduced to the same minimal frame vocabulary here, so the pump code
//! in [`crate::peer`] is written once.

use std::io;

use async_trait::async_trait;
use axum::extract::ws;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// The frames a peer pump sees.
#[derive(Debug)]
pub enum WsFrame {
    Binary(Bytes),
    Ping,
    Pong,
    Close,
}

/// Write half of a peer transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: WsFrame) -> io::Result<()>;
}

/// Read half of a peer transport. `None` means a clean end of stream.
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn next_frame(&mut self) -> Option<io::Result<WsFrame>>;
}

fn reset(err: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, err)
}

// ── inbound: axum upgrade ────────────────────────────────────────────

pub struct InboundSink(SplitSink<ws::WebSocket, ws::Message>);

pub struct InboundSource(SplitStream<ws::WebSocket>);

/// Split an accepted upgrade into pump halves.
pub fn split_inbound(socket: ws::WebSocket) -> (InboundSink, InboundSource) {
    let (sink, stream) = socket.split();
    (InboundSink(sink), InboundSource(stream))
}

#[async_trait]
impl FrameSink for InboundSink {
    async fn send_frame(&mut self, frame: WsFrame) -> io::Result<()> {
        let msg = match frame {
            WsFrame::Binary(b) => ws::Message::Binary(b),
            WsFrame::Ping => ws::Message::Ping(Bytes::new()),
            WsFrame::Pong => ws::Message::Pong(Bytes::new()),
            WsFrame::Close => ws::Message::Close(None),
        };
        self.0.send(msg).await.map_err(reset)
    }
}

#[async_trait]
impl FrameSource for InboundSource {
    async fn next_frame(&mut self) -> Option<io::Result<WsFrame>> {
        loop {
            let frame = match self.0.next().await? {
                Ok(ws::Message::Binary(b)) => WsFrame::Binary(b),
                // axum answers pings itself; surfacing them still resets
                // the caller's read deadline.
                Ok(ws::Message::Ping(_)) => WsFrame::Ping,
                Ok(ws::Message::Pong(_)) => WsFrame::Pong,
                Ok(ws::Message::Close(_)) => WsFrame::Close,
                Ok(ws::Message::Text(_)) => continue,
                Err(e) => return Some(Err(reset(e))),
            };
            return Some(Ok(frame));
        }
    }
}

// ── outbound: tungstenite dial ───────────────────────────────────────

pub type OutboundStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct OutboundSink(SplitSink<OutboundStream, tungstenite::Message>);

pub struct OutboundSource(SplitStream<OutboundStream>);

/// Split a dialed mesh connection into pump halves.
pub fn split_outbound(socket: OutboundStream) -> (OutboundSink, OutboundSource) {
    let (sink, stream) = socket.split();
    (OutboundSink(sink), OutboundSource(stream))
}

#[async_trait]
impl FrameSink for OutboundSink {
    async fn send_frame(&mut self, frame: WsFrame) -> io::Result<()> {
        let msg = match frame {
            WsFrame::Binary(b) => tungstenite::Message::Binary(b),
            WsFrame::Ping => tungstenite::Message::Ping(Bytes::new()),
            WsFrame::Pong => tungstenite::Message::Pong(Bytes::new()),
            WsFrame::Close => tungstenite::Message::Close(None),
        };
        self.0.send(msg).await.map_err(reset)
    }
}

#[async_trait]
impl FrameSource for OutboundSource {
    async fn next_frame(&mut self) -> Option<io::Result<WsFrame>> {
        loop {
            let frame = match self.0.next().await? {
                Ok(tungstenite::Message::Binary(b)) => WsFrame::Binary(b),
                Ok(tungstenite::Message::Ping(_)) => WsFrame::Ping,
                Ok(tungstenite::Message::Pong(_)) => WsFrame::Pong,
                Ok(tungstenite::Message::Close(_)) => WsFrame::Close,
                Ok(_) => continue,
                Err(e) => return Some(Err(reset(e))),
            };
            return Some(Ok(frame));
        }
    }
}

// ── channel-backed transport for in-crate tests ──────────────────────
