//! Peer connection management.
//!
//! A peer owns one full-duplex transport and runs two cooperating
//! tasks:
//!   - Read pump: decodes frames, hands messages to the listener,
//!     enforces the pong deadline and the max-frame guard
//!   - Write pump: drains the bounded send queue, pings on a timer,
//!     enforces the write deadline
//!
//! The listener's disconnect callback fires exactly once, always from
//! the read pump's exit path; a failed write kills the transport and
//! the read pump notices within the pong deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use skein_wire::{Addr, FrameCodec, Message, WireError};

use crate::error::HubError;
use crate::transport::{FrameSink, FrameSource, WsFrame};

/// Outbound queue capacity per peer.
pub const SEND_QUEUE_SIZE: usize = 64;

/// Deadlines and limits for one peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Largest frame accepted from the remote; larger is fatal.
    pub max_message_size: usize,
    /// Time allowed for one outbound write.
    pub write_wait: Duration,
    /// Max silence tolerated on the read side.
    pub pong_wait: Duration,
    /// Ping cadence; must be shorter than `pong_wait`.
    pub ping_period: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 2048,
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(20),
            ping_period: Duration::from_secs(10),
        }
    }
}

/// Resolved when a pushed message has left the transport.
pub type DeliveryReceipt = oneshot::Sender<Result<(), HubError>>;

enum PeerCommand {
    Send(Message, Option<DeliveryReceipt>),
}

/// Callbacks a peer invokes from its pumps.
#[async_trait]
pub trait PeerListener: Send + Sync + 'static {
    async fn on_message(&self, msg: Message) -> Result<(), HubError>;
    async fn on_disconnect(&self);
}

/// Cloneable sending/closing handle to a running peer.
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: Addr,
    /// Transport origin, used to tell two logins of the same address apart.
    pub remote_addr: Arc<str>,
    cmd_tx: mpsc::Sender<PeerCommand>,
    closed: Arc<watch::Sender<bool>>,
}

impl PeerHandle {
    /// Enqueue a message for send. Never blocks; a full queue is the
    /// caller's signal to back off.
    pub fn push_message(
        &self,
        msg: Message,
        done: Option<DeliveryReceipt>,
    ) -> Result<(), HubError> {
        self.cmd_tx
            .try_send(PeerCommand::Send(msg, done))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HubError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => HubError::PeerGone,
            })
    }

    /// Idempotent; wakes both pumps. The disconnect callback fires once
    /// via the read pump.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.subscribe().borrow()
    }
}

/// One peer connection, before its pumps are started.
pub struct Peer {
    pub addr: Addr,
    pub remote_addr: Arc<str>,
    cfg: PeerConfig,
    cmd_tx: mpsc::Sender<PeerCommand>,
    cmd_rx: mpsc::Receiver<PeerCommand>,
    closed: Arc<watch::Sender<bool>>,
}

impl Peer {
    pub fn new(addr: Addr, remote_addr: &str, cfg: PeerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(SEND_QUEUE_SIZE);
        let (closed, _) = watch::channel(false);
        Self {
            addr,
            remote_addr: remote_addr.into(),
            cfg,
            cmd_tx,
            cmd_rx,
            closed: Arc::new(closed),
        }
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            addr: self.addr,
            remote_addr: self.remote_addr.clone(),
            cmd_tx: self.cmd_tx.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Attach the transport and start both pumps. Consumes the peer; a
    /// peer cannot be restarted.
    pub fn start<S, R, L>(
        self,
        sink: S,
        source: R,
        listener: L,
    ) -> (JoinHandle<()>, JoinHandle<()>)
    where
        S: FrameSink,
        R: FrameSource,
        L: PeerListener,
    {
        let write = tokio::spawn(write_pump(
            sink,
            self.cmd_rx,
            self.closed.clone(),
            self.cfg.clone(),
            self.addr,
        ));
        let read = tokio::spawn(read_pump(
            source,
            listener,
            self.closed,
            self.cfg,
            self.addr,
        ));
        (read, write)
    }
}

async fn write_pump<S: FrameSink>(
    mut sink: S,
    mut cmd_rx: mpsc::Receiver<PeerCommand>,
    closed: Arc<watch::Sender<bool>>,
    cfg: PeerConfig,
    addr: Addr,
) {
    let mut codec = FrameCodec::new(cfg.max_message_size);
    let mut ticker = interval(cfg.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut closed_rx = closed.subscribe();

    loop {
        tokio::select! {
            _ = closed_rx.changed() => {
                let _ = timeout(cfg.write_wait, sink.send_frame(WsFrame::Close)).await;
                break;
            }
            cmd = cmd_rx.recv() => {
                let Some(PeerCommand::Send(msg, done)) = cmd else { break };
                let mut buf = BytesMut::new();
                if let Err(e) = codec.encode(msg, &mut buf) {
                    warn!(peer = %addr, error = %e, "peer: dropping unencodable message");
                    if let Some(done) = done {
                        let _ = done.send(Err(e.into()));
                    }
                    continue;
                }
                let result = match timeout(cfg.write_wait, sink.send_frame(WsFrame::Binary(buf.freeze()))).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(HubError::Io(e)),
                    Err(_) => Err(HubError::WriteTimeout),
                };
                let failed = result.is_err();
                if let Some(done) = done {
                    let _ = done.send(result);
                }
                if failed {
                    debug!(peer = %addr, "peer: write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                if timeout(cfg.write_wait, sink.send_frame(WsFrame::Ping)).await.map_or(true, |r| r.is_err()) {
                    debug!(peer = %addr, "peer: ping write failed");
                    break;
                }
            }
        }
    }

    // Wake the read pump so the disconnect path runs promptly.
    closed.send_replace(true);
}

async fn read_pump<R: FrameSource, L: PeerListener>(
    mut source: R,
    listener: L,
    closed: Arc<watch::Sender<bool>>,
    cfg: PeerConfig,
    addr: Addr,
) {
    let mut codec = FrameCodec::new(cfg.max_message_size);
    let mut closed_rx = closed.subscribe();

    loop {
        let frame = tokio::select! {
            _ = closed_rx.changed() => break,
            next = timeout(cfg.pong_wait, source.next_frame()) => match next {
                Err(_) => {
                    debug!(peer = %addr, "peer: pong deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(peer = %addr, error = %e, "peer: read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            },
        };

        match frame {
            // Any traffic resets the deadline; pings are answered by the
            // transport layer.
            WsFrame::Ping | WsFrame::Pong => {}
            WsFrame::Close => break,
            WsFrame::Binary(data) => {
                let mut buf = BytesMut::from(&data[..]);
                match codec.decode(&mut buf) {
                    Ok(Some(msg)) => {
                        if let Err(e) = listener.on_message(msg).await {
                            warn!(peer = %addr, error = %e, "peer: message handler failed");
                        }
                    }
                    Ok(None) => {
                        warn!(peer = %addr, bytes = data.len(), "peer: dropping short frame");
                    }
                    Err(e @ WireError::FrameTooLarge(..)) => {
                        warn!(peer = %addr, error = %e, "peer: oversized frame, closing");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %addr, error = %e, "peer: dropping undecodable frame");
                    }
                }
            }
        }
    }

    // Wake the write pump, then report the disconnect exactly once.
    closed.send_replace(true);
    listener.on_disconnect().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use skein_wire::{Body, MsgChat};

    use crate::transport::mock::{MockSink, MockSource};

    #[derive(Default)]
    struct RecordingListener {
        messages: Mutex<Vec<Message>>,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl PeerListener for Arc<RecordingListener> {
        async fn on_message(&self, msg: Message) -> Result<(), HubError> {
            self.messages.lock().unwrap().push(msg);
            Ok(())
        }

        async fn on_disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chat(text: &str) -> Message {
        Message::new(
            Addr::client(1, 0, "a").unwrap(),
            Addr::client(1, 0, "b").unwrap(),
            Body::Chat(MsgChat {
                kind: 1,
                text: text.into(),
                extra: String::new(),
            }),
        )
    }

    fn encoded(msg: &Message, max: usize) -> bytes::Bytes {
        let mut codec = FrameCodec::new(max);
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        buf.freeze()
    }

    fn harness(
        cfg: PeerConfig,
    ) -> (
        PeerHandle,
        mpsc::UnboundedSender<WsFrame>,
        mpsc::UnboundedReceiver<WsFrame>,
        Arc<RecordingListener>,
    ) {
        let peer = Peer::new(Addr::client(1, 0, "p").unwrap(), "127.0.0.1:9", cfg);
        let handle = peer.handle();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let listener = Arc::new(RecordingListener::default());
        peer.start(MockSink(out_tx), MockSource(in_rx), listener.clone());
        (handle, in_tx, out_rx, listener)
    }

    async fn next_binary(rx: &mut mpsc::UnboundedReceiver<WsFrame>) -> Message {
        loop {
            match rx.recv().await.expect("transport closed") {
                WsFrame::Binary(data) => {
                    let mut buf = BytesMut::from(&data[..]);
                    return FrameCodec::default().decode(&mut buf).unwrap().unwrap();
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn messages_leave_in_enqueue_order() {
        let (handle, _in_tx, mut out_rx, _) = harness(PeerConfig::default());

        for text in ["one", "two", "three"] {
            handle.push_message(chat(text), None).unwrap();
        }
        for text in ["one", "two", "three"] {
            let msg = next_binary(&mut out_rx).await;
            assert_eq!(msg, chat(text));
        }
    }

    #[tokio::test]
    async fn delivery_receipt_resolves_after_send() {
        let (handle, _in_tx, mut out_rx, _) = harness(PeerConfig::default());

        let (done_tx, done_rx) = oneshot::channel();
        handle.push_message(chat("receipt"), Some(done_tx)).unwrap();
        let _ = next_binary(&mut out_rx).await;
        assert!(done_rx.await.unwrap().is_ok());
    }

    #[test]
    fn queue_full_is_reported_without_blocking() {
        // Pumps never started: nothing drains the queue.
        let peer = Peer::new(
            Addr::client(1, 0, "p").unwrap(),
            "127.0.0.1:9",
            PeerConfig::default(),
        );
        let handle = peer.handle();
        for _ in 0..SEND_QUEUE_SIZE {
            handle.push_message(chat("fill"), None).unwrap();
        }
        assert!(matches!(
            handle.push_message(chat("overflow"), None),
            Err(HubError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_disconnects_once() {
        let (handle, in_tx, _out_rx, listener) = harness(PeerConfig::default());

        handle.close();
        handle.close();
        drop(in_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn silent_connection_hits_pong_deadline() {
        let cfg = PeerConfig {
            pong_wait: Duration::from_millis(50),
            ping_period: Duration::from_millis(20),
            ..PeerConfig::default()
        };
        let (_handle, _in_tx, _out_rx, listener) = harness(cfg);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_peer() {
        let (_handle, in_tx, _out_rx, listener) = harness(PeerConfig::default());

        let huge = chat(&"x".repeat(4096));
        in_tx
            .send(WsFrame::Binary(encoded(&huge, 1 << 20)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_frame_is_dropped_connection_survives() {
        let (_handle, in_tx, _out_rx, listener) = harness(PeerConfig::default());

        // Valid length prefix, garbage payload.
        let mut garbage = BytesMut::new();
        use bytes::BufMut;
        garbage.put_u32(4);
        garbage.put_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        in_tx.send(WsFrame::Binary(garbage.freeze())).unwrap();

        in_tx
            .send(WsFrame::Binary(encoded(&chat("still here"), 2048)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 0);
        let got = listener.messages.lock().unwrap();
        assert_eq!(got.as_slice(), &[chat("still here")]);
    }
}
