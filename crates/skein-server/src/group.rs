//! Group fan-out actors.
//!
//! One task per active group owns the member set, so the dispatcher
//! never pays for fan-out inside its routing loop. Membership changes
//! and messages funnel through one bounded intake channel; deliveries
//! use the members' bounded send queues and are never retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use skein_wire::{Addr, Message};

use crate::peer::PeerHandle;

/// Default intake capacity; overridden by `group-buffer-size`.
pub const DEFAULT_GROUP_BUFFER_SIZE: usize = 10;

pub enum GroupCommand {
    Join(PeerHandle),
    Leave(Addr),
    Message(Message),
    Exit,
}

/// Handle to one group's actor.
pub struct Group {
    pub addr: Addr,
    intake: mpsc::Sender<GroupCommand>,
    members: Arc<AtomicUsize>,
}

impl Group {
    /// Lazily created on first join.
    pub fn spawn(addr: Addr, buffer: usize) -> Self {
        let (intake, rx) = mpsc::channel(buffer.max(1));
        let members = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run(addr, rx, members.clone()));
        Self {
            addr,
            intake,
            members,
        }
    }

    pub async fn send(&self, cmd: GroupCommand) {
        if self.intake.send(cmd).await.is_err() {
            warn!(group = %self.addr, "group: intake closed");
        }
    }

    /// Last published member count. Updated by the actor, so it may lag
    /// an in-flight join or leave.
    pub fn member_count(&self) -> usize {
        self.members.load(Ordering::SeqCst)
    }
}

async fn run(addr: Addr, mut intake: mpsc::Receiver<GroupCommand>, count: Arc<AtomicUsize>) {
    let mut members: HashMap<Addr, PeerHandle> = HashMap::new();

    while let Some(cmd) = intake.recv().await {
        match cmd {
            GroupCommand::Join(peer) => {
                members.insert(peer.addr, peer);
                count.store(members.len(), Ordering::SeqCst);
            }
            GroupCommand::Leave(peer) => {
                members.remove(&peer);
                count.store(members.len(), Ordering::SeqCst);
            }
            GroupCommand::Message(msg) => {
                for member in members.values() {
                    if let Err(e) = member.push_message(msg.clone(), None) {
                        warn!(group = %addr, member = %member.addr, error = %e,
                            "group: delivery failed");
                    }
                }
            }
            GroupCommand::Exit => break,
        }
    }
    debug!(group = %addr, "group: actor exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    use skein_wire::{Body, FrameCodec, MsgChat};

    use crate::peer::{Peer, PeerConfig};
    use crate::transport::mock::{MockSink, MockSource};
    use crate::transport::WsFrame;

    struct NullListener;

    #[async_trait::async_trait]
    impl crate::peer::PeerListener for NullListener {
        async fn on_message(&self, _msg: Message) -> Result<(), crate::error::HubError> {
            Ok(())
        }
        async fn on_disconnect(&self) {}
    }

    /// A running peer whose transport output is captured.
    fn member(id: &str) -> (PeerHandle, mpsc::UnboundedReceiver<WsFrame>) {
        let peer = Peer::new(
            Addr::client(1, 0, id).unwrap(),
            "127.0.0.1:0",
            PeerConfig::default(),
        );
        let handle = peer.handle();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        // Leak the input side so the read pump idles instead of exiting.
        std::mem::forget(_in_tx);
        peer.start(MockSink(out_tx), MockSource(in_rx), NullListener);
        (handle, out_rx)
    }

    fn note(text: &str) -> Message {
        Message::new(
            Addr::client(1, 0, "s").unwrap(),
            Addr::group(1, "g").unwrap(),
            Body::Chat(MsgChat {
                kind: 1,
                text: text.into(),
                extra: String::new(),
            }),
        )
    }

    fn drain_chats(rx: &mut mpsc::UnboundedReceiver<WsFrame>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let WsFrame::Binary(data) = frame {
                let mut buf = BytesMut::from(&data[..]);
                out.push(FrameCodec::default().decode(&mut buf).unwrap().unwrap());
            }
        }
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn fan_out_tracks_membership() {
        let group = Group::spawn(Addr::group(1, "g").unwrap(), DEFAULT_GROUP_BUFFER_SIZE);
        let (h1, mut rx1) = member("m1");
        let (h2, mut rx2) = member("m2");

        group.send(GroupCommand::Join(h1.clone())).await;
        group.send(GroupCommand::Join(h2.clone())).await;
        group.send(GroupCommand::Message(note("all"))).await;
        group.send(GroupCommand::Leave(h2.addr)).await;
        group.send(GroupCommand::Message(note("one"))).await;
        settle().await;

        assert_eq!(group.member_count(), 1);
        assert_eq!(drain_chats(&mut rx1), vec![note("all"), note("one")]);
        assert_eq!(drain_chats(&mut rx2), vec![note("all")]);
    }

    #[tokio::test]
    async fn rejoining_same_member_does_not_double_deliver() {
        let group = Group::spawn(Addr::group(1, "g").unwrap(), DEFAULT_GROUP_BUFFER_SIZE);
        let (h1, mut rx1) = member("m1");

        group.send(GroupCommand::Join(h1.clone())).await;
        group.send(GroupCommand::Join(h1)).await;
        group.send(GroupCommand::Message(note("once"))).await;
        settle().await;

        assert_eq!(group.member_count(), 1);
        assert_eq!(drain_chats(&mut rx1), vec![note("once")]);
    }

    #[tokio::test]
    async fn exit_stops_the_actor() {
        let group = Group::spawn(Addr::group(1, "g").unwrap(), DEFAULT_GROUP_BUFFER_SIZE);
        group.send(GroupCommand::Exit).await;
        settle().await;
        // Further sends only log; nothing panics.
        group.send(GroupCommand::Message(note("late"))).await;
    }
}
