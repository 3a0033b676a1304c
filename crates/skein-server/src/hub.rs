//! The hub: single-writer owner of all routing state.
//!
//! Two tasks drive the hub. The queue task receives every inbound
//! packet, appends relayed messages to the durable log, and paces the
//! dispatcher through a one-in-flight gate (`relay` / `relay_done`).
//! The dispatcher task owns the routing tables (local clients, mesh
//! peers, groups, the remote-client location cache) and is their only
//! mutator, so none of them need a lock. Every branch of the dispatcher
//! completes without blocking on I/O: deliveries go through the peers'
//! bounded queues and group intake channels.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skein_wire::{
    Addr, AddrKind, Body, Command, GroupDirection, Message, MsgKill, MsgLoc, MsgLoginAck,
    MsgOffline, MsgOfflineNotice, MsgQueryClientResp, MsgQueryServersResp, ServerEntry, Status,
};

use crate::error::HubError;
use crate::filelog::FileLog;
use crate::group::{Group, GroupCommand};
use crate::peer::PeerHandle;

/// Empty groups are only reaped while more than this many groups exist.
const GROUP_SOFT_CAP: usize = 1000;

/// Identity and admission material of this hub.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub addr: Addr,
    pub client_url: String,
    pub server_url: String,
    pub client_token: String,
    pub server_token: String,
}

impl ServerInfo {
    pub fn entry(&self) -> ServerEntry {
        ServerEntry {
            addr: self.addr.to_string(),
            client_url: self.client_url.clone(),
            server_url: self.server_url.clone(),
        }
    }
}

/// What a packet asks the dispatcher to do.
pub enum PacketBody {
    AddClientPeer {
        handle: PeerHandle,
        offline_notice: bool,
    },
    DelClientPeer {
        addr: Addr,
        remote_addr: Arc<str>,
    },
    AddServerPeer {
        handle: PeerHandle,
        entry: ServerEntry,
    },
    DelServerPeer {
        addr: Addr,
    },
    Relay(Message),
    Shutdown,
}

/// Dispatcher verdict, sent back through the packet's response slot.
#[derive(Debug)]
pub struct Resp {
    pub status: Status,
    pub body: Option<Body>,
}

impl Resp {
    fn ok() -> Self {
        Self {
            status: Status::Ok,
            body: None,
        }
    }

    fn status(status: Status) -> Self {
        Self { status, body: None }
    }
}

pub struct Packet {
    pub from: Addr,
    pub body: PacketBody,
    pub resp: Option<oneshot::Sender<Resp>>,
}

fn respond(slot: &mut Option<oneshot::Sender<Resp>>, resp: Resp) {
    if let Some(tx) = slot.take() {
        let _ = tx.send(resp);
    }
}

/// Millisecond unix timestamp.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Options beyond the server identity.
pub struct HubOptions {
    pub group_buffer_size: usize,
    pub message_log: Option<FileLog>,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            group_buffer_size: crate::group::DEFAULT_GROUP_BUFFER_SIZE,
            message_log: None,
        }
    }
}

/// Cloneable ingress handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    packet_tx: mpsc::Sender<Packet>,
    server: Arc<ServerInfo>,
}

impl HubHandle {
    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// Enqueue a packet without waiting for the dispatcher's verdict.
    pub async fn notify(&self, from: Addr, body: PacketBody) -> Result<(), HubError> {
        self.packet_tx
            .send(Packet {
                from,
                body,
                resp: None,
            })
            .await
            .map_err(|_| HubError::HubClosed)
    }

    /// Enqueue a packet and wait for the dispatcher's verdict.
    pub async fn request(&self, from: Addr, body: PacketBody) -> Result<Resp, HubError> {
        let (tx, rx) = oneshot::channel();
        self.packet_tx
            .send(Packet {
                from,
                body,
                resp: Some(tx),
            })
            .await
            .map_err(|_| HubError::HubClosed)?;
        rx.await.map_err(|_| HubError::HubClosed)
    }

    /// Close every peer, let the pumps drain, and stop both hub tasks.
    pub async fn close(&self) {
        let _ = self.request(self.server.addr, PacketBody::Shutdown).await;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

/// Start the hub tasks. The returned handles feed the admission layer,
/// the peers, and the cluster bootstrap.
pub fn start(server: ServerInfo, opts: HubOptions) -> (HubHandle, JoinHandle<()>, JoinHandle<()>) {
    let server = Arc::new(server);
    let (packet_tx, packet_rx) = mpsc::channel(1);
    let (relay_tx, relay_rx) = mpsc::channel(1);
    let (relay_done_tx, relay_done_rx) = mpsc::channel(1);

    let queue = tokio::spawn(packet_queue_loop(
        packet_rx,
        relay_tx,
        relay_done_rx,
        opts.message_log,
    ));

    let dispatcher = Dispatcher {
        server: server.clone(),
        group_buffer: opts.group_buffer_size,
        packet_tx: packet_tx.clone(),
        client_peers: HashMap::new(),
        server_peers: HashMap::new(),
        groups: HashMap::new(),
        location: HashMap::new(),
    };
    let dispatch = tokio::spawn(dispatcher.run(relay_rx, relay_done_tx));

    info!(server = %server.addr, "hub: started");
    (HubHandle { packet_tx, server }, queue, dispatch)
}

/// Ingress pacing: one packet in flight at the dispatcher, the rest
/// queued here, and the durable log written before dispatch.
async fn packet_queue_loop(
    mut packet_rx: mpsc::Receiver<Packet>,
    relay_tx: mpsc::Sender<Packet>,
    mut relay_done_rx: mpsc::Receiver<()>,
    log: Option<FileLog>,
) {
    let mut pending: VecDeque<Packet> = VecDeque::new();
    let mut waiting = false;

    loop {
        tokio::select! {
            pkt = packet_rx.recv() => {
                let Some(mut pkt) = pkt else { break };

                if let (Some(log), PacketBody::Relay(msg)) = (log.as_ref(), &pkt.body) {
                    if let Err(e) = log.write(&msg.encode_to_vec()).await {
                        warn!(error = %e, "hub: message log write failed");
                        respond(&mut pkt.resp, Resp::status(Status::Exception));
                        continue;
                    }
                }

                if waiting {
                    pending.push_back(pkt);
                } else if relay_tx.send(pkt).await.is_err() {
                    break;
                }
                waiting = true;
            }
            done = relay_done_rx.recv() => {
                if done.is_none() {
                    break;
                }
                match pending.pop_front() {
                    None => waiting = false,
                    Some(pkt) => {
                        if relay_tx.send(pkt).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// A registered local client, as the dispatcher sees it.
struct ClientSession {
    handle: PeerHandle,
    login_at_ms: u64,
    offline_notice: bool,
    /// Groups this client has joined.
    groups: HashSet<Addr>,
    /// Conversation partners → the server each was last seen at.
    sessions: HashMap<Addr, Addr>,
}

struct ServerSession {
    handle: PeerHandle,
    entry: ServerEntry,
}

struct Dispatcher {
    server: Arc<ServerInfo>,
    group_buffer: usize,
    /// Ingress sender, for re-queueing internally generated packets.
    packet_tx: mpsc::Sender<Packet>,
    client_peers: HashMap<Addr, ClientSession>,
    server_peers: HashMap<Addr, ServerSession>,
    groups: HashMap<Addr, Group>,
    location: HashMap<Addr, Addr>,
}

impl Dispatcher {
    async fn run(mut self, mut relay_rx: mpsc::Receiver<Packet>, relay_done_tx: mpsc::Sender<()>) {
        while let Some(pkt) = relay_rx.recv().await {
            let stop = self.process(pkt).await;
            if relay_done_tx.send(()).await.is_err() || stop {
                break;
            }
        }
        debug!("hub: dispatcher exited");
    }

    async fn process(&mut self, mut pkt: Packet) -> bool {
        match pkt.body {
            PacketBody::AddClientPeer {
                handle,
                offline_notice,
            } => {
                self.register_client(handle, offline_notice, &mut pkt.resp);
            }
            PacketBody::DelClientPeer { addr, remote_addr } => {
                self.unregister_client(addr, &remote_addr, &mut pkt.resp).await;
            }
            PacketBody::AddServerPeer { handle, entry } => {
                info!(server = %handle.addr, "hub: mesh peer registered");
                self.server_peers
                    .insert(handle.addr, ServerSession { handle, entry });
                respond(&mut pkt.resp, Resp::ok());
            }
            PacketBody::DelServerPeer { addr } => {
                info!(server = %addr, "hub: mesh peer unregistered");
                self.server_peers.remove(&addr);
                respond(&mut pkt.resp, Resp::ok());
            }
            PacketBody::Relay(msg) => {
                self.record_session(pkt.from, &msg);
                if pkt.from.kind() == AddrKind::Server
                    && msg.header.source.kind() == AddrKind::Client
                {
                    self.record_location(pkt.from, &msg);
                }
                if msg.header.dest == self.server.addr {
                    self.handle_logic(msg, &mut pkt.resp).await;
                } else {
                    self.handle_relay(pkt.from, msg, &mut pkt.resp).await;
                }
            }
            PacketBody::Shutdown => {
                for speer in self.server_peers.values() {
                    speer.handle.close();
                }
                for cpeer in self.client_peers.values() {
                    cpeer.handle.close();
                }
                respond(&mut pkt.resp, Resp::ok());
                return true;
            }
        }
        false
    }

    /// A fresh login. An existing connection under the same address is
    /// told to die, and every mesh peer hears about the new home.
    fn register_client(
        &mut self,
        handle: PeerHandle,
        offline_notice: bool,
        resp: &mut Option<oneshot::Sender<Resp>>,
    ) {
        let addr = handle.addr;
        let login_at_ms = unix_millis();

        let kill = Message::new(addr, addr, Body::Kill(MsgKill { login_at: login_at_ms }));

        if let Some(old) = self.client_peers.get(&addr) {
            debug!(client = %addr, "hub: duplicate login, evicting older peer");
            if let Err(e) = old.handle.push_message(kill.clone(), None) {
                warn!(client = %addr, error = %e, "hub: kill delivery failed");
            }
        }
        self.broadcast(&kill);

        let ack = Message::new(
            self.server.addr,
            addr,
            Body::LoginAck(MsgLoginAck { login_at: login_at_ms }),
        );
        if let Err(e) = handle.push_message(ack, None) {
            warn!(client = %addr, error = %e, "hub: login ack failed");
        }

        self.client_peers.insert(
            addr,
            ClientSession {
                handle,
                login_at_ms,
                offline_notice,
                groups: HashSet::new(),
                sessions: HashMap::new(),
            },
        );
        respond(resp, Resp::ok());
    }

    /// A connection went away. Ignored if the address has since been
    /// taken over by a newer connection.
    async fn unregister_client(
        &mut self,
        addr: Addr,
        remote_addr: &str,
        resp: &mut Option<oneshot::Sender<Resp>>,
    ) {
        let Some(session) = self.client_peers.remove(&addr) else {
            respond(resp, Resp::ok());
            return;
        };
        if &*session.handle.remote_addr != remote_addr {
            // Late disconnect of an evicted connection; the address
            // belongs to a newer login now.
            self.client_peers.insert(addr, session);
            respond(resp, Resp::ok());
            return;
        }

        for gaddr in &session.groups {
            if let Some(group) = self.groups.get(gaddr) {
                group.send(GroupCommand::Leave(addr)).await;
            }
        }

        // Partition conversation partners by their home server and let
        // each home deliver the offline notices.
        let mut by_server: HashMap<Addr, Vec<Addr>> = HashMap::new();
        for (counterpart, home) in session.sessions {
            by_server.entry(home).or_default().push(counterpart);
        }
        for (home, targets) in by_server {
            let mut offline = Message::new(
                self.server.addr,
                home,
                Body::Offline(MsgOffline {
                    peer: addr,
                    targets,
                    notice: session.offline_notice as u8,
                }),
            );
            if let Some(speer) = self.server_peers.get(&home) {
                if let Err(e) = speer.handle.push_message(offline, None) {
                    warn!(server = %home, error = %e, "hub: offline relay failed");
                }
            } else {
                // The partners live here (or their home is gone):
                // run the notice through the local logic path.
                offline.header.dest = self.server.addr;
                let pkt = Packet {
                    from: self.server.addr,
                    body: PacketBody::Relay(offline),
                    resp: None,
                };
                if self.packet_tx.send(pkt).await.is_err() {
                    return;
                }
            }
        }
        respond(resp, Resp::ok());
    }

    /// Track who talks to whom, so disconnects can notify exactly the
    /// partners that ever exchanged a message.
    fn record_session(&mut self, from: Addr, msg: &Message) {
        let header = &msg.header;
        if header.source.kind() == AddrKind::Client {
            if let Some(session) = self.client_peers.get_mut(&header.source) {
                session.sessions.insert(header.dest, self.server.addr);
            }
        }
        if header.dest.kind() != AddrKind::Client {
            return;
        }
        if let Some(session) = self.client_peers.get_mut(&header.dest) {
            let home = if from.kind() == AddrKind::Client {
                self.server.addr
            } else {
                from
            };
            session.sessions.insert(header.source, home);
        }
    }

    /// Learn where a relayed source client lives, and if its target is
    /// one of ours, tell the origin server so the next message comes
    /// straight here.
    fn record_location(&mut self, from: Addr, msg: &Message) {
        let source = msg.header.source;
        if self.location.contains_key(&source) {
            return;
        }
        self.location.insert(source, from);

        let dest = msg.header.dest;
        if self.client_peers.contains_key(&dest) {
            let loc = Message::new(
                self.server.addr,
                from,
                Body::Loc(MsgLoc {
                    target: source,
                    peer: dest,
                    server: self.server.addr,
                }),
            );
            if let Some(speer) = self.server_peers.get(&from) {
                if let Err(e) = speer.handle.push_message(loc, None) {
                    warn!(server = %from, error = %e, "hub: location advert failed");
                }
            }
        }
    }

    /// Control messages addressed to this hub itself.
    async fn handle_logic(&mut self, msg: Message, resp: &mut Option<oneshot::Sender<Resp>>) {
        let header = msg.header;
        match msg.body {
            Body::GroupInOut(group_msg) => {
                let source = header.source;
                let Some(session) = self.client_peers.get_mut(&source) else {
                    respond(resp, Resp::status(Status::PeerNotFound));
                    return;
                };
                let handle = session.handle.clone();
                let buffer = self.group_buffer;
                for gaddr in group_msg.groups {
                    match group_msg.direction {
                        GroupDirection::In => {
                            session.groups.insert(gaddr);
                            let group = self
                                .groups
                                .entry(gaddr)
                                .or_insert_with(|| Group::spawn(gaddr, buffer));
                            group.send(GroupCommand::Join(handle.clone())).await;
                        }
                        GroupDirection::Out => {
                            session.groups.remove(&gaddr);
                            if let Some(group) = self.groups.get(&gaddr) {
                                group.send(GroupCommand::Leave(source)).await;
                                if group.member_count() == 0 && self.groups.len() > GROUP_SOFT_CAP
                                {
                                    if let Some(group) = self.groups.remove(&gaddr) {
                                        group.send(GroupCommand::Exit).await;
                                    }
                                }
                            }
                        }
                    }
                }
                respond(resp, Resp::ok());
            }
            Body::Loc(loc) => {
                self.location.insert(loc.peer, loc.server);
                if let Some(session) = self.client_peers.get_mut(&loc.target) {
                    session.sessions.insert(loc.peer, loc.server);
                }
                respond(resp, Resp::ok());
            }
            Body::Offline(offline) => {
                self.location.remove(&offline.peer);
                for target in offline.targets {
                    let Some(session) = self.client_peers.get_mut(&target) else {
                        continue;
                    };
                    session.sessions.remove(&offline.peer);
                    if offline.notice == 1 {
                        let notice = Message::new(
                            self.server.addr,
                            target,
                            Body::OfflineNotice(MsgOfflineNotice { peer: offline.peer }),
                        );
                        if let Err(e) = session.handle.push_message(notice, None) {
                            warn!(client = %target, error = %e, "hub: offline notice failed");
                        }
                    }
                }
                respond(resp, Resp::ok());
            }
            Body::QueryClient(query) => {
                let login_at = self
                    .client_peers
                    .get(&query.peer)
                    .map(|s| (s.login_at_ms / 1000) as u32)
                    .unwrap_or(0);
                respond(
                    resp,
                    Resp {
                        status: Status::Ok,
                        body: Some(Body::QueryClientResp(MsgQueryClientResp { login_at })),
                    },
                );
            }
            Body::QueryServers => {
                let mut servers = vec![self.server.entry()];
                servers.extend(self.server_peers.values().map(|s| s.entry.clone()));
                respond(
                    resp,
                    Resp {
                        status: Status::Ok,
                        body: Some(Body::QueryServersResp(MsgQueryServersResp { servers })),
                    },
                );
            }
            _ => {
                debug!(command = ?header.command, "hub: ignoring control message");
                respond(resp, Resp::ok());
            }
        }
    }

    /// Route a message toward a destination that is not this hub.
    async fn handle_relay(
        &mut self,
        from: Addr,
        msg: Message,
        resp: &mut Option<oneshot::Sender<Resp>>,
    ) {
        let dest = msg.header.dest;

        if dest.kind() == AddrKind::Client {
            if let Some(session) = self.client_peers.get(&dest) {
                let status = match session.handle.push_message(msg, None) {
                    Ok(()) => Status::Ok,
                    Err(HubError::QueueFull) => Status::QueueFull,
                    Err(e) => {
                        warn!(client = %dest, error = %e, "hub: local delivery failed");
                        Status::Ok
                    }
                };
                respond(resp, Resp::status(status));
                return;
            }
            if from.kind() == AddrKind::Server {
                // Already relayed once; a second hop would loop.
                respond(resp, Resp::status(Status::PeerNotFound));
                return;
            }
            // From a local client: route by cached location, or flood.
            match self.location.get(&dest) {
                Some(home) => {
                    if let Some(speer) = self.server_peers.get(home) {
                        if let Err(e) = speer.handle.push_message(msg, None) {
                            warn!(server = %home, error = %e, "hub: relay failed");
                        }
                    }
                }
                None => self.broadcast(&msg),
            }
            // Best-effort only: the sender learns the peer was not local.
            respond(resp, Resp::status(Status::PeerNotFound));
            return;
        }

        // Group, broadcast and server destinations fan out to the mesh
        // when they originate here; every hub serves its own members.
        if from.kind() == AddrKind::Client {
            self.broadcast(&msg);
        }
        match dest.kind() {
            AddrKind::Group => {
                if let Some(group) = self.groups.get(&dest) {
                    group.send(GroupCommand::Message(msg)).await;
                }
            }
            AddrKind::Broadcast => self.send_to_domain(&msg),
            _ => {}
        }
        respond(resp, Resp::ok());
    }

    /// Deliver to every local client in the destination's domain.
    fn send_to_domain(&self, msg: &Message) {
        let domain = msg.header.dest.domain();
        for (addr, session) in &self.client_peers {
            if addr.domain() == domain {
                if let Err(e) = session.handle.push_message(msg.clone(), None) {
                    warn!(client = %addr, error = %e, "hub: domain delivery failed");
                }
            }
        }
    }

    /// Send a copy to every mesh peer.
    fn broadcast(&self, msg: &Message) {
        for speer in self.server_peers.values() {
            if let Err(e) = speer.handle.push_message(msg.clone(), None) {
                warn!(server = %speer.handle.addr, error = %e, "hub: broadcast failed");
            }
        }
    }
}

// ── peer listener bridging connections to the hub ────────────────────

/// Which side of the mesh a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Client,
    Server,
}

/// The listener every hub-attached peer runs: inbound messages become
/// relay packets, the dispatcher's verdict becomes a response frame
/// where one is due, and a disconnect becomes an unregister packet.
pub struct HubListener {
    role: PeerRole,
    addr: Addr,
    remote_addr: Arc<str>,
    hub: HubHandle,
    outbound: PeerHandle,
}

impl HubListener {
    pub fn new(role: PeerRole, hub: HubHandle, outbound: PeerHandle) -> Self {
        Self {
            role,
            addr: outbound.addr,
            remote_addr: outbound.remote_addr.clone(),
            hub,
            outbound,
        }
    }
}

#[async_trait::async_trait]
impl crate::peer::PeerListener for HubListener {
    async fn on_message(&self, msg: Message) -> Result<(), HubError> {
        let seq = msg.header.seq;
        let command = msg.header.command;

        let resp = self.hub.request(self.addr, PacketBody::Relay(msg)).await?;

        // Clients hear about failed best-effort deliveries; a relayed
        // frame that cannot be routed is dropped, not bounced.
        let failed = !matches!(resp.status, Status::Ok | Status::None);
        let reply_body = match resp.body {
            Some(body) => Some(body),
            None if failed && command == Command::Chat && self.role == PeerRole::Client => {
                Some(Body::ChatResp)
            }
            None => {
                if failed {
                    debug!(peer = %self.addr, status = ?resp.status, command = ?command,
                        "hub: undeliverable frame dropped");
                }
                None
            }
        };

        if let Some(body) = reply_body {
            let mut reply = Message::new(self.hub.server().addr, self.addr, body);
            reply.header.ack_seq = seq;
            reply.header.status = resp.status;
            if let Err(e) = self.outbound.push_message(reply, None) {
                debug!(peer = %self.addr, error = %e, "hub: response frame dropped");
            }
        }
        Ok(())
    }

    async fn on_disconnect(&self) {
        let body = match self.role {
            PeerRole::Client => PacketBody::DelClientPeer {
                addr: self.addr,
                remote_addr: self.remote_addr.clone(),
            },
            PeerRole::Server => PacketBody::DelServerPeer { addr: self.addr },
        };
        if self.hub.notify(self.addr, body).await.is_err() {
            debug!(peer = %self.addr, "hub: unregister after shutdown");
        }
    }
}
