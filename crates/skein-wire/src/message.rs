//! Typed messages: a fixed header plus a command-keyed body.
//!
//! The header travels first on the wire: `seq:u32, ack_seq:u32,
//! command:u8, status:u8, source:Addr, dest:Addr`. The body encoding is
//! fixed per command. Command and status values are stable: they are
//! the protocol, not an implementation detail.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{Addr, WireError};

/// Command codes. Values are stable on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Chat = 1,
    ChatResp = 2,
    GroupInOut = 3,
    Kill = 4,
    Loc = 5,
    Offline = 6,
    OfflineNotice = 7,
    QueryClient = 8,
    QueryClientResp = 9,
    QueryServers = 10,
    QueryServersResp = 11,
    LoginAck = 12,
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Chat),
            2 => Ok(Self::ChatResp),
            3 => Ok(Self::GroupInOut),
            4 => Ok(Self::Kill),
            5 => Ok(Self::Loc),
            6 => Ok(Self::Offline),
            7 => Ok(Self::OfflineNotice),
            8 => Ok(Self::QueryClient),
            9 => Ok(Self::QueryClientResp),
            10 => Ok(Self::QueryServers),
            11 => Ok(Self::QueryServersResp),
            12 => Ok(Self::LoginAck),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// Status codes carried in response headers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Not a response.
    #[default]
    None = 0,
    Ok = 1,
    Exception = 2,
    PeerNotFound = 3,
    QueueFull = 4,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Ok),
            2 => Ok(Self::Exception),
            3 => Ok(Self::PeerNotFound),
            4 => Ok(Self::QueueFull),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub seq: u32,
    pub ack_seq: u32,
    pub command: Command,
    pub status: Status,
    pub source: Addr,
    pub dest: Addr,
}

impl Header {
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.seq);
        dst.put_u32(self.ack_seq);
        dst.put_u8(self.command as u8);
        dst.put_u8(self.status as u8);
        self.source.encode(dst);
        self.dest.encode(dst);
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < 10 {
            return Err(WireError::Truncated {
                needed: 10 - src.remaining(),
            });
        }
        let seq = src.get_u32();
        let ack_seq = src.get_u32();
        let command = Command::try_from(src.get_u8())?;
        let status = Status::try_from(src.get_u8())?;
        let source = Addr::decode(src)?;
        let dest = Addr::decode(src)?;
        Ok(Self {
            seq,
            ack_seq,
            command,
            status,
            source,
            dest,
        })
    }
}

/// Direction of a group membership change.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDirection {
    In = 1,
    Out = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsgChat {
    /// Application-defined chat kind (text, image, ...).
    pub kind: u8,
    pub text: String,
    pub extra: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgGroupInOut {
    pub direction: GroupDirection,
    pub groups: Vec<Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgKill {
    /// Millisecond timestamp of the login that supersedes this connection.
    pub login_at: u64,
}

/// Location advertisement: `peer` lives at `server`; deliver to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgLoc {
    pub target: Addr,
    pub peer: Addr,
    pub server: Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgOffline {
    pub peer: Addr,
    pub targets: Vec<Addr>,
    /// 1 when the disconnecting peer asked its partners to be notified.
    pub notice: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgOfflineNotice {
    pub peer: Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgQueryClient {
    pub peer: Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgQueryClientResp {
    /// Login time of the queried client in seconds; 0 when absent.
    pub login_at: u32,
}

/// One hub in a server-list response. Also the JSON record served by
/// `/q/servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "ClientURL")]
    pub client_url: String,
    #[serde(rename = "ServerURL")]
    pub server_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsgQueryServersResp {
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgLoginAck {
    /// Millisecond timestamp the hub recorded for this login.
    pub login_at: u64,
}

/// Message body, keyed by [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Chat(MsgChat),
    ChatResp,
    GroupInOut(MsgGroupInOut),
    Kill(MsgKill),
    Loc(MsgLoc),
    Offline(MsgOffline),
    OfflineNotice(MsgOfflineNotice),
    QueryClient(MsgQueryClient),
    QueryClientResp(MsgQueryClientResp),
    QueryServers,
    QueryServersResp(MsgQueryServersResp),
    LoginAck(MsgLoginAck),
}

impl Body {
    /// The command that keys this body on the wire.
    pub fn command(&self) -> Command {
        match self {
            Body::Chat(_) => Command::Chat,
            Body::ChatResp => Command::ChatResp,
            Body::GroupInOut(_) => Command::GroupInOut,
            Body::Kill(_) => Command::Kill,
            Body::Loc(_) => Command::Loc,
            Body::Offline(_) => Command::Offline,
            Body::OfflineNotice(_) => Command::OfflineNotice,
            Body::QueryClient(_) => Command::QueryClient,
            Body::QueryClientResp(_) => Command::QueryClientResp,
            Body::QueryServers => Command::QueryServers,
            Body::QueryServersResp(_) => Command::QueryServersResp,
            Body::LoginAck(_) => Command::LoginAck,
        }
    }

    fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Body::Chat(m) => {
                dst.put_u8(m.kind);
                put_str32(dst, &m.text);
                put_str32(dst, &m.extra);
            }
            Body::ChatResp | Body::QueryServers => {}
            Body::GroupInOut(m) => {
                dst.put_u8(m.direction as u8);
                dst.put_u16(m.groups.len() as u16);
                for g in &m.groups {
                    g.encode(dst);
                }
            }
            Body::Kill(m) => dst.put_u64(m.login_at),
            Body::Loc(m) => {
                m.target.encode(dst);
                m.peer.encode(dst);
                m.server.encode(dst);
            }
            Body::Offline(m) => {
                m.peer.encode(dst);
                dst.put_u16(m.targets.len() as u16);
                for t in &m.targets {
                    t.encode(dst);
                }
                dst.put_u8(m.notice);
            }
            Body::OfflineNotice(m) => m.peer.encode(dst),
            Body::QueryClient(m) => m.peer.encode(dst),
            Body::QueryClientResp(m) => dst.put_u32(m.login_at),
            Body::QueryServersResp(m) => {
                dst.put_u16(m.servers.len() as u16);
                for s in &m.servers {
                    put_str16(dst, &s.addr);
                    put_str16(dst, &s.client_url);
                    put_str16(dst, &s.server_url);
                }
            }
            Body::LoginAck(m) => dst.put_u64(m.login_at),
        }
    }

    fn decode(command: Command, src: &mut impl Buf) -> Result<Self, WireError> {
        let body = match command {
            Command::Chat => {
                let kind = get_u8(src)?;
                let text = get_str32(src)?;
                let extra = get_str32(src)?;
                Body::Chat(MsgChat { kind, text, extra })
            }
            Command::ChatResp => Body::ChatResp,
            Command::GroupInOut => {
                let direction = match get_u8(src)? {
                    1 => GroupDirection::In,
                    2 => GroupDirection::Out,
                    other => return Err(WireError::InvalidGroupDirection(other)),
                };
                let count = get_u16(src)? as usize;
                let mut groups = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    groups.push(Addr::decode(src)?);
                }
                Body::GroupInOut(MsgGroupInOut { direction, groups })
            }
            Command::Kill => Body::Kill(MsgKill {
                login_at: get_u64(src)?,
            }),
            Command::Loc => Body::Loc(MsgLoc {
                target: Addr::decode(src)?,
                peer: Addr::decode(src)?,
                server: Addr::decode(src)?,
            }),
            Command::Offline => {
                let peer = Addr::decode(src)?;
                let count = get_u16(src)? as usize;
                let mut targets = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    targets.push(Addr::decode(src)?);
                }
                let notice = get_u8(src)?;
                Body::Offline(MsgOffline {
                    peer,
                    targets,
                    notice,
                })
            }
            Command::OfflineNotice => Body::OfflineNotice(MsgOfflineNotice {
                peer: Addr::decode(src)?,
            }),
            Command::QueryClient => Body::QueryClient(MsgQueryClient {
                peer: Addr::decode(src)?,
            }),
            Command::QueryClientResp => Body::QueryClientResp(MsgQueryClientResp {
                login_at: get_u32(src)?,
            }),
            Command::QueryServers => Body::QueryServers,
            Command::QueryServersResp => {
                let count = get_u16(src)? as usize;
                let mut servers = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    servers.push(ServerEntry {
                        addr: get_str16(src)?,
                        client_url: get_str16(src)?,
                        server_url: get_str16(src)?,
                    });
                }
                Body::QueryServersResp(MsgQueryServersResp { servers })
            }
            Command::LoginAck => Body::LoginAck(MsgLoginAck {
                login_at: get_u64(src)?,
            }),
        };
        Ok(body)
    }
}

/// A complete message: header plus the body its command requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    /// Build a message; the header's command is taken from the body.
    pub fn new(source: Addr, dest: Addr, body: Body) -> Self {
        Self {
            header: Header {
                seq: 0,
                ack_seq: 0,
                command: body.command(),
                status: Status::None,
                source,
                dest,
            },
            body,
        }
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        self.header.encode(dst);
        self.body.encode(dst);
    }

    /// Encode into a fresh buffer.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        let header = Header::decode(src)?;
        let body = Body::decode(header.command, src)?;
        Ok(Self { header, body })
    }
}

// ── encoding helpers ─────────────────────────────────────────────────

fn need(src: &impl Buf, n: usize) -> Result<(), WireError> {
    if src.remaining() < n {
        return Err(WireError::Truncated {
            needed: n - src.remaining(),
        });
    }
    Ok(())
}

fn get_u8(src: &mut impl Buf) -> Result<u8, WireError> {
    need(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut impl Buf) -> Result<u16, WireError> {
    need(src, 2)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut impl Buf) -> Result<u32, WireError> {
    need(src, 4)?;
    Ok(src.get_u32())
}

fn get_u64(src: &mut impl Buf) -> Result<u64, WireError> {
    need(src, 8)?;
    Ok(src.get_u64())
}

fn put_str16(dst: &mut impl BufMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
}

fn put_str32(dst: &mut impl BufMut, s: &str) {
    dst.put_u32(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

fn get_bytes(src: &mut impl Buf, len: usize) -> Result<String, WireError> {
    need(src, len)?;
    let mut raw = vec![0u8; len];
    src.copy_to_slice(&mut raw);
    let s = std::str::from_utf8(&raw)?;
    Ok(s.to_string())
}

fn get_str16(src: &mut impl Buf) -> Result<String, WireError> {
    let len = get_u16(src)? as usize;
    get_bytes(src, len)
}

fn get_str32(src: &mut impl Buf) -> Result<String, WireError> {
    let len = get_u32(src)? as usize;
    get_bytes(src, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn client(id: &str) -> Addr {
        Addr::client(1, 0, id).unwrap()
    }

    fn sample_messages() -> Vec<Message> {
        let c1 = client("c1");
        let c2 = client("c2");
        let s1 = Addr::server("hub-a").unwrap();
        let s2 = Addr::server("hub-b").unwrap();
        let g = Addr::group(1, "lobby").unwrap();

        vec![
            Message::new(
                c1,
                c2,
                Body::Chat(MsgChat {
                    kind: 1,
                    text: "hello".into(),
                    extra: String::new(),
                }),
            ),
            Message::new(c1, g, Body::Chat(MsgChat::default())),
            Message::new(s1, c1, Body::ChatResp),
            Message::new(
                c1,
                s1,
                Body::GroupInOut(MsgGroupInOut {
                    direction: GroupDirection::In,
                    groups: vec![g, Addr::group(1, "ops").unwrap()],
                }),
            ),
            Message::new(c1, c1, Body::Kill(MsgKill { login_at: 1_719_392_000_123 })),
            Message::new(
                s2,
                s1,
                Body::Loc(MsgLoc {
                    target: c1,
                    peer: c2,
                    server: s2,
                }),
            ),
            Message::new(
                s2,
                s1,
                Body::Offline(MsgOffline {
                    peer: c2,
                    targets: vec![c1],
                    notice: 1,
                }),
            ),
            Message::new(s1, c1, Body::OfflineNotice(MsgOfflineNotice { peer: c2 })),
            Message::new(s2, s1, Body::QueryClient(MsgQueryClient { peer: c1 })),
            Message::new(
                s1,
                s2,
                Body::QueryClientResp(MsgQueryClientResp { login_at: 1_719_392_000 }),
            ),
            Message::new(s2, s1, Body::QueryServers),
            Message::new(
                s1,
                s2,
                Body::QueryServersResp(MsgQueryServersResp {
                    servers: vec![ServerEntry {
                        addr: "s0.0/hub-a".into(),
                        client_url: "ws://10.0.0.1:8380".into(),
                        server_url: "ws://10.0.0.1:8380".into(),
                    }],
                }),
            ),
            Message::new(s1, c1, Body::LoginAck(MsgLoginAck { login_at: 99 })),
        ]
    }

    #[test]
    fn every_variant_roundtrips() {
        for mut msg in sample_messages() {
            msg.header.seq = 7;
            msg.header.ack_seq = 3;
            msg.header.status = Status::Ok;
            let bytes = msg.encode_to_vec();
            let decoded = Message::decode(&mut bytes.as_slice()).unwrap();
            assert_eq!(decoded, msg, "variant {:?}", msg.header.command);
        }
    }

    // ── randomized instances ─────────────────────────────────────────

    fn rand_string(rng: &mut impl Rng, max_len: usize) -> String {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-_./:@ ";
        let len = rng.random_range(0..=max_len);
        (0..len)
            .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
            .collect()
    }

    fn rand_addr(rng: &mut impl Rng) -> Addr {
        let domain = rng.random::<u32>();
        match rng.random_range(1..=4u8) {
            1 => Addr::client(domain, rng.random(), &rand_id(rng)).unwrap(),
            2 => Addr::server(&rand_id(rng)).unwrap(),
            3 => Addr::group(domain, &rand_id(rng)).unwrap(),
            _ => Addr::broadcast(domain),
        }
    }

    fn rand_id(rng: &mut impl Rng) -> String {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-_";
        let len = rng.random_range(1..=crate::MAX_ID_LEN);
        (0..len)
            .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
            .collect()
    }

    fn rand_addrs(rng: &mut impl Rng, max: usize) -> Vec<Addr> {
        (0..rng.random_range(0..=max)).map(|_| rand_addr(rng)).collect()
    }

    fn rand_body(rng: &mut impl Rng) -> Body {
        match rng.random_range(1..=12u8) {
            1 => Body::Chat(MsgChat {
                kind: rng.random(),
                text: rand_string(rng, 64),
                extra: rand_string(rng, 32),
            }),
            2 => Body::ChatResp,
            3 => Body::GroupInOut(MsgGroupInOut {
                direction: if rng.random() {
                    GroupDirection::In
                } else {
                    GroupDirection::Out
                },
                groups: rand_addrs(rng, 8),
            }),
            4 => Body::Kill(MsgKill {
                login_at: rng.random(),
            }),
            5 => Body::Loc(MsgLoc {
                target: rand_addr(rng),
                peer: rand_addr(rng),
                server: rand_addr(rng),
            }),
            6 => Body::Offline(MsgOffline {
                peer: rand_addr(rng),
                targets: rand_addrs(rng, 8),
                notice: rng.random_range(0..=1),
            }),
            7 => Body::OfflineNotice(MsgOfflineNotice {
                peer: rand_addr(rng),
            }),
            8 => Body::QueryClient(MsgQueryClient {
                peer: rand_addr(rng),
            }),
            9 => Body::QueryClientResp(MsgQueryClientResp {
                login_at: rng.random(),
            }),
            10 => Body::QueryServers,
            11 => Body::QueryServersResp(MsgQueryServersResp {
                servers: (0..rng.random_range(0..=5))
                    .map(|_| ServerEntry {
                        addr: rand_string(rng, 24),
                        client_url: rand_string(rng, 40),
                        server_url: rand_string(rng, 40),
                    })
                    .collect(),
            }),
            _ => Body::LoginAck(MsgLoginAck {
                login_at: rng.random(),
            }),
        }
    }

    fn rand_message(rng: &mut impl Rng) -> Message {
        let mut msg = Message::new(rand_addr(rng), rand_addr(rng), rand_body(rng));
        msg.header.seq = rng.random();
        msg.header.ack_seq = rng.random();
        msg.header.status = Status::try_from(rng.random_range(0..=4u8)).unwrap();
        msg
    }

    #[test]
    fn random_instances_roundtrip() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let msg = rand_message(&mut rng);
            let bytes = msg.encode_to_vec();
            let decoded = Message::decode(&mut bytes.as_slice())
                .unwrap_or_else(|e| panic!("decode failed for {msg:?}: {e}"));
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn header_decode_rejects_unknown_command() {
        let mut msg = sample_messages().remove(0);
        msg.header.seq = 1;
        let mut bytes = msg.encode_to_vec();
        bytes[8] = 200; // command byte
        assert!(matches!(
            Message::decode(&mut bytes.as_slice()),
            Err(WireError::UnknownCommand(200))
        ));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let msg = sample_messages().remove(0);
        let bytes = msg.encode_to_vec();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            Message::decode(&mut &cut[..]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn server_entry_json_shape() {
        let entry = ServerEntry {
            addr: "s0.0/hub-a".into(),
            client_url: "ws://h:1".into(),
            server_url: "ws://h:2".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"Addr\""));
        assert!(json.contains("\"ClientURL\""));
        assert!(json.contains("\"ServerURL\""));
    }
}
