//! Logical addresses.
//!
//! An [`Addr`] names a routable endpoint in the mesh: a client, a hub
//! server, a multicast group, or a whole-domain broadcast. Addresses are
//! small value types (`Copy`, comparable, hashable) so routing tables
//! can key on them directly.
//!
//! Wire encoding: `kind:u8, domain:u32, device:u8, id_len:u8, id:bytes`.
//! Text form: `{k}{domain}.{device}/{id}` with `k` one of `c`/`s`/`g`/`b`,
//! e.g. `c1.0/alice`, `s0.0/1719392000`, `g1.0/lobby`, `b1.0/`.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};

use crate::WireError;

/// Maximum length of the id component, in bytes.
pub const MAX_ID_LEN: usize = 16;

/// What an address names.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddrKind {
    Client = 1,
    Server = 2,
    Group = 3,
    Broadcast = 4,
}

impl AddrKind {
    fn symbol(self) -> char {
        match self {
            Self::Client => 'c',
            Self::Server => 's',
            Self::Group => 'g',
            Self::Broadcast => 'b',
        }
    }

    fn from_symbol(c: char) -> Option<Self> {
        match c {
            'c' => Some(Self::Client),
            's' => Some(Self::Server),
            'g' => Some(Self::Group),
            'b' => Some(Self::Broadcast),
            _ => None,
        }
    }
}

impl TryFrom<u8> for AddrKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Client),
            2 => Ok(Self::Server),
            3 => Ok(Self::Group),
            4 => Ok(Self::Broadcast),
            other => Err(WireError::UnknownAddrKind(other)),
        }
    }
}

/// A packed logical address: kind, domain, device, and an id of up to
/// [`MAX_ID_LEN`] bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr {
    kind: AddrKind,
    domain: u32,
    device: u8,
    id_len: u8,
    id: [u8; MAX_ID_LEN],
}

impl Addr {
    /// Build an address from parts. Fails if `id` exceeds [`MAX_ID_LEN`].
    pub fn new(kind: AddrKind, domain: u32, device: u8, id: &str) -> Result<Self, WireError> {
        let raw = id.as_bytes();
        if raw.len() > MAX_ID_LEN {
            return Err(WireError::IdTooLong(raw.len()));
        }
        let mut buf = [0u8; MAX_ID_LEN];
        buf[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            kind,
            domain,
            device,
            id_len: raw.len() as u8,
            id: buf,
        })
    }

    /// A client endpoint.
    pub fn client(domain: u32, device: u8, id: &str) -> Result<Self, WireError> {
        Self::new(AddrKind::Client, domain, device, id)
    }

    /// A hub server. Servers live outside any tenant domain.
    pub fn server(id: &str) -> Result<Self, WireError> {
        Self::new(AddrKind::Server, 0, 0, id)
    }

    /// A multicast group within a domain.
    pub fn group(domain: u32, id: &str) -> Result<Self, WireError> {
        Self::new(AddrKind::Group, domain, 0, id)
    }

    /// The broadcast address of a domain.
    pub fn broadcast(domain: u32) -> Self {
        Self {
            kind: AddrKind::Broadcast,
            domain,
            device: 0,
            id_len: 0,
            id: [0u8; MAX_ID_LEN],
        }
    }

    pub fn kind(&self) -> AddrKind {
        self.kind
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }

    pub fn device(&self) -> u8 {
        self.device
    }

    pub fn id(&self) -> &str {
        // Constructors only accept &str ids, so this cannot fail.
        std::str::from_utf8(&self.id[..self.id_len as usize]).unwrap_or("")
    }

    /// Encoded size on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + 1 + 1 + self.id_len as usize
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.domain);
        dst.put_u8(self.device);
        dst.put_u8(self.id_len);
        dst.put_slice(&self.id[..self.id_len as usize]);
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < 7 {
            return Err(WireError::Truncated {
                needed: 7 - src.remaining(),
            });
        }
        let kind = AddrKind::try_from(src.get_u8())?;
        let domain = src.get_u32();
        let device = src.get_u8();
        let id_len = src.get_u8() as usize;
        if id_len > MAX_ID_LEN {
            return Err(WireError::IdTooLong(id_len));
        }
        if src.remaining() < id_len {
            return Err(WireError::Truncated {
                needed: id_len - src.remaining(),
            });
        }
        let mut id = [0u8; MAX_ID_LEN];
        src.copy_to_slice(&mut id[..id_len]);
        std::str::from_utf8(&id[..id_len])?;
        Ok(Self {
            kind,
            domain,
            device,
            id_len: id_len as u8,
            id,
        })
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}.{}/{}",
            self.kind.symbol(),
            self.domain,
            self.device,
            self.id()
        )
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({self})")
    }
}

impl FromStr for Addr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || WireError::InvalidAddr(s.to_string());

        let mut chars = s.chars();
        let kind = chars.next().and_then(AddrKind::from_symbol).ok_or_else(bad)?;
        let rest = chars.as_str();

        let (head, id) = rest.split_once('/').ok_or_else(bad)?;
        let (domain, device) = head.split_once('.').ok_or_else(bad)?;
        let domain: u32 = domain.parse().map_err(|_| bad())?;
        let device: u8 = device.parse().map_err(|_| bad())?;

        Addr::new(kind, domain, device, id)
    }
}
