//! Wire protocol for the skein messaging mesh.
//!
//! Everything a hub or client needs to talk on the wire: logical
//! [`Addr`]esses, the typed [`Message`] model (header + command-keyed
//! body), and [`FrameCodec`], a length-prefixed framing codec for use
//! with `tokio_util::codec::Framed`.
//!
//! All integers are big-endian. Strings are length-prefixed: `u16` for
//! short fields (ids, URLs), `u32` for chat text and extra payloads.

mod addr;
mod codec;
mod error;
mod message;

pub use addr::{Addr, AddrKind, MAX_ID_LEN};
pub use codec::FrameCodec;
pub use error::WireError;
pub use message::{
    Body, Command, Header, Message, MsgChat, MsgGroupInOut, MsgKill, MsgLoc, MsgLoginAck,
    MsgOffline, MsgOfflineNotice, MsgQueryClient, MsgQueryClientResp, MsgQueryServersResp,
    GroupDirection, ServerEntry, Status,
};
