//! Clustered real-time messaging hub.
//!
//! One `skein-server` process owns a set of client connections and
//! relays for the rest of the mesh: unicast to clients, multicast to
//! groups, broadcast to domains, and hub-to-hub control. Routing state
//! has a single writer, the [`hub`] dispatcher, while [`peer`] pumps
//! and [`group`] actors carry the I/O.

pub mod cluster;
pub mod config;
pub mod error;
pub mod filelog;
pub mod group;
pub mod http;
pub mod hub;
pub mod peer;
pub mod store;
pub mod transport;

pub use error::HubError;
