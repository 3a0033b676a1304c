use std::io;

use skein_wire::WireError;

/// Errors from the hub and its connection plumbing.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("peer is not on this server")]
    PeerNotFound,

    #[error("peer send queue is full")]
    QueueFull,

    #[error("peer connection is gone")]
    PeerGone,

    #[error("hub is shut down")]
    HubClosed,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("seed request failed: {0}")]
    Seed(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
