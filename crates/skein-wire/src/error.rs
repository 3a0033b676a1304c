use std::io;

/// Errors from the wire protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated message: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    #[error("unknown address kind: {0}")]
    UnknownAddrKind(u8),

    #[error("unknown status code: {0}")]
    UnknownStatus(u8),

    #[error("invalid group direction: {0}")]
    InvalidGroupDirection(u8),

    #[error("address id too long: {0} bytes (max {max})", max = crate::MAX_ID_LEN)]
    IdTooLong(usize),

    #[error("invalid address literal: {0:?}")]
    InvalidAddr(String),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
