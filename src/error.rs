//! Error types for the VNC server library.

use std::io;
use thiserror::Error;

/// Result type for VNC operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur in VNC server operations.
#[derive(Debug, Error)]
pub enum VncError {
    /// Transport-level I/O error (socket read/write, accept, shutdown).
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Malformed or out-of-sequence RFB protocol data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// VNC authentication (security handshake) failed.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Pixel format conversion or encoder failure.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Framebuffer capture or change-detection failure.
    #[error("capture error: {0}")]
    Capture(String),

    /// Invalid configuration supplied to the server or a session.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl VncError {
    /// True if this error reflects a peer-initiated close rather than a
    /// genuine fault; callers use this to decide whether to log at
    /// `error` or `info` level.
    pub fn is_peer_disconnect(&self) -> bool {
        matches!(self, VncError::Transport(e) if matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
        ))
    }
}
