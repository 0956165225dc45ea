//! Error types for flexlink.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! session-layer errors are all captured here.

/// The error type for all flexlink operations.
///
/// Variants cover the full range of failure modes encountered when talking
/// to a SmartSDR radio: socket and TLS failures, malformed protocol lines
/// and packets, command rejections, timeouts, and auth problems on the WAN
/// path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (TCP socket, TLS handshake, UDP send).
    ///
    /// Fatal to the session it occurred on; the control connection reacts
    /// by tearing down and reporting `Disconnected`.
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed line, bad VITA-49 header, invalid
    /// key=value token). Non-fatal: the offending line or datagram is
    /// dropped and the session continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The radio rejected a command with a non-zero result code.
    ///
    /// The code is the eight-hex-digit result from the `R` line, kept
    /// verbatim. Surfaced to the caller that registered the completion;
    /// never fatal to the session.
    #[error("command failed {code}: {message}")]
    Response {
        /// Result code from the response line (e.g. `"50000015"`).
        code: String,
        /// Free-form message payload, possibly empty.
        message: String,
    },

    /// Timed out waiting for the radio (connect handshake, command
    /// response, or token acquisition).
    #[error("timeout waiting for radio")]
    Timeout,

    /// A UDP stream could not be set up (typically a bind failure when the
    /// DAX port is already in use). Surfaced upward without killing the
    /// control session.
    #[error("stream error: {0}")]
    Stream(String),

    /// Authentication failure: broker registration rejected or the bearer
    /// token expired. The user must re-authenticate.
    #[error("auth error: {0}")]
    Auth(String),

    /// A local resource failed to initialize (Opus decoder, audio device).
    /// Non-fatal; WAN audio may degrade or be absent.
    #[error("resource error: {0}")]
    Resource(String),

    /// An invalid parameter was passed to an engine API.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the radio has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the radio was lost unexpectedly. Pending command
    /// completions observe this when the session goes away underneath them.
    #[error("connection lost")]
    ConnectionLost,

    /// An audio or data stream was closed unexpectedly (the other end of
    /// the channel was dropped).
    #[error("stream closed")]
    StreamClosed,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
