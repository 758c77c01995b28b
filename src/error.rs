use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    /// Low-level I/O failure on the pty or a child process handle.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Pty allocation or termios manipulation failed.
    #[error("pty error: {0}")]
    Pty(#[from] nix::Error),
    /// The control client program could not be started.
    #[error("cannot run control client {program:?}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The line channel closed while an operation was in flight.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    /// Invalid or empty interface name provided by the caller.
    #[error("invalid interface name: {0}")]
    InvalidInterface(String),
    /// Configuration file missing, unparseable or failing validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// Too many consecutive control-client connection errors.
    #[error("control client failed {0} consecutive times")]
    TooManyClientFailures(u32),
}
