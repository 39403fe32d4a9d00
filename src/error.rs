//! Configuration-time error types. Per spec §7, only configuration errors (bad CLI, bad ACL,
//! DNS/hello failure) propagate as `Result`s all the way to `main`; per-channel failures never
//! leave the channel as a Rust error (see [`crate::channel::ChannelOutcome`]).

use thiserror::Error;

use crate::acl::AclError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("ACL rule is invalid: {0}")]
    Acl(#[from] AclError),
    #[error("verbosity must be between 0 and 3, got {0}")]
    BadVerbosity(u8),
    #[error("exactly one of -s (server) or -c (client) is required")]
    MissingMode,
    #[error("-s and -c are mutually exclusive")]
    ConflictingMode,
    #[error("client mode requires -t (tunnel peer) and -r (remote destination)")]
    MissingClientTarget,
    #[error("-r must be HOST:PORT, got: {0}")]
    BadRemoteTarget(String),
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: no HELLO_ACK received after {0} attempts")]
    HelloTimedOut(u32),
}
