use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of a single transcoder process.
#[derive(Error, Debug)]
pub enum TranscoderError {
    #[error("failed to launch transcoder {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write after transcoder input was closed")]
    WriteAfterClose,

    #[error("failed to write to transcoder input: {0}")]
    Write(#[source] io::Error),

    #[error("transcoder {pid} did not exit within {grace:?}, killing it")]
    TerminationTimeout { pid: u32, grace: Duration },

    #[error("supervisor is shutting down")]
    SupervisorClosed,
}

/// Reasons an inbound event was rejected by the router.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("invalid platform {0:?}")]
    InvalidPlatform(String),

    #[error("unknown session")]
    UnknownSession,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Launch(#[from] TranscoderError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid listen address {value:?}: {source}")]
    ListenAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("invalid grace period {value:?}: expected a positive number of seconds")]
    GracePeriod { value: String },
}
