//! Crate-level error type.
//!
//! Parsing failures ([`crate::packet::PacketError`]) and sink failures
//! ([`crate::sink::SinkError`]) are handled where they happen and never
//! stop ingestion; this type covers what reaches a caller.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::sink::SinkError;

#[derive(Debug, Error)]
pub enum Error {
    /// The receiving socket could not be bound.  Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
