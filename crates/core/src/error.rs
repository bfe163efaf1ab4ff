//! Error types for the LanMsg protocol engine.
//!
//! Transport and parse failures are absorbed where they happen: the receive
//! loops log and continue, and a malformed datagram is never answered.
//! Transfer outcomes are the only errors that travel: they reach the
//! subscriber as [`crate::events::Event::FileError`] carrying the token that
//! identifies the transfer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Datagram failed the frame parse. Dropped silently by dispatch.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A bulk TCP request quoted a (packet_no, file_id) pair that is not
    /// registered. The connection is closed with no data and no diagnostic.
    #[error("unknown transfer token {packet_no}/{file_id}")]
    UnknownTransferToken { packet_no: u64, file_id: u32 },

    /// The stream ended before the announced byte count arrived. The partial
    /// file is kept on disk so the peer can resume by offset.
    #[error("incomplete transfer: received {received} of {expected} bytes")]
    IncompleteTransfer { expected: u64, received: u64 },

    /// The TCP dial to the sender's transfer port never completed.
    #[error("connect timed out after {0} seconds")]
    ConnectTimeout(u64),

    /// A socket could not be bound at startup. Fatal for the control port;
    /// the bulk listener merely disables serving.
    #[error("failed to bind {what} port {port}: {source}")]
    Bind {
        what: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// An operation needed the engine's sockets before `start()` ran.
    #[error("engine not started")]
    NotStarted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
