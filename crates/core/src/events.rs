//! Engine events delivered to the external collaborator.
//!
//! The protocol core knows nothing about windows or widgets; everything a UI
//! (or the CLI) needs arrives through one typed channel. Subscribers get the
//! receiving half from [`crate::LanmsgCore::new`].

use crate::peers::Peer;
use crate::transfer::{FileOffer, TransferToken};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Which side of a bulk transfer an outcome event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We are streaming a local file out.
    Outbound,
    /// We are pulling a remote file in.
    Inbound,
}

/// Events emitted by the protocol engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer appeared or changed its name/group.
    PeerOnline { peer: Peer },
    /// A peer broadcast its exit, or the liveness sweep expired it.
    PeerOffline { peer: Peer },
    /// Plain chat message.
    Message {
        from: SocketAddr,
        sender: String,
        packet_no: u64,
        text: String,
    },
    /// The peer confirmed delivery of a message we sent with the check
    /// option. `packet_no` is the number of the original message.
    MessageDelivered { from: SocketAddr, packet_no: u64 },
    /// A peer announced one or more files for us to pull.
    FileOffer { offer: FileOffer },
    /// Bytes moved on an active transfer.
    FileProgress {
        token: TransferToken,
        direction: Direction,
        transferred: u64,
        total: u64,
    },
    /// A transfer finished with an exact byte-count match.
    FileComplete {
        token: TransferToken,
        direction: Direction,
        path: PathBuf,
    },
    /// A transfer failed. The partial file, if any, stays on disk.
    FileError {
        token: TransferToken,
        direction: Direction,
        reason: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the engine-to-subscriber channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send an event, ignoring a departed subscriber. The engine never stalls
/// because the UI went away.
pub fn emit(tx: &EventSender, event: Event) {
    let _ = tx.send(event);
}
