// ==============================================================================
// crates/core/src/transfer/mod.rs - Transfer Registry and Pending Tables
// ==============================================================================

//! Bookkeeping for negotiated file transfers.
//!
//! An announced file is registered under a (packet_no, file_id) pair, the
//! transfer token. The pair is a capability: whoever quotes it on the bulk
//! TCP channel gets the bytes, so the sender-side table is the single
//! authority on what may be streamed. The registry is an owned object passed
//! to the server and receiver tasks rather than process-wide state, which
//! lets tests run several independent engines in one process.

pub mod receiver;
pub mod server;

use crate::protocol::payload::FileDescriptor;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Size of the reused read/write buffer on both stream directions.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// The (packet_no, file_id) capability pair authorizing one file pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken {
    pub packet_no: u64,
    pub file_id: u32,
}

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.packet_no, self.file_id)
    }
}

/// A local file announced to a peer, awaiting its GETFILEDATA.
#[derive(Debug, Clone)]
pub struct PendingOutboundFile {
    pub token: TransferToken,
    /// Peer the announcement went to; lets an exit broadcast void the token.
    pub peer: IpAddr,
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub mtime: u64,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// An accepted remote file being pulled over TCP.
#[derive(Debug, Clone)]
pub struct PendingInboundFile {
    pub token: TransferToken,
    pub peer: IpAddr,
    pub filename: String,
    pub size: u64,
    pub dest: PathBuf,
    pub received: u64,
}

/// An inbound announcement surfaced to the subscriber. Accepting hands one
/// of its descriptors back to the engine together with the sender address
/// and packet number.
#[derive(Debug, Clone)]
pub struct FileOffer {
    pub from: SocketAddr,
    pub sender: String,
    pub packet_no: u64,
    pub text: String,
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Default)]
struct Tables {
    outbound: HashMap<TransferToken, PendingOutboundFile>,
    inbound: HashMap<TransferToken, PendingInboundFile>,
}

/// Synchronized transfer state shared by the UDP dispatch task and every
/// bulk TCP worker. No operation spans more than one lock acquisition, and
/// take-for-streaming is a single lookup+remove so two connections quoting
/// the same token can never both stream.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    tables: Mutex<Tables>,
    file_id_counter: AtomicU32,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a file id distinct from every other one this registry handed
    /// out: low 16 bits count up, high 16 bits carry the clock.
    pub fn next_file_id(&self) -> u32 {
        let secs = chrono::Utc::now().timestamp() as u32;
        let counter = self.file_id_counter.fetch_add(1, Ordering::Relaxed);
        (secs & 0xffff) << 16 | (counter & 0xffff)
    }

    pub fn register_outbound(&self, entry: PendingOutboundFile) {
        self.tables
            .lock()
            .unwrap()
            .outbound
            .insert(entry.token, entry);
    }

    /// Atomically claim an announced file for streaming. The entry leaves
    /// the table here and comes back via [`restore_outbound`] only if the
    /// stream fails, keeping offset-resume possible.
    ///
    /// [`restore_outbound`]: TransferRegistry::restore_outbound
    pub fn take_outbound(&self, token: TransferToken) -> Option<PendingOutboundFile> {
        self.tables.lock().unwrap().outbound.remove(&token)
    }

    pub fn restore_outbound(&self, entry: PendingOutboundFile) {
        self.tables
            .lock()
            .unwrap()
            .outbound
            .insert(entry.token, entry);
    }

    pub fn register_inbound(&self, entry: PendingInboundFile) {
        self.tables
            .lock()
            .unwrap()
            .inbound
            .insert(entry.token, entry);
    }

    /// Advance the byte counter of an active pull. Returns false when the
    /// entry is gone: the transfer was cancelled underneath the worker.
    pub fn update_inbound(&self, token: TransferToken, received: u64) -> bool {
        match self.tables.lock().unwrap().inbound.get_mut(&token) {
            Some(entry) => {
                entry.received = received;
                true
            }
            None => false,
        }
    }

    /// Close out an inbound transfer. `None` means it was cancelled while
    /// the worker ran, and no completion event should be raised.
    pub fn finish_inbound(&self, token: TransferToken) -> Option<PendingInboundFile> {
        self.tables.lock().unwrap().inbound.remove(&token)
    }

    /// Void all transfer state tied to a departed peer. Outbound tokens
    /// simply die; inbound entries are returned so the engine can surface
    /// an error for each pull that never finished.
    pub fn cancel_peer(&self, addr: IpAddr) -> Vec<PendingInboundFile> {
        let mut tables = self.tables.lock().unwrap();
        tables.outbound.retain(|_, e| e.peer != addr);
        let dead: Vec<TransferToken> = tables
            .inbound
            .values()
            .filter(|e| e.peer == addr)
            .map(|e| e.token)
            .collect();
        dead.into_iter()
            .filter_map(|t| tables.inbound.remove(&t))
            .collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.tables.lock().unwrap().outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.tables.lock().unwrap().inbound.len()
    }
}
