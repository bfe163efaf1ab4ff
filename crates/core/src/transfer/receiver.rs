// ==============================================================================
// crates/core/src/transfer/receiver.rs - Bulk Transfer Pull Client
// ==============================================================================

//! Receiver side of the bulk channel. After the UDP control leg announces
//! our GETFILEDATA, this worker dials the sender's fixed transfer port,
//! quotes the same token as a request line, and writes the stream to the
//! destination path incrementally. Success is declared only on an exact
//! byte-count match with the announced size; anything short surfaces as an
//! incomplete-transfer error and the partial file stays on disk so a later
//! attempt can resume from its length.

use crate::error::Error;
use crate::events::{self, Direction, Event, EventSender};
use crate::protocol::payload::encode_data_request;
use crate::transfer::{TransferRegistry, TransferToken, CHUNK_SIZE};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Everything a pull worker needs to run independently of the engine.
#[derive(Debug, Clone)]
pub struct PullRequest {
    /// Sender's address with the bulk transfer port.
    pub sender: SocketAddr,
    pub token: TransferToken,
    pub filename: String,
    /// Announced total size of the file.
    pub size: u64,
    pub dest: PathBuf,
    /// Byte offset to resume from; zero starts fresh.
    pub offset: u64,
    pub connect_timeout: Duration,
}

/// Run one inbound transfer to completion. The corresponding
/// `PendingInboundFile` must already be registered; it is removed here on
/// any exit path, and no completion event is raised if the transfer was
/// cancelled underneath us (peer exit) while we streamed.
pub async fn pull_file(req: PullRequest, registry: Arc<TransferRegistry>, events: EventSender) {
    let token = req.token;
    match run_pull(&req, &registry, &events).await {
        Ok(()) => {
            if registry.finish_inbound(token).is_some() {
                info!("📥 Received {} into {:?}", req.filename, req.dest);
                events::emit(
                    &events,
                    Event::FileComplete {
                        token,
                        direction: Direction::Inbound,
                        path: req.dest.clone(),
                    },
                );
            }
        }
        Err(e) => {
            if registry.finish_inbound(token).is_some() {
                warn!("Pull of {} from {} failed: {}", req.filename, req.sender, e);
                events::emit(
                    &events,
                    Event::FileError {
                        token,
                        direction: Direction::Inbound,
                        reason: e.to_string(),
                    },
                );
            }
        }
    }
}

async fn run_pull(
    req: &PullRequest,
    registry: &TransferRegistry,
    events: &EventSender,
) -> Result<(), Error> {
    let mut stream = match timeout(req.connect_timeout, TcpStream::connect(req.sender)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(Error::ConnectTimeout(req.connect_timeout.as_secs())),
    };
    debug!("Dialed {} for {}", req.sender, req.token);

    let line = encode_data_request(req.token.packet_no, req.token.file_id, req.offset);
    stream.write_all(line.as_bytes()).await?;

    if let Some(parent) = req.dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(req.offset == 0)
        .open(&req.dest)
        .await?;
    if req.offset > 0 {
        file.seek(SeekFrom::Start(req.offset)).await?;
    }

    let expected = req.size.saturating_sub(req.offset);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    while received < expected {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        // Never write past the announced size; trailing noise is dropped.
        let take = (n as u64).min(expected - received) as usize;
        file.write_all(&buf[..take]).await?;
        received += take as u64;
        if registry.update_inbound(req.token, req.offset + received) {
            events::emit(
                events,
                Event::FileProgress {
                    token: req.token,
                    direction: Direction::Inbound,
                    transferred: req.offset + received,
                    total: req.size,
                },
            );
        }
    }
    file.flush().await?;

    if received == expected {
        Ok(())
    } else {
        Err(Error::IncompleteTransfer {
            expected: req.size,
            received: req.offset + received,
        })
    }
}
