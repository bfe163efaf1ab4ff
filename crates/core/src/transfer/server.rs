// ==============================================================================
// crates/core/src/transfer/server.rs - Bulk Transfer TCP Server
// ==============================================================================

//! Sender side of the bulk channel: a TCP listener on the fixed transfer
//! port. Each accepted connection quotes one request line, is matched
//! against the outbound table, and gets its file streamed by a dedicated
//! worker task. Workers are independent; any number of simultaneous pulls
//! is fine, each isolated by its own connection.

use crate::error::Error;
use crate::events::{self, Direction, Event, EventSender};
use crate::protocol::payload::parse_data_request;
use crate::transfer::{PendingOutboundFile, TransferRegistry, TransferToken, CHUNK_SIZE};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Accept poll granularity; bounds how long shutdown can go unnoticed.
const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// How long a connection may dawdle before sending its request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bulk transfer server. One per engine, sharing the control port number.
pub struct BulkServer {
    registry: Arc<TransferRegistry>,
    events: EventSender,
    running: Arc<RwLock<bool>>,
}

impl BulkServer {
    pub fn new(
        registry: Arc<TransferRegistry>,
        events: EventSender,
        running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            registry,
            events,
            running,
        }
    }

    /// Bind the transfer listener. Failure here disables serving but is not
    /// fatal to the engine; the caller decides whether to tolerate it.
    pub async fn bind(port: u16) -> Result<TcpListener, Error> {
        TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| Error::Bind {
                what: "bulk transfer",
                port,
                source,
            })
    }

    /// Run the accept loop until the running flag drops.
    pub fn spawn(self, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("📂 Bulk transfer server listening on {:?}", listener.local_addr().ok());
            loop {
                if !*self.running.read().await {
                    break;
                }
                match timeout(ACCEPT_POLL, listener.accept()).await {
                    Ok(Ok((stream, addr))) => {
                        debug!("📞 Bulk connection from {}", addr);
                        let registry = Arc::clone(&self.registry);
                        let events = self.events.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, registry, events).await;
                        });
                    }
                    Ok(Err(e)) => {
                        if *self.running.read().await {
                            warn!("Bulk accept error: {}", e);
                        }
                    }
                    Err(_) => continue, // poll tick, re-check the flag
                }
            }
            info!("📂 Bulk transfer server stopped");
        })
    }
}

/// Per-connection worker: one request line, one stream, one close.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<TransferRegistry>,
    events: EventSender,
) {
    let mut buf = [0u8; 256];
    let n = match timeout(REQUEST_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => n,
        Ok(Ok(_)) => return,
        Ok(Err(e)) => {
            debug!("Request read from {} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            debug!("Request from {} timed out", addr);
            return;
        }
    };

    let line = String::from_utf8_lossy(&buf[..n]);
    let (packet_no, file_id, offset) = match parse_data_request(&line) {
        Ok(triple) => triple,
        Err(_) => {
            debug!("Unparseable bulk request from {}", addr);
            return;
        }
    };
    let token = TransferToken { packet_no, file_id };

    // Atomic claim: a second connection quoting the same token finds
    // nothing and is closed without data or diagnostic.
    let entry = match registry.take_outbound(token) {
        Some(entry) => entry,
        None => {
            let e = Error::UnknownTransferToken { packet_no, file_id };
            debug!("Closing bulk connection from {}: {}", addr, e);
            return;
        }
    };

    info!(
        "📤 Streaming {} ({} bytes, offset {}) to {}",
        entry.filename, entry.size, offset, addr
    );

    match stream_file(&mut stream, &entry, offset, &events).await {
        Ok(sent) => {
            debug!("Sent {} bytes of {} to {}", sent, entry.filename, addr);
            events::emit(
                &events,
                Event::FileComplete {
                    token,
                    direction: Direction::Outbound,
                    path: entry.path.clone(),
                },
            );
        }
        Err(e) => {
            warn!("Stream of {} to {} failed: {}", entry.filename, addr, e);
            // Keep the token alive so the receiver can resume by offset.
            registry.restore_outbound(entry);
            events::emit(
                &events,
                Event::FileError {
                    token,
                    direction: Direction::Outbound,
                    reason: e.to_string(),
                },
            );
        }
    }
}

/// Stream `entry` from `offset` to end of file in fixed-size chunks. The
/// buffer is reused per step; the file is never held in memory whole.
async fn stream_file(
    stream: &mut TcpStream,
    entry: &PendingOutboundFile,
    offset: u64,
    events: &EventSender,
) -> Result<u64, Error> {
    let mut file = tokio::fs::File::open(&entry.path).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;
        events::emit(
            events,
            Event::FileProgress {
                token: entry.token,
                direction: Direction::Outbound,
                transferred: offset + sent,
                total: entry.size,
            },
        );
    }
    stream.shutdown().await?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::encode_data_request;
    use std::net::IpAddr;
    use std::path::PathBuf;

    async fn start_server(registry: Arc<TransferRegistry>) -> (SocketAddr, EventSender) {
        let (tx, _rx) = events::channel();
        let running = Arc::new(RwLock::new(true));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        BulkServer::new(registry, tx.clone(), running).spawn(listener);
        (addr, tx)
    }

    fn register_file(
        registry: &TransferRegistry,
        token: TransferToken,
        path: PathBuf,
        size: u64,
    ) {
        registry.register_outbound(PendingOutboundFile {
            token,
            peer: IpAddr::from([127, 0, 0, 1]),
            path,
            filename: "f".into(),
            size,
            mtime: 0,
            registered_at: chrono::Utc::now(),
        });
    }

    async fn pull(addr: SocketAddr, token: TransferToken, offset: u64) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let line = encode_data_request(token.packet_no, token.file_id, offset);
        stream.write_all(line.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn offset_resume_returns_exact_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let registry = Arc::new(TransferRegistry::new());
        let token = TransferToken {
            packet_no: 1001,
            file_id: 42,
        };
        register_file(&registry, token, path, content.len() as u64);
        let (addr, _tx) = start_server(Arc::clone(&registry)).await;

        let got = pull(addr, token, 4000).await;
        assert_eq!(got.len(), 6000);
        assert_eq!(got, content[4000..]);
    }

    #[tokio::test]
    async fn unknown_token_closes_without_data() {
        let registry = Arc::new(TransferRegistry::new());
        let (addr, _tx) = start_server(registry).await;

        let got = pull(
            addr,
            TransferToken {
                packet_no: 9,
                file_id: 9,
            },
            0,
        )
        .await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn concurrent_pulls_do_not_cross_talk() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.bin");
        let path_b = dir.path().join("b.bin");
        let content_a = vec![0xaau8; 200_000];
        let content_b = vec![0xbbu8; 150_000];
        tokio::fs::write(&path_a, &content_a).await.unwrap();
        tokio::fs::write(&path_b, &content_b).await.unwrap();

        let registry = Arc::new(TransferRegistry::new());
        let token_a = TransferToken {
            packet_no: 1,
            file_id: 1,
        };
        let token_b = TransferToken {
            packet_no: 2,
            file_id: 2,
        };
        register_file(&registry, token_a, path_a, content_a.len() as u64);
        register_file(&registry, token_b, path_b, content_b.len() as u64);
        let (addr, _tx) = start_server(registry).await;

        let (got_a, got_b) = tokio::join!(pull(addr, token_a, 0), pull(addr, token_b, 0));
        assert_eq!(got_a, content_a);
        assert_eq!(got_b, content_b);
    }

    #[tokio::test]
    async fn second_claim_of_same_token_gets_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("once.bin");
        tokio::fs::write(&path, vec![1u8; 1000]).await.unwrap();

        let registry = Arc::new(TransferRegistry::new());
        let token = TransferToken {
            packet_no: 5,
            file_id: 5,
        };
        register_file(&registry, token, path, 1000);
        let (addr, _tx) = start_server(registry).await;

        let first = pull(addr, token, 0).await;
        assert_eq!(first.len(), 1000);
        let second = pull(addr, token, 0).await;
        assert!(second.is_empty());
    }
}
