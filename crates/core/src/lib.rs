//! LanMsg core library.
//!
//! Protocol engine for IPMSG/FeiQ compatible LAN messaging: UDP broadcast
//! presence, chat messages with delivery receipts, and bulk file transfers
//! negotiated over UDP and carried over TCP. The engine owns the sockets
//! and registries; a UI or CLI drives it through [`LanmsgCore`] and watches
//! the [`events::Event`] stream.

pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod peers;
pub mod protocol;
pub mod transfer;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{Direction, Event, EventReceiver};
pub use peers::{Peer, PeerRegistry};
pub use protocol::payload::FileDescriptor;
pub use transfer::{FileOffer, TransferRegistry, TransferToken};

use events::EventSender;
use network::{ControlChannel, Dispatcher, Identity};
use protocol::constants::{mode, opt};
use protocol::payload;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use transfer::receiver::{pull_file, PullRequest};
use transfer::server::BulkServer;
use transfer::{PendingInboundFile, PendingOutboundFile};

/// The protocol engine. One instance per process is typical, but nothing
/// here is global; tests run several side by side.
pub struct LanmsgCore {
    config: Config,
    control: Option<Arc<ControlChannel>>,
    peers: Arc<PeerRegistry>,
    transfers: Arc<TransferRegistry>,
    events: EventSender,
    running: Arc<RwLock<bool>>,
}

impl LanmsgCore {
    /// Create an engine and the event stream its subscriber will drain.
    pub fn new(config: Config) -> (Self, EventReceiver) {
        let (tx, rx) = events::channel();
        (
            Self {
                config,
                control: None,
                peers: Arc::new(PeerRegistry::new()),
                transfers: Arc::new(TransferRegistry::new()),
                events: tx,
                running: Arc::new(RwLock::new(false)),
            },
            rx,
        )
    }

    /// Bind sockets, spawn the loops, and announce ourselves.
    ///
    /// Failing to bind the UDP control port is fatal. Failing to bind the
    /// bulk TCP listener only disables serving files; the engine logs the
    /// loss once and keeps going.
    pub async fn start(&mut self) -> Result<()> {
        info!("🚀 Starting LanMsg engine as {:?}", self.config.nickname);
        *self.running.write().await = true;

        let identity = Identity {
            nickname: self.config.nickname.clone(),
            hostname: self.config.hostname.clone(),
            group: self.config.group.clone(),
        };
        let control = Arc::new(
            ControlChannel::bind(
                self.config.port,
                identity,
                self.config.broadcast_addrs.clone(),
            )
            .await?,
        );
        self.control = Some(Arc::clone(&control));

        Dispatcher {
            control: Arc::clone(&control),
            peers: Arc::clone(&self.peers),
            transfers: Arc::clone(&self.transfers),
            events: self.events.clone(),
            running: Arc::clone(&self.running),
        }
        .spawn();

        match BulkServer::bind(self.config.port).await {
            Ok(listener) => {
                BulkServer::new(
                    Arc::clone(&self.transfers),
                    self.events.clone(),
                    Arc::clone(&self.running),
                )
                .spawn(listener);
            }
            Err(e) => {
                error!("File serving disabled: {}", e);
            }
        }

        control.broadcast_entry().await;
        self.spawn_heartbeat(Arc::clone(&control));
        self.spawn_expiry_sweep();

        info!("✅ LanMsg engine started on port {}", control.local_port());
        Ok(())
    }

    /// Broadcast our exit and let the loops wind down on their next poll
    /// tick. In-flight TCP transfers are not cut; they run to completion
    /// or natural connection failure.
    pub async fn stop(&self) {
        info!("🛑 Stopping LanMsg engine");
        if let Some(control) = &self.control {
            control.broadcast_exit().await;
        }
        *self.running.write().await = false;
    }

    /// Re-broadcast presence every announce interval so late joiners and
    /// lossy segments converge. Identical repeats never re-churn peers.
    fn spawn_heartbeat(&self, control: Arc<ControlChannel>) {
        let secs = self.config.announce_interval_secs;
        if secs == 0 {
            return;
        }
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await; // first tick fires immediately; entry already sent
            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                control.broadcast_entry().await;
            }
        });
    }

    /// Opt-in liveness sweep. The baseline protocol removes peers only on
    /// an explicit exit; with an expiry window configured, peers that
    /// vanished without one (crash, cable pull) are dropped too.
    fn spawn_expiry_sweep(&self) {
        let Some(window) = self.config.peer_expiry_secs else {
            return;
        };
        let peers = Arc::clone(&self.peers);
        let events = self.events.clone();
        let running = Arc::clone(&self.running);
        let cadence = Duration::from_secs((window / 3).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                for peer in peers.expire_older_than(window) {
                    info!("⌛ Peer expired: {} @ {}", peer.nickname, peer.addr);
                    events::emit(&events, Event::PeerOffline { peer });
                }
            }
        });
    }

    fn control(&self) -> Result<&Arc<ControlChannel>> {
        self.control.as_ref().ok_or(Error::NotStarted)
    }

    /// Unicast a presence announce to a known host, for segments where the
    /// broadcast does not carry.
    pub async fn announce_to(&self, dest: SocketAddr) -> Result<()> {
        let control = self.control()?;
        let extra = payload::encode_presence(&self.config.nickname, &self.config.group);
        control.send_to(mode::BR_ENTRY, &extra, dest).await?;
        Ok(())
    }

    /// Send a chat message with a delivery receipt requested. Returns the
    /// packet number the receipt will quote.
    pub async fn send_text(&self, dest: SocketAddr, text: &str) -> Result<u64> {
        let control = self.control()?;
        let packet_no = control.send_text(dest, text).await?;
        debug!("📤 Sent message {} to {}", packet_no, dest);
        Ok(packet_no)
    }

    /// Announce a local file to a peer. The file is registered under a
    /// fresh (packet_no, file_id) token and streamed only when the peer
    /// quotes that token back on the bulk channel.
    pub async fn offer_file(
        &self,
        dest: SocketAddr,
        path: &Path,
        text: &str,
    ) -> Result<TransferToken> {
        let control = self.control()?;
        let meta = tokio::fs::metadata(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let token = TransferToken {
            packet_no: control.next_packet_no(),
            file_id: self.transfers.next_file_id(),
        };
        let descriptor = FileDescriptor {
            file_id: token.file_id,
            filename: filename.clone(),
            size: meta.len(),
            mtime,
            file_type: protocol::constants::file_type::REGULAR,
        };

        // Register before the announce hits the wire; an eager peer may
        // quote the token back before send_numbered returns.
        self.transfers.register_outbound(PendingOutboundFile {
            token,
            peer: dest.ip(),
            path: path.to_path_buf(),
            filename,
            size: meta.len(),
            mtime,
            registered_at: chrono::Utc::now(),
        });

        let extra = payload::encode_file_attach(text, &[descriptor]);
        control
            .send_numbered(
                token.packet_no,
                mode::SENDMSG | opt::SENDCHECK | opt::FILEATTACH,
                &extra,
                dest,
            )
            .await?;
        info!("📎 Offered {:?} to {} as {}", path, dest, token);
        Ok(token)
    }

    /// Accept one descriptor from an offer: notify the sender's control
    /// port with a GETFILEDATA, then dial its bulk port and pull. If a
    /// partial file from an earlier attempt exists, the pull resumes from
    /// its length.
    pub async fn accept_file(
        &self,
        offer: &FileOffer,
        file: &FileDescriptor,
        save_dir: Option<&Path>,
    ) -> Result<TransferToken> {
        let control = self.control()?;
        let token = TransferToken {
            packet_no: offer.packet_no,
            file_id: file.file_id,
        };

        // Strip any path the remote put in the name; files land flat in
        // the save directory.
        let safe_name = Path::new(&file.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("file-{}", file.file_id));
        let dest = save_dir
            .unwrap_or(&self.config.save_dir)
            .join(safe_name);

        let offset = match tokio::fs::metadata(&dest).await {
            Ok(meta) if meta.len() < file.size => meta.len(),
            _ => 0,
        };

        self.transfers.register_inbound(PendingInboundFile {
            token,
            peer: offer.from.ip(),
            filename: file.filename.clone(),
            size: file.size,
            dest: dest.clone(),
            received: offset,
        });

        // UDP leg first: tells the sender's control plane the pull is
        // coming. The TCP leg quotes the identical triple and is what
        // actually authorizes the bytes.
        let request = payload::encode_data_request(token.packet_no, token.file_id, offset);
        control
            .send_to(mode::GETFILEDATA, request.as_bytes(), offer.from)
            .await?;

        let pull = PullRequest {
            sender: offer.from,
            token,
            filename: file.filename.clone(),
            size: file.size,
            dest,
            offset,
            connect_timeout: Duration::from_secs(self.config.connect_timeout_secs),
        };
        let transfers = Arc::clone(&self.transfers);
        let events = self.events.clone();
        tokio::spawn(async move {
            pull_file(pull, transfers, events).await;
        });
        info!("📥 Accepting {} from {} as {}", file.filename, offer.from, token);
        Ok(token)
    }

    /// Decline an offered file. Nothing goes on the wire; the sender's
    /// token simply ages out unused.
    pub fn decline_file(&self, offer: &FileOffer, file: &FileDescriptor) {
        debug!(
            "Declined {} ({}/{}) from {}",
            file.filename, offer.packet_no, file.file_id, offer.from
        );
    }

    /// Ordered peer list: grouped, then by name.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.snapshot()
    }

    /// Actual UDP port the control socket landed on.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.control()?.local_port())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;
    use tokio::time::timeout as with_deadline;

    fn test_config(nickname: &str, port: u16, save_dir: PathBuf) -> Config {
        Config {
            nickname: nickname.to_string(),
            hostname: format!("{}-host", nickname),
            group: "test".to_string(),
            port,
            save_dir,
            broadcast_addrs: Vec::new(),
            announce_interval_secs: 0,
            connect_timeout_secs: 5,
            peer_expiry_secs: None,
        }
    }

    async fn next_event(rx: &mut EventReceiver) -> Event {
        with_deadline(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Full scenario over loopback: two engines discover each other by a
    /// directed announce, exchange a receipted message, then move a file
    /// end to end.
    #[tokio::test]
    async fn two_engines_message_and_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);

        // Fixed distinct ports: the bulk listener must share the control
        // port number, so port 0 is not an option here.
        let port_a = 46025;
        let port_b = 46026;

        let (mut alice, mut alice_rx) =
            LanmsgCore::new(test_config("alice", port_a, dir.path().join("alice")));
        let (mut bob, mut bob_rx) =
            LanmsgCore::new(test_config("bob", port_b, dir.path().join("bob")));
        alice.start().await.unwrap();
        bob.start().await.unwrap();

        // Directed announce: bob introduces himself to alice, alice's
        // answer-entry introduces her back.
        bob.announce_to(SocketAddr::new(localhost, port_a))
            .await
            .unwrap();

        let alice_sees = next_event(&mut alice_rx).await;
        let Event::PeerOnline { peer } = alice_sees else {
            panic!("expected PeerOnline, got {:?}", alice_sees);
        };
        assert_eq!(peer.nickname, "bob");
        let bob_sees = next_event(&mut bob_rx).await;
        let Event::PeerOnline { peer } = bob_sees else {
            panic!("expected PeerOnline, got {:?}", bob_sees);
        };
        assert_eq!(peer.nickname, "alice");

        // Receipted chat message.
        let bob_addr = SocketAddr::new(localhost, port_b);
        let packet_no = alice.send_text(bob_addr, "hi bob").await.unwrap();
        let msg = next_event(&mut bob_rx).await;
        let Event::Message { text, sender, .. } = msg else {
            panic!("expected Message, got {:?}", msg);
        };
        assert_eq!(text, "hi bob");
        assert_eq!(sender, "alice");
        let delivered = next_event(&mut alice_rx).await;
        let Event::MessageDelivered { packet_no: confirmed, .. } = delivered else {
            panic!("expected MessageDelivered, got {:?}", delivered);
        };
        assert_eq!(confirmed, packet_no);

        // File transfer: alice announces, bob accepts, bytes move over TCP.
        let src = dir.path().join("photo.jpg");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i * 13 % 256) as u8).collect();
        tokio::fs::write(&src, &content).await.unwrap();
        alice.offer_file(bob_addr, &src, "").await.unwrap();

        let offer_event = next_event(&mut bob_rx).await;
        let Event::FileOffer { offer } = offer_event else {
            panic!("expected FileOffer, got {:?}", offer_event);
        };
        assert_eq!(offer.files.len(), 1);
        assert_eq!(offer.files[0].filename, "photo.jpg");
        assert_eq!(offer.files[0].size, 10_000);

        let file = offer.files[0].clone();
        bob.accept_file(&offer, &file, None).await.unwrap();

        // Bob's side completes with the file in his save dir.
        let done = loop {
            match next_event(&mut bob_rx).await {
                Event::FileComplete { path, direction: Direction::Inbound, .. } => break path,
                Event::FileError { reason, .. } => panic!("transfer failed: {}", reason),
                _ => continue,
            }
        };
        assert_eq!(done, dir.path().join("bob").join("photo.jpg"));
        assert_eq!(tokio::fs::read(&done).await.unwrap(), content);

        // Alice's outbound table is spent: the token cannot be pulled twice.
        assert_eq!(alice.transfers.outbound_len(), 0);

        alice.stop().await;
        bob.stop().await;
    }
}
