// ==============================================================================
// crates/core/src/network/udp.rs - UDP Control Channel and Command Dispatch
// ==============================================================================

//! The UDP side of the protocol: presence broadcasts, chat messages,
//! receipts, and the control leg of the file-transfer handshake all travel
//! as single datagrams through one socket. A polling receive loop feeds
//! every datagram through the codec and dispatches on the command mode;
//! datagrams that fail the parse are dropped without an answer.

use crate::error::Error;
use crate::events::{self, Direction, Event, EventSender};
use crate::peers::{PeerRegistry, PresenceChange};
use crate::protocol::constants::{mode, opt};
use crate::protocol::packet::{self, Packet};
use crate::protocol::payload;
use crate::transfer::TransferRegistry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Receive poll granularity; bounds how long shutdown can go unnoticed.
const RECV_POLL: Duration = Duration::from_secs(1);

/// Largest control datagram we accept. Attach lists stay well under this.
const MAX_DATAGRAM: usize = 8192;

/// Identity stamped on every outbound frame.
#[derive(Debug, Clone)]
pub struct Identity {
    pub nickname: String,
    pub hostname: String,
    pub group: String,
}

/// The engine's UDP socket plus everything needed to build frames on it.
pub struct ControlChannel {
    socket: Arc<UdpSocket>,
    identity: Identity,
    port: u16,
    /// Extra per-subnet broadcast targets besides the limited broadcast.
    broadcast_addrs: Vec<IpAddr>,
    last_packet_no: AtomicU64,
}

impl ControlChannel {
    /// Bind the control socket. This is the one bind the engine cannot live
    /// without; failure is fatal to startup.
    pub async fn bind(
        port: u16,
        identity: Identity,
        broadcast_addrs: Vec<IpAddr>,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|source| Error::Bind {
                what: "control",
                port,
                source,
            })?;
        socket.set_broadcast(true)?;
        info!("📡 Control channel bound to 0.0.0.0:{}", port);
        Ok(Self {
            socket: Arc::new(socket),
            identity,
            port,
            broadcast_addrs,
            last_packet_no: AtomicU64::new(0),
        })
    }

    /// Next packet number: the sender-local clock, bumped past the previous
    /// number whenever the clock has not moved between two sends.
    pub fn next_packet_no(&self) -> u64 {
        let now = chrono::Utc::now().timestamp() as u64;
        let prev = self
            .last_packet_no
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(if now > last { now } else { last + 1 })
            })
            .unwrap();
        if now > prev {
            now
        } else {
            prev + 1
        }
    }

    /// Encode and unicast one frame, returning the packet number used.
    pub async fn send_to(
        &self,
        command: u32,
        extra: &[u8],
        dest: SocketAddr,
    ) -> std::io::Result<u64> {
        let packet_no = self.next_packet_no();
        self.send_numbered(packet_no, command, extra, dest).await?;
        Ok(packet_no)
    }

    /// Unicast a frame under a caller-chosen packet number. Used when the
    /// number doubles as a transfer token and must be known up front.
    pub async fn send_numbered(
        &self,
        packet_no: u64,
        command: u32,
        extra: &[u8],
        dest: SocketAddr,
    ) -> std::io::Result<()> {
        let frame = packet::encode(
            packet_no,
            &self.identity.nickname,
            &self.identity.hostname,
            command,
            extra,
        );
        self.socket.send_to(&frame, dest).await?;
        Ok(())
    }

    /// Broadcast a frame to the limited broadcast address and every
    /// configured per-subnet address, all under one packet number.
    pub async fn broadcast(&self, command: u32, extra: &[u8]) -> u64 {
        let packet_no = self.next_packet_no();
        let mut targets = vec![IpAddr::V4(Ipv4Addr::BROADCAST)];
        targets.extend(self.broadcast_addrs.iter().copied());
        for ip in targets {
            let dest = SocketAddr::new(ip, self.port);
            if let Err(e) = self
                .send_numbered(packet_no, command | opt::BROADCAST, extra, dest)
                .await
            {
                warn!("Broadcast to {} failed: {}", dest, e);
            }
        }
        packet_no
    }

    pub async fn broadcast_entry(&self) {
        debug!("📢 Broadcasting entry");
        let extra = payload::encode_presence(&self.identity.nickname, &self.identity.group);
        self.broadcast(mode::BR_ENTRY, &extra).await;
    }

    pub async fn broadcast_exit(&self) {
        debug!("📢 Broadcasting exit");
        let extra = payload::encode_presence(&self.identity.nickname, &self.identity.group);
        self.broadcast(mode::BR_EXIT, &extra).await;
    }

    /// Exactly one targeted reply per entry broadcast, to the sender's
    /// observed address and port. Answer-entries themselves are never
    /// answered, which is what keeps N peers from storming each other.
    pub async fn answer_entry(&self, dest: SocketAddr) {
        debug!("Answering entry from {}", dest);
        let extra = payload::encode_presence(&self.identity.nickname, &self.identity.group);
        if let Err(e) = self.send_to(mode::ANSENTRY, &extra, dest).await {
            warn!("Answer-entry to {} failed: {}", dest, e);
        }
    }

    /// Send a chat message with a delivery receipt requested.
    pub async fn send_text(&self, dest: SocketAddr, text: &str) -> std::io::Result<u64> {
        self.send_to(mode::SENDMSG | opt::SENDCHECK, text.as_bytes(), dest)
            .await
    }

    /// Confirm delivery of `packet_no` back to its sender.
    pub async fn send_receipt(&self, dest: SocketAddr, packet_no: u64) {
        let extra = packet_no.to_string();
        if let Err(e) = self.send_to(mode::RECVMSG, extra.as_bytes(), dest).await {
            warn!("Receipt to {} failed: {}", dest, e);
        }
    }

    pub fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.port)
    }
}

/// Receive loop plus command dispatch. Owns shared handles to the peer and
/// transfer registries; emits typed events for the subscriber.
pub struct Dispatcher {
    pub control: Arc<ControlChannel>,
    pub peers: Arc<PeerRegistry>,
    pub transfers: Arc<TransferRegistry>,
    pub events: EventSender,
    pub running: Arc<RwLock<bool>>,
}

impl Dispatcher {
    /// Run the polling receive loop until the running flag drops.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let socket = Arc::clone(&self.control.socket);
            let mut buf = vec![0u8; MAX_DATAGRAM];
            info!("📡 Control receive loop started");
            loop {
                if !*self.running.read().await {
                    break;
                }
                match timeout(RECV_POLL, socket.recv_from(&mut buf)).await {
                    Ok(Ok((n, addr))) => self.dispatch(&buf[..n], addr).await,
                    Ok(Err(e)) => {
                        if *self.running.read().await {
                            warn!("Control receive error: {}", e);
                        }
                    }
                    Err(_) => continue, // poll tick, re-check the flag
                }
            }
            info!("📡 Control receive loop stopped");
        })
    }

    async fn dispatch(&self, data: &[u8], addr: SocketAddr) {
        let pkt = match packet::decode(data) {
            Ok(pkt) => pkt,
            // Malformed datagrams are noise from foreign senders; never
            // answered, never escalated.
            Err(_) => {
                debug!("Dropping malformed datagram from {}", addr);
                return;
            }
        };

        // Our own broadcasts loop back on the shared port; answering one
        // would put us in our own peer list.
        if pkt.sender == self.control.identity.nickname
            && pkt.host == self.control.identity.hostname
        {
            return;
        }

        match pkt.mode() {
            mode::BR_ENTRY => {
                self.on_presence(&pkt, addr);
                self.control.answer_entry(addr).await;
            }
            mode::ANSENTRY => {
                self.on_presence(&pkt, addr);
            }
            mode::BR_EXIT => self.on_exit(addr),
            mode::SENDMSG => self.on_message(&pkt, addr).await,
            mode::RECVMSG => self.on_receipt(&pkt, addr),
            mode::GETFILEDATA => {
                // Control-plane notification only; the TCP leg carries the
                // identical triple and is what actually authorizes bytes.
                match payload::parse_data_request(&String::from_utf8_lossy(&pkt.extra)) {
                    Ok((packet_no, file_id, offset)) => {
                        debug!(
                            "Data request {}/{} offset {} announced by {}",
                            packet_no, file_id, offset, addr
                        );
                    }
                    Err(_) => debug!("Unparseable data request from {}", addr),
                }
            }
            other => debug!("Ignoring mode {:#x} from {}", other, addr),
        }
    }

    fn on_presence(&self, pkt: &Packet, addr: SocketAddr) {
        let info = payload::parse_presence(&pkt.extra);
        // Old clients put only the nickname in extra; fall back to the
        // sender field when even that is empty.
        let nickname = if info.nickname.is_empty() {
            pkt.sender.clone()
        } else {
            info.nickname
        };
        let (change, peer) = self
            .peers
            .observe(addr.ip(), addr.port(), &nickname, &info.group);
        match change {
            PresenceChange::New => {
                info!("🟢 Peer online: {} @ {}", peer.nickname, peer.addr);
                events::emit(&self.events, Event::PeerOnline { peer });
            }
            PresenceChange::Updated => {
                debug!("Peer updated: {} @ {}", peer.nickname, peer.addr);
                events::emit(&self.events, Event::PeerOnline { peer });
            }
            PresenceChange::Unchanged => {}
        }
    }

    fn on_exit(&self, addr: SocketAddr) {
        if let Some(peer) = self.peers.remove(addr.ip()) {
            info!("🔴 Peer offline: {} @ {}", peer.nickname, peer.addr);
            events::emit(&self.events, Event::PeerOffline { peer });
        }
        for dead in self.transfers.cancel_peer(addr.ip()) {
            events::emit(
                &self.events,
                Event::FileError {
                    token: dead.token,
                    direction: Direction::Inbound,
                    reason: "peer went offline".to_string(),
                },
            );
        }
    }

    async fn on_message(&self, pkt: &Packet, addr: SocketAddr) {
        // A single SENDMSG is either a file announcement or a chat line to
        // the subscriber, never both.
        if pkt.has_opt(opt::FILEATTACH) {
            let (text, files) = payload::parse_file_attach(&pkt.extra);
            if !files.is_empty() {
                info!(
                    "📎 File offer from {}: {} file(s)",
                    addr,
                    files.len()
                );
                events::emit(
                    &self.events,
                    Event::FileOffer {
                        offer: crate::transfer::FileOffer {
                            from: addr,
                            sender: pkt.sender.clone(),
                            packet_no: pkt.packet_no,
                            text,
                            files,
                        },
                    },
                );
                if pkt.has_opt(opt::SENDCHECK) {
                    self.control.send_receipt(addr, pkt.packet_no).await;
                }
                return;
            }
            // Attach flag without a parseable list degrades to plain text.
            debug!("File-attach payload from {} did not parse; treating as message", addr);
        }

        events::emit(
            &self.events,
            Event::Message {
                from: addr,
                sender: pkt.sender.clone(),
                packet_no: pkt.packet_no,
                text: String::from_utf8_lossy(&pkt.extra).into_owned(),
            },
        );
        if pkt.has_opt(opt::SENDCHECK) {
            self.control.send_receipt(addr, pkt.packet_no).await;
        }
    }

    fn on_receipt(&self, pkt: &Packet, addr: SocketAddr) {
        let confirmed = String::from_utf8_lossy(&pkt.extra)
            .trim()
            .parse::<u64>()
            .ok();
        match confirmed {
            Some(packet_no) => {
                debug!("Receipt from {} for packet {}", addr, packet_no);
                events::emit(
                    &self.events,
                    Event::MessageDelivered {
                        from: addr,
                        packet_no,
                    },
                );
            }
            None => debug!("Receipt from {} without a packet number", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::protocol::constants::PROTOCOL_VERSION as VERSION;

    struct Harness {
        port: u16,
        peers: Arc<PeerRegistry>,
        transfers: Arc<TransferRegistry>,
        rx: EventReceiver,
        running: Arc<RwLock<bool>>,
    }

    async fn start_engine() -> Harness {
        let identity = Identity {
            nickname: "me".into(),
            hostname: "myhost".into(),
            group: "lab".into(),
        };
        let control = Arc::new(ControlChannel::bind(0, identity, Vec::new()).await.unwrap());
        let port = control.local_port();
        let peers = Arc::new(PeerRegistry::new());
        let transfers = Arc::new(TransferRegistry::new());
        let (tx, rx) = events::channel();
        let running = Arc::new(RwLock::new(true));
        Dispatcher {
            control,
            peers: Arc::clone(&peers),
            transfers: Arc::clone(&transfers),
            events: tx,
            running: Arc::clone(&running),
        }
        .spawn();
        Harness {
            port,
            peers,
            transfers,
            rx,
            running,
        }
    }

    async fn probe_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn entry_frame(nickname: &str, group: &str) -> Vec<u8> {
        let extra = payload::encode_presence(nickname, group);
        packet::encode(100, nickname, "probehost", mode::BR_ENTRY, &extra)
    }

    async fn recv_with_deadline(socket: &UdpSocket) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => Some(buf[..n].to_vec()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn entry_gets_exactly_one_answer() {
        let engine = start_engine().await;
        let probe = probe_socket().await;

        probe
            .send_to(&entry_frame("alice", "lab"), ("127.0.0.1", engine.port))
            .await
            .unwrap();

        // Exactly one ANSENTRY comes back to our source port.
        let reply = recv_with_deadline(&probe).await.expect("expected a reply");
        let pkt = packet::decode(&reply).unwrap();
        assert_eq!(pkt.mode(), mode::ANSENTRY);
        assert_eq!(pkt.version, VERSION);
        assert_eq!(pkt.sender, "me");
        assert!(recv_with_deadline(&probe).await.is_none());

        assert_eq!(engine.peers.len(), 1);
        *engine.running.write().await = false;
    }

    #[tokio::test]
    async fn answer_entry_registers_without_replying() {
        let engine = start_engine().await;
        let probe = probe_socket().await;

        let extra = payload::encode_presence("bob", "ops");
        let frame = packet::encode(7, "bob", "h", mode::ANSENTRY, &extra);
        probe
            .send_to(&frame, ("127.0.0.1", engine.port))
            .await
            .unwrap();

        assert!(recv_with_deadline(&probe).await.is_none());
        assert_eq!(engine.peers.len(), 1);
        let peer = engine.peers.snapshot().remove(0);
        assert_eq!(peer.nickname, "bob");
        assert_eq!(peer.group, "ops");
        *engine.running.write().await = false;
    }

    #[tokio::test]
    async fn repeated_entry_does_not_duplicate_or_rechurn() {
        let mut engine = start_engine().await;
        let probe = probe_socket().await;
        let dest = ("127.0.0.1", engine.port);

        probe.send_to(&entry_frame("alice", "lab"), dest).await.unwrap();
        recv_with_deadline(&probe).await.unwrap();
        probe.send_to(&entry_frame("alice", "lab"), dest).await.unwrap();
        recv_with_deadline(&probe).await.unwrap();

        assert_eq!(engine.peers.len(), 1);
        // One PeerOnline for the first sighting, nothing for the repeat.
        let mut online = 0;
        while let Ok(event) = engine.rx.try_recv() {
            if matches!(event, Event::PeerOnline { .. }) {
                online += 1;
            }
        }
        assert_eq!(online, 1);
        *engine.running.write().await = false;
    }

    #[tokio::test]
    async fn exit_removes_peer_and_voids_transfers() {
        let mut engine = start_engine().await;
        let probe = probe_socket().await;
        let dest = ("127.0.0.1", engine.port);

        probe.send_to(&entry_frame("alice", "lab"), dest).await.unwrap();
        recv_with_deadline(&probe).await.unwrap();

        engine.transfers.register_inbound(crate::transfer::PendingInboundFile {
            token: crate::transfer::TransferToken {
                packet_no: 50,
                file_id: 1,
            },
            peer: IpAddr::from([127, 0, 0, 1]),
            filename: "f".into(),
            size: 10,
            dest: std::path::PathBuf::from("/tmp/f"),
            received: 0,
        });

        let exit = packet::encode(101, "alice", "h", mode::BR_EXIT, b"alice");
        probe.send_to(&exit, dest).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(engine.peers.len(), 0);
        assert_eq!(engine.transfers.inbound_len(), 0);
        let mut saw_offline = false;
        let mut saw_error = false;
        while let Ok(event) = engine.rx.try_recv() {
            match event {
                Event::PeerOffline { .. } => saw_offline = true,
                Event::FileError { reason, .. } => {
                    saw_error = true;
                    assert!(reason.contains("offline"));
                }
                _ => {}
            }
        }
        assert!(saw_offline);
        assert!(saw_error);
        *engine.running.write().await = false;
    }

    #[tokio::test]
    async fn checked_message_is_receipted_and_surfaced() {
        let mut engine = start_engine().await;
        let probe = probe_socket().await;

        let frame = packet::encode(
            555,
            "alice",
            "h",
            mode::SENDMSG | opt::SENDCHECK,
            b"hello there",
        );
        probe
            .send_to(&frame, ("127.0.0.1", engine.port))
            .await
            .unwrap();

        let reply = recv_with_deadline(&probe).await.expect("expected receipt");
        let pkt = packet::decode(&reply).unwrap();
        assert_eq!(pkt.mode(), mode::RECVMSG);
        assert_eq!(String::from_utf8_lossy(&pkt.extra), "555");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut text = None;
        while let Ok(event) = engine.rx.try_recv() {
            if let Event::Message { text: t, packet_no, .. } = event {
                assert_eq!(packet_no, 555);
                text = Some(t);
            }
        }
        assert_eq!(text.as_deref(), Some("hello there"));
        *engine.running.write().await = false;
    }

    #[tokio::test]
    async fn file_attach_routes_to_offer_not_message() {
        let mut engine = start_engine().await;
        let probe = probe_socket().await;

        let files = vec![payload::FileDescriptor {
            file_id: 42,
            filename: "photo.jpg".into(),
            size: 10_000,
            mtime: 0,
            file_type: crate::protocol::constants::file_type::REGULAR,
        }];
        let extra = payload::encode_file_attach("here you go", &files);
        let frame = packet::encode(
            1001,
            "alice",
            "h",
            mode::SENDMSG | opt::SENDCHECK | opt::FILEATTACH,
            &extra,
        );
        probe
            .send_to(&frame, ("127.0.0.1", engine.port))
            .await
            .unwrap();
        recv_with_deadline(&probe).await.expect("expected receipt");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut offers = 0;
        let mut messages = 0;
        while let Ok(event) = engine.rx.try_recv() {
            match event {
                Event::FileOffer { offer } => {
                    offers += 1;
                    assert_eq!(offer.packet_no, 1001);
                    assert_eq!(offer.files, files);
                    assert_eq!(offer.text, "here you go");
                }
                Event::Message { .. } => messages += 1,
                _ => {}
            }
        }
        assert_eq!(offers, 1);
        assert_eq!(messages, 0);
        *engine.running.write().await = false;
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped_silently() {
        let engine = start_engine().await;
        let probe = probe_socket().await;
        let dest = ("127.0.0.1", engine.port);

        probe.send_to(b"not a frame", dest).await.unwrap();
        probe.send_to(b"1:abc:u:h:32:hi", dest).await.unwrap();
        assert!(recv_with_deadline(&probe).await.is_none());
        assert!(engine.peers.is_empty());
        *engine.running.write().await = false;
    }

    #[tokio::test]
    async fn receipt_raises_delivered_event() {
        let mut engine = start_engine().await;
        let probe = probe_socket().await;

        let frame = packet::encode(9, "alice", "h", mode::RECVMSG, b"1234");
        probe
            .send_to(&frame, ("127.0.0.1", engine.port))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut delivered = None;
        while let Ok(event) = engine.rx.try_recv() {
            if let Event::MessageDelivered { packet_no, .. } = event {
                delivered = Some(packet_no);
            }
        }
        assert_eq!(delivered, Some(1234));
        *engine.running.write().await = false;
    }
}
