//! Peer presence registry.
//!
//! Peers are keyed by IP address. A record is created on the first presence
//! packet from that address, updated in place when the display name or group
//! changes, and removed on an explicit exit broadcast. The registry itself
//! never answers the network; reply discipline (exactly one answer-entry
//! per entry broadcast, none per answer-entry) lives in the dispatch layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// A peer visible on the local segment.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    pub addr: IpAddr,
    pub nickname: String,
    pub group: String,
    /// UDP port the peer's control channel answers on.
    pub udp_port: u16,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of feeding a presence packet into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// First sighting of this address.
    New,
    /// Name or group differed from the stored record.
    Updated,
    /// Identical announce; only the last-seen timestamp moved.
    Unchanged,
}

/// Shared registry of known peers. Mutated by the UDP dispatch task and the
/// liveness sweep, queried by everyone else, so access is serialized.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    inner: Mutex<HashMap<IpAddr, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence packet. Returns what changed so the caller can
    /// decide whether an event is worth raising: repeated identical
    /// announces must not churn the subscriber.
    pub fn observe(
        &self,
        addr: IpAddr,
        udp_port: u16,
        nickname: &str,
        group: &str,
    ) -> (PresenceChange, Peer) {
        let mut peers = self.inner.lock().unwrap();
        let now = Utc::now();
        match peers.get_mut(&addr) {
            Some(peer) => {
                peer.last_seen = now;
                peer.udp_port = udp_port;
                if peer.nickname != nickname || peer.group != group {
                    peer.nickname = nickname.to_string();
                    peer.group = group.to_string();
                    (PresenceChange::Updated, peer.clone())
                } else {
                    (PresenceChange::Unchanged, peer.clone())
                }
            }
            None => {
                let peer = Peer {
                    addr,
                    nickname: nickname.to_string(),
                    group: group.to_string(),
                    udp_port,
                    last_seen: now,
                };
                peers.insert(addr, peer.clone());
                (PresenceChange::New, peer)
            }
        }
    }

    /// Remove a peer on exit. Returns the record if it existed.
    pub fn remove(&self, addr: IpAddr) -> Option<Peer> {
        self.inner.lock().unwrap().remove(&addr)
    }

    pub fn get(&self, addr: IpAddr) -> Option<Peer> {
        self.inner.lock().unwrap().get(&addr).cloned()
    }

    /// Ordered view for display: grouped, then by name within the group.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.inner.lock().unwrap().values().cloned().collect();
        peers.sort_by(|a, b| {
            a.group
                .cmp(&b.group)
                .then_with(|| a.nickname.cmp(&b.nickname))
                .then_with(|| a.addr.cmp(&b.addr))
        });
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Liveness sweep: drop peers unseen for longer than `max_age_secs` and
    /// return them. The baseline protocol never expires anyone; this runs
    /// only when the expiry window is configured.
    pub fn expire_older_than(&self, max_age_secs: u64) -> Vec<Peer> {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age_secs as i64);
        let mut peers = self.inner.lock().unwrap();
        let stale: Vec<IpAddr> = peers
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.addr)
            .collect();
        stale.into_iter().filter_map(|addr| peers.remove(&addr)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    #[test]
    fn first_sighting_is_new() {
        let reg = PeerRegistry::new();
        let (change, peer) = reg.observe(ip(10), 2425, "alice", "lab");
        assert_eq!(change, PresenceChange::New);
        assert_eq!(peer.nickname, "alice");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn repeated_announce_is_idempotent() {
        let reg = PeerRegistry::new();
        reg.observe(ip(10), 2425, "alice", "lab");
        let (change, _) = reg.observe(ip(10), 2425, "alice", "lab");
        assert_eq!(change, PresenceChange::Unchanged);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn rename_updates_in_place() {
        let reg = PeerRegistry::new();
        reg.observe(ip(10), 2425, "alice", "lab");
        let (change, peer) = reg.observe(ip(10), 2425, "alice2", "lab");
        assert_eq!(change, PresenceChange::Updated);
        assert_eq!(peer.nickname, "alice2");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn exit_removes() {
        let reg = PeerRegistry::new();
        reg.observe(ip(10), 2425, "alice", "lab");
        assert!(reg.remove(ip(10)).is_some());
        assert!(reg.remove(ip(10)).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_is_grouped_and_sorted() {
        let reg = PeerRegistry::new();
        reg.observe(ip(10), 2425, "zed", "ops");
        reg.observe(ip(11), 2425, "alice", "ops");
        reg.observe(ip(12), 2425, "bob", "dev");
        let names: Vec<String> = reg
            .snapshot()
            .into_iter()
            .map(|p| format!("{}/{}", p.group, p.nickname))
            .collect();
        assert_eq!(names, vec!["dev/bob", "ops/alice", "ops/zed"]);
    }

    #[test]
    fn expiry_sweep_only_drops_stale() {
        let reg = PeerRegistry::new();
        reg.observe(ip(10), 2425, "alice", "lab");
        // Nothing is older than an hour yet.
        assert!(reg.expire_older_than(3600).is_empty());
        assert_eq!(reg.len(), 1);
        // A zero window expires everything seen before "now".
        std::thread::sleep(std::time::Duration::from_millis(5));
        let expired = reg.expire_older_than(0);
        assert_eq!(expired.len(), 1);
        assert!(reg.is_empty());
    }
}
