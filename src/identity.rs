use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const PEER_ID_PREFIX: &[u8; 8] = b"-EB0001-";

/// Process-wide identity: generated once at startup and quoted on every
/// announce and handshake.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub peer_id: [u8; 20],
    pub port: u16,
    pub stats: Arc<TransferStats>,
}

/// Byte counters the tracker contract requires. Written by the coordinator,
/// read by announces.
#[derive(Debug, Default)]
pub struct TransferStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
}

impl ClientIdentity {
    pub fn new(port: u16, total_length: u64) -> Self {
        let stats = TransferStats::default();
        stats.left.store(total_length, Ordering::Relaxed);
        Self {
            peer_id: generate_peer_id(),
            port,
            stats: Arc::new(stats),
        }
    }
}

impl TransferStats {
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }

    pub fn record_piece(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.left.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Azureus-style id: client tag then 12 random alphanumeric bytes.
fn generate_peer_id() -> [u8; 20] {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::rng();
    for byte in &mut peer_id[8..] {
        *byte = ALPHABET[rng.random_range(0..ALPHABET.len())];
    }
    peer_id
}
