use crate::bitfield::Bitfield;
use crate::identity::ClientIdentity;
use crate::metainfo::Metainfo;
use crate::peer::{self, PeerSession, SessionError};
use crate::piece::{PieceTable, SessionId};
use crate::storage::{Storage, StorageError};
use crate::tracker::{self, Event, TrackerClient, TrackerError};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// Concurrent peer session cap; addresses beyond it queue for a free slot.
pub const MAX_SESSIONS: usize = 30;
// Hash failures from one session before it is cut loose.
pub const CORRUPTION_LIMIT: u32 = 3;
// Failed addresses are not redialed for this long.
pub const COOLDOWN: Duration = Duration::from_secs(5 * 60);

const SHUTDOWN_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Work handed to a session: one piece and its exact size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceAssignment {
    pub index: u32,
    pub size: usize,
}

/// What sessions report to the coordinator. All piece-table access funnels
/// through these messages, so claim-and-mark is atomic by construction.
#[derive(Debug)]
pub enum SessionEvent {
    Claim {
        id: SessionId,
        have: Bitfield,
        reply: oneshot::Sender<Option<PieceAssignment>>,
    },
    PieceAssembled {
        id: SessionId,
        index: u32,
        bytes: Vec<u8>,
    },
    Closed {
        id: SessionId,
        addr: SocketAddrV4,
        error: Option<SessionError>,
    },
}

/// What the coordinator tells a session.
#[derive(Debug)]
pub enum SessionCommand {
    Have(u32),
    // a piece went back to missing; idle sessions should ask for work again
    Retry,
    Terminate,
}

enum TrackerCommand {
    Completed,
    Stop,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("tracker: {0}")]
    Tracker(#[from] TrackerError),
    #[error("session event channel closed")]
    ChannelClosed,
}

/// Downloads the torrent into `<output_dir>/<name>`. Returns once every
/// piece is verified on disk, or with the first fatal error.
pub async fn run(
    meta: Metainfo,
    identity: ClientIdentity,
    output_dir: &Path,
) -> Result<(), DownloadError> {
    let storage = Storage::create(output_dir.join(&meta.name), meta.total_length as u64)?;
    let mut tracker = TrackerClient::new(&meta, identity.clone());
    info!(
        name = %meta.name,
        pieces = meta.piece_count(),
        bytes = meta.total_length,
        "started"
    );

    // The first announce is make-or-break: no tracker, no swarm.
    let announce = tracker.announce(Event::Started).await?;
    info!(count = announce.peers.len(), "peers_received");

    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();
    let tracker_task = tokio::spawn(announce_loop(
        tracker,
        announce.next_announce_in(),
        peers_tx,
        tracker_rx,
    ));

    let (events_tx, events_rx) = kanal::bounded_async(EVENT_CHANNEL_CAPACITY);
    let meta = Arc::new(meta);
    let table = PieceTable::new(meta.piece_count());
    let mut coordinator = Coordinator {
        meta,
        identity,
        storage,
        table,
        sessions: HashMap::new(),
        pending_addrs: VecDeque::new(),
        cooldown: HashMap::new(),
        next_session_id: 1,
        events_tx,
        max_sessions: MAX_SESSIONS,
    };
    coordinator.enqueue_peers(announce.peers);

    let result = coordinator.drive(events_rx, peers_rx).await;

    if result.is_ok() {
        let _ = tracker_tx.send(TrackerCommand::Completed);
    }
    let _ = tracker_tx.send(TrackerCommand::Stop);
    for handle in coordinator.sessions.values() {
        let _ = handle.commands.send(SessionCommand::Terminate);
    }
    let _ = tracker_task.await;

    result?;
    info!("completed");
    Ok(())
}

/// Periodic re-announce driver. Network failures back off exponentially
/// without repeating `started`; a tracker-reported failure retries on the
/// regular schedule.
async fn announce_loop(
    mut client: TrackerClient,
    first_interval: Duration,
    peers_tx: mpsc::UnboundedSender<Vec<SocketAddrV4>>,
    mut commands: mpsc::UnboundedReceiver<TrackerCommand>,
) {
    let mut interval = first_interval;
    let mut backoff = tracker::INITIAL_BACKOFF;
    let mut next_announce = Instant::now() + interval;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TrackerCommand::Completed) => {
                    if let Err(err) = client.announce(Event::Completed).await {
                        warn!(error = %err, "completed announce failed");
                    }
                }
                Some(TrackerCommand::Stop) | None => {
                    // a pending goodbye is not worth waiting on
                    let _ = tokio::time::timeout(
                        SHUTDOWN_ANNOUNCE_TIMEOUT,
                        client.announce(Event::Stopped),
                    )
                    .await;
                    return;
                }
            },
            _ = tokio::time::sleep_until(next_announce) => {
                match client.announce(Event::Periodic).await {
                    Ok(announce) => {
                        backoff = tracker::INITIAL_BACKOFF;
                        interval = announce.next_announce_in();
                        next_announce = Instant::now() + interval;
                        let _ = peers_tx.send(announce.peers);
                    }
                    Err(TrackerError::Failure(reason)) => {
                        warn!(reason = %reason, "tracker rejected announce");
                        next_announce = Instant::now() + interval;
                    }
                    Err(err) => {
                        warn!(error = %err, backoff = backoff.as_secs(), "announce failed");
                        next_announce = Instant::now() + backoff;
                        backoff = (backoff * 2).min(tracker::MAX_BACKOFF);
                    }
                }
            }
        }
    }
}

struct SessionHandle {
    addr: SocketAddrV4,
    commands: mpsc::UnboundedSender<SessionCommand>,
    corrupt: u32,
}

struct Coordinator {
    meta: Arc<Metainfo>,
    identity: ClientIdentity,
    storage: Storage,
    table: PieceTable,
    sessions: HashMap<SessionId, SessionHandle>,
    pending_addrs: VecDeque<SocketAddrV4>,
    cooldown: HashMap<SocketAddrV4, Instant>,
    next_session_id: SessionId,
    events_tx: kanal::AsyncSender<SessionEvent>,
    max_sessions: usize,
}

impl Coordinator {
    async fn drive(
        &mut self,
        events_rx: kanal::AsyncReceiver<SessionEvent>,
        mut peers_rx: mpsc::UnboundedReceiver<Vec<SocketAddrV4>>,
    ) -> Result<(), DownloadError> {
        self.spawn_up_to_limit();
        while !self.table.all_complete() {
            tokio::select! {
                event = events_rx.recv() => {
                    let event = event.map_err(|_| DownloadError::ChannelClosed)?;
                    self.handle_event(event)?;
                }
                peers = peers_rx.recv() => {
                    if let Some(peers) = peers {
                        self.enqueue_peers(peers);
                        self.spawn_up_to_limit();
                    }
                }
            }
        }
        self.storage.flush()?;
        Ok(())
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<(), DownloadError> {
        match event {
            SessionEvent::Claim { id, have, reply } => {
                let assignment = self.table.claim(id, &have).map(|index| PieceAssignment {
                    index: index as u32,
                    size: self.meta.piece_size(index),
                });
                // the session may have died while the claim was queued
                let _ = reply.send(assignment);
            }
            SessionEvent::PieceAssembled { id, index, bytes } => {
                self.verify_and_store(id, index, bytes)?;
            }
            SessionEvent::Closed { id, addr, error } => {
                self.sessions.remove(&id);
                let released = self.table.release_all(id);
                if !released.is_empty() {
                    debug!(session = id, pieces = ?released, "released in-flight pieces");
                    self.broadcast_retry(id);
                }
                if let Some(err) = error {
                    warn!(%addr, kind = %err, "peer_failed");
                    self.cooldown.insert(addr, Instant::now() + COOLDOWN);
                }
                self.spawn_up_to_limit();
            }
        }
        Ok(())
    }

    fn verify_and_store(
        &mut self,
        id: SessionId,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<(), DownloadError> {
        let piece = index as usize;
        let digest: [u8; 20] = Sha1::digest(&bytes).into();
        if digest != self.meta.piece_hashes[piece] {
            self.table.release(id, piece);
            warn!(index, session = id, "piece_corrupt");
            if let Some(handle) = self.sessions.get_mut(&id) {
                handle.corrupt += 1;
                if handle.corrupt >= CORRUPTION_LIMIT {
                    warn!(session = id, "corruption limit reached, dropping peer");
                    self.cooldown.insert(handle.addr, Instant::now() + COOLDOWN);
                    let _ = handle.commands.send(SessionCommand::Terminate);
                }
            }
            self.broadcast_retry(id);
            return Ok(());
        }

        if !self.table.complete(id, piece) {
            // stale delivery from a session that no longer holds the claim
            return Ok(());
        }
        self.storage
            .write_piece(piece, self.meta.piece_length, &bytes)?;
        self.identity.stats.record_piece(bytes.len() as u64);
        info!(index, "piece_complete");
        info!(
            have = self.table.completed(),
            total = self.table.len(),
            "progress"
        );
        // announce the new piece everywhere else, never before it is on disk
        for (session_id, handle) in &self.sessions {
            if *session_id != id {
                let _ = handle.commands.send(SessionCommand::Have(index));
            }
        }
        Ok(())
    }

    /// Nudges every other session after a piece reverts to missing, so a
    /// peer that earlier came up empty-handed asks for work again.
    fn broadcast_retry(&self, releasing: SessionId) {
        for (session_id, handle) in &self.sessions {
            if *session_id != releasing {
                let _ = handle.commands.send(SessionCommand::Retry);
            }
        }
    }

    fn enqueue_peers(&mut self, peers: Vec<SocketAddrV4>) {
        for addr in peers {
            let active = self.sessions.values().any(|handle| handle.addr == addr);
            if !active && !self.pending_addrs.contains(&addr) {
                self.pending_addrs.push_back(addr);
            }
        }
    }

    fn spawn_up_to_limit(&mut self) {
        let now = Instant::now();
        self.cooldown.retain(|_, until| *until > now);
        while self.sessions.len() < self.max_sessions {
            let Some(addr) = self.pending_addrs.pop_front() else {
                break;
            };
            if self.cooldown.contains_key(&addr) {
                continue;
            }
            self.spawn_session(addr);
        }
    }

    fn spawn_session(&mut self, addr: SocketAddrV4) {
        let id = self.next_session_id;
        self.next_session_id += 1;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            id,
            SessionHandle {
                addr,
                commands: command_tx,
                corrupt: 0,
            },
        );
        let events = self.events_tx.clone();
        let meta = self.meta.clone();
        let peer_id = self.identity.peer_id;
        tokio::spawn(async move {
            let result = async {
                let (stream, _remote_id) = peer::connect(addr, meta.info_hash, peer_id).await?;
                info!(%addr, session = id, "peer_connected");
                PeerSession::new(id, stream, meta, events.clone(), command_rx)
                    .run()
                    .await
            }
            .await;
            let _ = events
                .send(SessionEvent::Closed {
                    id,
                    addr,
                    error: result.err(),
                })
                .await;
        });
    }
}
