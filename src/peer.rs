use crate::MAX_FRAME_SIZE;
use crate::bitfield::{Bitfield, BitfieldError};
use crate::download::{SessionCommand, SessionEvent};
use crate::metainfo::Metainfo;
use crate::piece::{BlockRequest, PieceAssembly, SessionId};
use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, trace};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
// A keep-alive goes out after this much outbound silence; a peer silent on
// the inbound side for IDLE_TIMEOUT is dead.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(150);
// An unchoked peer that sends no blocks for this long gets replaced.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

pub const PIPELINE_DEPTH: usize = 5;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake mismatch")]
    HandshakeMismatch,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("frame of {0} bytes exceeds protocol maximum")]
    BadFrameLength(usize),
    #[error("bitfield size mismatch: {0}")]
    BitfieldSizeMismatch(BitfieldError),
    #[error("bitfield has spare bits set")]
    BitfieldSpareBitsSet,
    #[error("unexpected message id {0}")]
    UnexpectedMessageId(u8),
    #[error("malformed payload for {0} message")]
    BadPayload(&'static str),
    #[error("peer sent a block we did not request")]
    UnsolicitedPiece,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("no inbound data for {}s", IDLE_TIMEOUT.as_secs())]
    ReadTimeout,
    #[error("unchoked but no blocks for {}s", STALL_TIMEOUT.as_secs())]
    Stalled,
    #[error("peer closed the connection")]
    PeerClosedConnection,
    #[error("coordinator went away")]
    CoordinatorGone,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BitfieldError> for SessionError {
    fn from(err: BitfieldError) -> Self {
        match err {
            BitfieldError::SizeMismatch { .. } => SessionError::BitfieldSizeMismatch(err),
            BitfieldError::SpareBitsSet(_) => SessionError::BitfieldSpareBitsSet,
        }
    }
}

const PSTR: &[u8; 19] = b"BitTorrent protocol";

/// The 68-byte preamble both sides send before any framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub const LEN: usize = 68;

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0] = PSTR.len() as u8;
        bytes[1..20].copy_from_slice(PSTR);
        // bytes 20..28 are the reserved block, all zeros: no extensions
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// Verifies protocol string and info_hash; anything off drops the
    /// connection. The peer's id is recorded, never validated.
    pub fn parse(bytes: &[u8; Self::LEN], expected_hash: &[u8; 20]) -> Result<Self, SessionError> {
        if bytes[0] as usize != PSTR.len() || &bytes[1..20] != PSTR {
            return Err(SessionError::HandshakeMismatch);
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        if info_hash != *expected_hash {
            return Err(SessionError::HandshakeMismatch);
        }
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Self { info_hash, peer_id })
    }
}

/// Post-handshake wire messages. `<4-byte length><1-byte id><payload>`;
/// a zero length is a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(BlockRequest),
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel(BlockRequest),
    Port(u16),
}

pub struct MessageFramer;

impl Decoder for MessageFramer {
    type Item = Message;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, SessionError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if length > MAX_FRAME_SIZE {
            return Err(SessionError::BadFrameLength(length));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        let id = src[4];
        let payload = &src[5..4 + length];
        let message = parse_message(id, payload)?;
        src.advance(4 + length);
        Ok(Some(message))
    }
}

fn parse_message(id: u8, payload: &[u8]) -> Result<Message, SessionError> {
    let message = match id {
        0..=3 => {
            if !payload.is_empty() {
                return Err(SessionError::BadPayload("flag"));
            }
            match id {
                0 => Message::Choke,
                1 => Message::Unchoke,
                2 => Message::Interested,
                _ => Message::NotInterested,
            }
        }
        4 => {
            if payload.len() != 4 {
                return Err(SessionError::BadPayload("have"));
            }
            Message::Have(read_u32(payload, 0).ok_or(SessionError::BadPayload("have"))?)
        }
        5 => Message::Bitfield(payload.to_vec()),
        6 | 8 => {
            let request = parse_block_request(payload)
                .ok_or(SessionError::BadPayload("request"))?;
            if id == 6 {
                Message::Request(request)
            } else {
                Message::Cancel(request)
            }
        }
        7 => {
            if payload.len() < 8 {
                return Err(SessionError::BadPayload("piece"));
            }
            Message::Piece {
                index: read_u32(payload, 0).ok_or(SessionError::BadPayload("piece"))?,
                begin: read_u32(payload, 4).ok_or(SessionError::BadPayload("piece"))?,
                block: payload[8..].to_vec(),
            }
        }
        9 => {
            let bytes: [u8; 2] = payload
                .try_into()
                .map_err(|_| SessionError::BadPayload("port"))?;
            Message::Port(u16::from_be_bytes(bytes))
        }
        other => return Err(SessionError::UnexpectedMessageId(other)),
    };
    Ok(message)
}

fn parse_block_request(payload: &[u8]) -> Option<BlockRequest> {
    if payload.len() != 12 {
        return None;
    }
    Some(BlockRequest {
        index: read_u32(payload, 0)?,
        begin: read_u32(payload, 4)?,
        length: read_u32(payload, 8)?,
    })
}

fn read_u32(payload: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

impl Encoder<Message> for MessageFramer {
    type Error = SessionError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), SessionError> {
        let (id, payload): (u8, Vec<u8>) = match item {
            Message::KeepAlive => {
                dst.put_u32(0);
                return Ok(());
            }
            Message::Choke => (0, Vec::new()),
            Message::Unchoke => (1, Vec::new()),
            Message::Interested => (2, Vec::new()),
            Message::NotInterested => (3, Vec::new()),
            Message::Have(index) => (4, index.to_be_bytes().to_vec()),
            Message::Bitfield(bytes) => (5, bytes),
            Message::Request(req) => (6, encode_block_request(req)),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&block);
                (7, payload)
            }
            Message::Cancel(req) => (8, encode_block_request(req)),
            Message::Port(port) => (9, port.to_be_bytes().to_vec()),
        };
        let length = payload.len() + 1;
        if length > MAX_FRAME_SIZE {
            return Err(SessionError::BadFrameLength(length));
        }
        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(id);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

fn encode_block_request(req: BlockRequest) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&req.index.to_be_bytes());
    payload.extend_from_slice(&req.begin.to_be_bytes());
    payload.extend_from_slice(&req.length.to_be_bytes());
    payload
}

/// Dials a peer and exchanges handshakes. Returns the connected stream and
/// the peer's claimed id.
pub async fn connect(
    addr: SocketAddrV4,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<(TcpStream, [u8; 20]), SessionError> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| SessionError::ConnectTimeout)??;
    handshake(stream, info_hash, peer_id).await
}

async fn handshake(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<(TcpStream, [u8; 20]), SessionError> {
    let exchanged = timeout(HANDSHAKE_TIMEOUT, async {
        stream
            .write_all(&Handshake::new(info_hash, peer_id).to_bytes())
            .await?;
        let mut buf = [0u8; Handshake::LEN];
        stream.read_exact(&mut buf).await?;
        Ok::<_, SessionError>(buf)
    })
    .await
    .map_err(|_| SessionError::HandshakeTimeout)??;
    let theirs = Handshake::parse(&exchanged, &info_hash)?;
    Ok((stream, theirs.peer_id))
}

/// One peer connection. Owns its flags, the peer's bitfield and the piece
/// it is currently assembling; everything global goes through the
/// coordinator channels.
pub struct PeerSession<T = TcpStream> {
    id: SessionId,
    stream: Framed<T, MessageFramer>,
    meta: Arc<Metainfo>,
    events: kanal::AsyncSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    peer_bitfield: Bitfield,
    assembly: Option<PieceAssembly>,
    awaiting_first_frame: bool,
    last_outbound: Instant,
    last_inbound: Instant,
    // set while unchoked with an assignment and cleared on block arrival
    stalled_since: Option<Instant>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> PeerSession<T> {
    pub fn new(
        id: SessionId,
        stream: T,
        meta: Arc<Metainfo>,
        events: kanal::AsyncSender<SessionEvent>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let piece_count = meta.piece_count();
        let now = Instant::now();
        Self {
            id,
            stream: Framed::new(stream, MessageFramer),
            meta,
            events,
            commands,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: Bitfield::new(piece_count),
            assembly: None,
            awaiting_first_frame: true,
            last_outbound: now,
            last_inbound: now,
            stalled_since: None,
        }
    }

    pub async fn run(mut self) -> Result<(), SessionError> {
        loop {
            let keepalive_at = self.last_outbound + KEEPALIVE_INTERVAL;
            let idle_at = self.last_inbound + IDLE_TIMEOUT;
            let stall_at = self.stalled_since.map(|since| since + STALL_TIMEOUT);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Have(index)) => {
                        self.send(Message::Have(index)).await?;
                    }
                    Some(SessionCommand::Retry) => {
                        self.claim_if_idle().await?;
                    }
                    // coordinator hung up or told us to stop
                    Some(SessionCommand::Terminate) | None => return Ok(()),
                },
                frame = self.stream.next() => match frame {
                    Some(message) => {
                        self.last_inbound = Instant::now();
                        self.handle_message(message?).await?;
                    }
                    None => return Err(SessionError::PeerClosedConnection),
                },
                _ = tokio::time::sleep_until(keepalive_at) => {
                    self.send(Message::KeepAlive).await?;
                }
                _ = tokio::time::sleep_until(idle_at) => {
                    return Err(SessionError::ReadTimeout);
                }
                _ = sleep_until_opt(stall_at) => {
                    return Err(SessionError::Stalled);
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), SessionError> {
        let first_frame = std::mem::replace(&mut self.awaiting_first_frame, false);
        trace!(session = self.id, ?message, "inbound");
        match message {
            Message::KeepAlive => {}
            Message::Bitfield(payload) => {
                if !first_frame {
                    return Err(SessionError::UnexpectedMessageId(5));
                }
                self.peer_bitfield = Bitfield::from_payload(payload, self.meta.piece_count())?;
                self.claim_if_idle().await?;
            }
            Message::Have(index) => {
                self.peer_bitfield.set_piece(index as usize);
                self.claim_if_idle().await?;
            }
            Message::Choke => {
                self.peer_choking = true;
                self.stalled_since = None;
                // a choking peer will not answer what is in flight
                if let Some(assembly) = &mut self.assembly {
                    assembly.requeue_outstanding();
                }
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.claim_if_idle().await?;
                self.fill_pipeline().await?;
                // only count stall time while blocks are actually owed to us
                if self.assembly.is_some() && self.stalled_since.is_none() {
                    self.stalled_since = Some(Instant::now());
                }
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let assembly = self
                    .assembly
                    .as_mut()
                    .filter(|assembly| assembly.index == index)
                    .ok_or(SessionError::UnsolicitedPiece)?;
                let done = assembly
                    .accept(begin, &block)
                    .map_err(|()| SessionError::UnsolicitedPiece)?;
                self.stalled_since = Some(Instant::now());
                if done {
                    if let Some(assembly) = self.assembly.take() {
                        let index = assembly.index;
                        self.emit(SessionEvent::PieceAssembled {
                            id: self.id,
                            index,
                            bytes: assembly.into_bytes(),
                        })
                        .await?;
                        self.claim_if_idle().await?;
                    }
                } else {
                    self.fill_pipeline().await?;
                }
            }
            // leecher: we serve nothing and run no DHT
            Message::Request(_) | Message::Cancel(_) | Message::Port(_) => {}
        }
        Ok(())
    }

    /// Asks the coordinator for a piece when none is being assembled, and
    /// keeps the interest flag in sync with the answer.
    async fn claim_if_idle(&mut self) -> Result<(), SessionError> {
        if self.assembly.is_some() || self.peer_bitfield.is_empty() {
            return Ok(());
        }
        let (reply, answer) = oneshot::channel();
        self.emit(SessionEvent::Claim {
            id: self.id,
            have: self.peer_bitfield.clone(),
            reply,
        })
        .await?;
        let assignment = answer.await.map_err(|_| SessionError::CoordinatorGone)?;
        match assignment {
            Some(assignment) => {
                debug!(session = self.id, piece = assignment.index, "assigned");
                self.assembly = Some(PieceAssembly::new(assignment.index, assignment.size));
                if !self.am_interested {
                    self.am_interested = true;
                    self.send(Message::Interested).await?;
                }
                if !self.peer_choking {
                    self.stalled_since = Some(Instant::now());
                    self.fill_pipeline().await?;
                }
            }
            None => {
                self.stalled_since = None;
                if self.am_interested {
                    self.am_interested = false;
                    self.send(Message::NotInterested).await?;
                }
            }
        }
        Ok(())
    }

    async fn fill_pipeline(&mut self) -> Result<(), SessionError> {
        let requests = match &mut self.assembly {
            Some(assembly) if !self.peer_choking => assembly.take_requests(PIPELINE_DEPTH),
            _ => return Ok(()),
        };
        for request in requests {
            self.send(Message::Request(request)).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<(), SessionError> {
        self.stream.send(message).await?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    async fn emit(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::CoordinatorGone)
    }

    /// `(am_choking, am_interested, peer_choking, peer_interested)`.
    pub fn flags(&self) -> (bool, bool, bool, bool) {
        (
            self.am_choking,
            self.am_interested,
            self.peer_choking,
            self.peer_interested,
        )
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::PieceAssignment;
    use tokio::io::duplex;

    #[test]
    fn handshake_wire_layout() {
        let mut info_hash = [0u8; 20];
        for (i, byte) in info_hash.iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }
        let peer_id = *b"-PC0001-123456789012";
        let bytes = Handshake::new(info_hash, peer_id).to_bytes();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &info_hash);
        assert_eq!(&bytes[48..68], &peer_id);
        assert_eq!(Handshake::parse(&bytes, &info_hash).unwrap().peer_id, peer_id);
    }

    #[test]
    fn handshake_wrong_hash_rejected() {
        let bytes = Handshake::new([1u8; 20], [2u8; 20]).to_bytes();
        assert!(matches!(
            Handshake::parse(&bytes, &[9u8; 20]),
            Err(SessionError::HandshakeMismatch)
        ));
        let mut bad_pstr = bytes;
        bad_pstr[1] = b'b';
        assert!(matches!(
            Handshake::parse(&bad_pstr, &[1u8; 20]),
            Err(SessionError::HandshakeMismatch)
        ));
    }

    fn decode_one(bytes: &[u8]) -> Result<Option<Message>, SessionError> {
        let mut buf = BytesMut::from(bytes);
        MessageFramer.decode(&mut buf)
    }

    fn encode_one(message: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageFramer.encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn frame_round_trips() {
        let messages = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Bitfield(vec![0b10100000]),
            Message::Request(BlockRequest {
                index: 1,
                begin: 16384,
                length: 16384,
            }),
            Message::Piece {
                index: 1,
                begin: 0,
                block: vec![7u8; 32],
            },
            Message::Cancel(BlockRequest {
                index: 2,
                begin: 0,
                length: 100,
            }),
            Message::Port(6881),
        ];
        for message in messages {
            let encoded = encode_one(message.clone());
            assert_eq!(decode_one(&encoded).unwrap(), Some(message));
        }
    }

    #[test]
    fn request_frame_layout() {
        let encoded = encode_one(Message::Request(BlockRequest {
            index: 1,
            begin: 2,
            length: 3,
        }));
        assert_eq!(
            encoded.as_ref(),
            [0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let full = encode_one(Message::Have(7));
        let mut buf = BytesMut::from(&full[..6]);
        assert_eq!(MessageFramer.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u8(7);
        assert!(matches!(
            MessageFramer.decode(&mut buf),
            Err(SessionError::BadFrameLength(_))
        ));
    }

    #[test]
    fn unknown_id_rejected() {
        assert!(matches!(
            decode_one(&[0, 0, 0, 1, 10]),
            Err(SessionError::UnexpectedMessageId(10))
        ));
    }

    #[test]
    fn malformed_payloads_rejected() {
        // have with 3-byte payload
        assert!(matches!(
            decode_one(&[0, 0, 0, 4, 4, 0, 0, 1]),
            Err(SessionError::BadPayload("have"))
        ));
        // choke with payload
        assert!(matches!(
            decode_one(&[0, 0, 0, 2, 0, 0]),
            Err(SessionError::BadPayload("flag"))
        ));
    }

    // -- session state machine, driven over an in-memory transport --

    struct Harness {
        peer: Framed<tokio::io::DuplexStream, MessageFramer>,
        events: kanal::AsyncReceiver<SessionEvent>,
        commands: mpsc::UnboundedSender<SessionCommand>,
        task: tokio::task::JoinHandle<Result<(), SessionError>>,
    }

    fn two_piece_meta() -> Arc<Metainfo> {
        use sha1::{Digest, Sha1};
        let piece0: [u8; 20] = Sha1::digest([1u8; 16]).into();
        let piece1: [u8; 20] = Sha1::digest([2u8; 4]).into();
        Arc::new(Metainfo {
            announce: "http://tracker.example/announce".into(),
            announce_list: Vec::new(),
            info_hash: [7u8; 20],
            name: "file".into(),
            piece_length: 16,
            total_length: 20,
            piece_hashes: vec![piece0, piece1],
        })
    }

    fn spawn_session(meta: Arc<Metainfo>) -> Harness {
        let (ours, theirs) = duplex(1 << 16);
        let (event_tx, event_rx) = kanal::bounded_async(32);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(1, ours, meta, event_tx, command_rx);
        Harness {
            peer: Framed::new(theirs, MessageFramer),
            events: event_rx,
            commands: command_tx,
            task: tokio::spawn(session.run()),
        }
    }

    async fn answer_claim(events: &kanal::AsyncReceiver<SessionEvent>, grant: Option<PieceAssignment>) -> Bitfield {
        match events.recv().await.unwrap() {
            SessionEvent::Claim { have, reply, .. } => {
                reply.send(grant).unwrap();
                have
            }
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sessions_start_choked_and_uninterested() {
        let (ours, _theirs) = duplex(64);
        let (event_tx, _event_rx) = kanal::bounded_async(1);
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(1, ours, two_piece_meta(), event_tx, command_rx);
        assert_eq!(session.flags(), (true, false, true, false));
    }

    #[tokio::test]
    async fn session_downloads_an_assigned_piece() {
        let mut harness = spawn_session(two_piece_meta());

        // first frame: full bitfield
        harness.peer.send(Message::Bitfield(vec![0b1100_0000])).await.unwrap();
        let have = answer_claim(
            &harness.events,
            Some(PieceAssignment { index: 0, size: 16 }),
        )
        .await;
        assert!(have.has_piece(0) && have.has_piece(1));

        // the session declares interest, we unchoke it
        assert_eq!(harness.peer.next().await.unwrap().unwrap(), Message::Interested);
        harness.peer.send(Message::Unchoke).await.unwrap();

        // single short request for the whole piece
        let request = harness.peer.next().await.unwrap().unwrap();
        assert_eq!(
            request,
            Message::Request(BlockRequest {
                index: 0,
                begin: 0,
                length: 16,
            })
        );
        harness
            .peer
            .send(Message::Piece {
                index: 0,
                begin: 0,
                block: vec![1u8; 16],
            })
            .await
            .unwrap();

        match harness.events.recv().await.unwrap() {
            SessionEvent::PieceAssembled { id, index, bytes } => {
                assert_eq!(id, 1);
                assert_eq!(index, 0);
                assert_eq!(bytes, vec![1u8; 16]);
            }
            other => panic!("expected piece, got {other:?}"),
        }

        // it immediately asks for more; nothing left, so interest drops
        answer_claim(&harness.events, None).await;
        assert_eq!(
            harness.peer.next().await.unwrap().unwrap(),
            Message::NotInterested
        );

        harness.commands.send(SessionCommand::Terminate).unwrap();
        assert!(harness.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn late_bitfield_is_fatal() {
        let mut harness = spawn_session(two_piece_meta());
        harness.peer.send(Message::Have(0)).await.unwrap();
        answer_claim(&harness.events, None).await;
        harness.peer.send(Message::Bitfield(vec![0b1100_0000])).await.unwrap();
        assert!(matches!(
            harness.task.await.unwrap(),
            Err(SessionError::UnexpectedMessageId(5))
        ));
    }

    #[tokio::test]
    async fn bitfield_spare_bits_drop_connection() {
        let mut harness = spawn_session(two_piece_meta());
        // two pieces; bit 2 must not be set
        harness.peer.send(Message::Bitfield(vec![0b1110_0000])).await.unwrap();
        assert!(matches!(
            harness.task.await.unwrap(),
            Err(SessionError::BitfieldSpareBitsSet)
        ));
    }

    #[tokio::test]
    async fn unsolicited_block_is_fatal() {
        let mut harness = spawn_session(two_piece_meta());
        harness.peer.send(Message::Bitfield(vec![0b1100_0000])).await.unwrap();
        answer_claim(
            &harness.events,
            Some(PieceAssignment { index: 0, size: 16 }),
        )
        .await;
        assert_eq!(harness.peer.next().await.unwrap().unwrap(), Message::Interested);
        // never requested: still choked
        harness
            .peer
            .send(Message::Piece {
                index: 0,
                begin: 0,
                block: vec![0u8; 16],
            })
            .await
            .unwrap();
        assert!(matches!(
            harness.task.await.unwrap(),
            Err(SessionError::UnsolicitedPiece)
        ));
    }

    #[tokio::test]
    async fn have_broadcast_reaches_peer() {
        let mut harness = spawn_session(two_piece_meta());
        harness.commands.send(SessionCommand::Have(1)).unwrap();
        assert_eq!(harness.peer.next().await.unwrap().unwrap(), Message::Have(1));
        harness.commands.send(SessionCommand::Terminate).unwrap();
        assert!(harness.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn retry_command_reclaims_after_losing_a_race() {
        let mut harness = spawn_session(two_piece_meta());
        harness.peer.send(Message::Bitfield(vec![0b1100_0000])).await.unwrap();
        // nothing assignable right now: another session holds everything
        answer_claim(&harness.events, None).await;

        // a piece reverted to missing; the coordinator nudges us to re-ask
        harness.commands.send(SessionCommand::Retry).unwrap();
        answer_claim(
            &harness.events,
            Some(PieceAssignment { index: 1, size: 4 }),
        )
        .await;
        assert_eq!(harness.peer.next().await.unwrap().unwrap(), Message::Interested);

        harness.commands.send(SessionCommand::Terminate).unwrap();
        assert!(harness.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn choke_requeues_outstanding_requests() {
        let mut harness = spawn_session(two_piece_meta());
        harness.peer.send(Message::Bitfield(vec![0b1100_0000])).await.unwrap();
        answer_claim(
            &harness.events,
            Some(PieceAssignment { index: 0, size: 16 }),
        )
        .await;
        assert_eq!(harness.peer.next().await.unwrap().unwrap(), Message::Interested);
        harness.peer.send(Message::Unchoke).await.unwrap();
        let first = harness.peer.next().await.unwrap().unwrap();
        assert!(matches!(first, Message::Request(_)));

        // choke, then unchoke: the same request must be reissued
        harness.peer.send(Message::Choke).await.unwrap();
        harness.peer.send(Message::Unchoke).await.unwrap();
        let second = harness.peer.next().await.unwrap().unwrap();
        assert_eq!(first, second);

        harness.commands.send(SessionCommand::Terminate).unwrap();
        assert!(harness.task.await.unwrap().is_ok());
    }
}
