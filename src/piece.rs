use crate::BLOCK_SIZE;
use crate::bitfield::Bitfield;
use std::collections::HashSet;

pub type SessionId = u64;

/// Global per-piece download state. Transitions happen only inside the
/// coordinator, which owns the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    InFlight(SessionId),
    Complete,
}

#[derive(Debug)]
pub struct PieceTable {
    states: Vec<PieceState>,
    complete: usize,
}

impl PieceTable {
    pub fn new(piece_count: usize) -> Self {
        Self {
            states: vec![PieceState::Missing; piece_count],
            complete: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, index: usize) -> PieceState {
        self.states[index]
    }

    /// Lowest missing piece the peer can serve, atomically marked in-flight
    /// for `session`. `None` means this peer has nothing we need right now.
    pub fn claim(&mut self, session: SessionId, have: &Bitfield) -> Option<usize> {
        let index = self
            .states
            .iter()
            .enumerate()
            .find(|(i, state)| **state == PieceState::Missing && have.has_piece(*i))
            .map(|(i, _)| i)?;
        self.states[index] = PieceState::InFlight(session);
        Some(index)
    }

    /// Reverts one in-flight piece to missing. True if `session` held it.
    pub fn release(&mut self, session: SessionId, index: usize) -> bool {
        if self.states[index] == PieceState::InFlight(session) {
            self.states[index] = PieceState::Missing;
            true
        } else {
            false
        }
    }

    /// Reverts every piece `session` held. Called when a session dies.
    pub fn release_all(&mut self, session: SessionId) -> Vec<usize> {
        let mut released = Vec::new();
        for (index, state) in self.states.iter_mut().enumerate() {
            if *state == PieceState::InFlight(session) {
                *state = PieceState::Missing;
                released.push(index);
            }
        }
        released
    }

    /// Marks a verified piece complete. True if `session` held it.
    pub fn complete(&mut self, session: SessionId, index: usize) -> bool {
        if self.states[index] == PieceState::InFlight(session) {
            self.states[index] = PieceState::Complete;
            self.complete += 1;
            true
        } else {
            false
        }
    }

    pub fn completed(&self) -> usize {
        self.complete
    }

    pub fn all_complete(&self) -> bool {
        self.complete == self.states.len()
    }
}

/// One block request on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// The blocks of a piece partition `[0, piece_size)`: 16 KiB each, the
/// final one truncated.
pub fn block_layout(index: u32, piece_size: usize) -> impl Iterator<Item = BlockRequest> {
    (0..piece_size.div_ceil(BLOCK_SIZE)).map(move |block_i| {
        let begin = block_i * BLOCK_SIZE;
        BlockRequest {
            index,
            begin: begin as u32,
            length: (piece_size - begin).min(BLOCK_SIZE) as u32,
        }
    })
}

/// Reassembly buffer for the one piece a session is filling. Tracks which
/// blocks are still unrequested and which requests are outstanding, so an
/// unsolicited or duplicate block is detectable.
#[derive(Debug)]
pub struct PieceAssembly {
    pub index: u32,
    buf: Vec<u8>,
    unrequested: Vec<BlockRequest>,
    outstanding: HashSet<BlockRequest>,
    received: usize,
}

impl PieceAssembly {
    pub fn new(index: u32, piece_size: usize) -> Self {
        let mut unrequested: Vec<BlockRequest> = block_layout(index, piece_size).collect();
        // pop() takes from the back; keep wire order front-first
        unrequested.reverse();
        Self {
            index,
            buf: vec![0u8; piece_size],
            unrequested,
            outstanding: HashSet::new(),
            received: 0,
        }
    }

    /// Next requests to send, keeping at most `depth` outstanding.
    pub fn take_requests(&mut self, depth: usize) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        while self.outstanding.len() < depth {
            let Some(req) = self.unrequested.pop() else {
                break;
            };
            self.outstanding.insert(req);
            out.push(req);
        }
        out
    }

    /// All outstanding requests go back to the unrequested pool. Used when
    /// the peer chokes us: choking implicitly discards pending requests.
    pub fn requeue_outstanding(&mut self) {
        let mut dropped: Vec<BlockRequest> = self.outstanding.drain().collect();
        dropped.sort_by_key(|req| std::cmp::Reverse(req.begin));
        self.unrequested.extend(dropped);
    }

    /// Accepts one block. `Ok(true)` when the piece is fully assembled.
    /// `Err(())` marks a block we never asked for.
    pub fn accept(&mut self, begin: u32, block: &[u8]) -> Result<bool, ()> {
        let req = BlockRequest {
            index: self.index,
            begin,
            length: block.len() as u32,
        };
        if !self.outstanding.remove(&req) {
            return Err(());
        }
        self.buf[begin as usize..begin as usize + block.len()].copy_from_slice(block);
        self.received += block.len();
        Ok(self.received == self.buf.len())
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn have_all(n: usize) -> Bitfield {
        let mut bf = Bitfield::new(n);
        for i in 0..n {
            bf.set_piece(i);
        }
        bf
    }

    #[test]
    fn claim_is_lowest_index_first() {
        let mut table = PieceTable::new(4);
        let have = have_all(4);
        assert_eq!(table.claim(1, &have), Some(0));
        assert_eq!(table.claim(1, &have), Some(1));
        assert_eq!(table.claim(2, &have), Some(2));
    }

    #[test]
    fn claim_respects_peer_bitfield() {
        let mut table = PieceTable::new(3);
        let mut have = Bitfield::new(3);
        have.set_piece(2);
        assert_eq!(table.claim(1, &have), Some(2));
        assert_eq!(table.claim(1, &have), None);
    }

    #[test]
    fn at_most_one_claimant_per_piece() {
        let mut table = PieceTable::new(2);
        let have = have_all(2);
        assert_eq!(table.claim(1, &have), Some(0));
        assert_eq!(table.claim(2, &have), Some(1));
        // nothing left for a third session
        assert_eq!(table.claim(3, &have), None);
        assert_eq!(table.state(0), PieceState::InFlight(1));
        assert_eq!(table.state(1), PieceState::InFlight(2));
    }

    #[test]
    fn release_returns_piece_to_missing() {
        let mut table = PieceTable::new(2);
        let have = have_all(2);
        table.claim(1, &have);
        assert!(table.release(1, 0));
        assert_eq!(table.state(0), PieceState::Missing);
        // a stranger cannot release someone else's piece
        table.claim(2, &have);
        assert!(!table.release(1, 0));
    }

    #[test]
    fn complete_and_termination() {
        let mut table = PieceTable::new(2);
        let have = have_all(2);
        table.claim(1, &have);
        table.claim(1, &have);
        assert!(table.complete(1, 0));
        assert!(!table.all_complete());
        assert!(table.complete(1, 1));
        assert!(table.all_complete());
        // completed pieces are never handed out again
        assert_eq!(table.claim(2, &have), None);
    }

    #[test]
    fn release_all_on_session_death() {
        let mut table = PieceTable::new(3);
        let have = have_all(3);
        table.claim(7, &have);
        table.claim(7, &have);
        table.claim(8, &have);
        assert_eq!(table.release_all(7), vec![0, 1]);
        assert_eq!(table.state(0), PieceState::Missing);
        assert_eq!(table.state(2), PieceState::InFlight(8));
    }

    #[test]
    fn block_layout_partitions_piece() {
        let piece_size = 2 * BLOCK_SIZE + 100;
        let blocks: Vec<BlockRequest> = block_layout(3, piece_size).collect();
        assert_eq!(blocks.len(), 3);
        let mut offset = 0u32;
        for block in &blocks {
            assert_eq!(block.index, 3);
            assert_eq!(block.begin, offset);
            offset += block.length;
        }
        assert_eq!(offset as usize, piece_size);
        assert_eq!(blocks[2].length, 100);
    }

    #[test]
    fn short_piece_single_short_block() {
        let blocks: Vec<BlockRequest> = block_layout(1, 4).collect();
        assert_eq!(blocks, vec![BlockRequest {
            index: 1,
            begin: 0,
            length: 4,
        }]);
    }

    #[test]
    fn assembly_pipeline_and_completion() {
        let mut asm = PieceAssembly::new(0, 2 * BLOCK_SIZE + 4);
        let first = asm.take_requests(5);
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].begin, 0);
        assert_eq!(asm.take_requests(5), Vec::new());

        assert_eq!(asm.accept(0, &vec![1u8; BLOCK_SIZE]), Ok(false));
        assert_eq!(
            asm.accept(BLOCK_SIZE as u32, &vec![2u8; BLOCK_SIZE]),
            Ok(false)
        );
        assert_eq!(asm.accept(2 * BLOCK_SIZE as u32, &[3u8; 4]), Ok(true));
        let bytes = asm.into_bytes();
        assert_eq!(bytes.len(), 2 * BLOCK_SIZE + 4);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[2 * BLOCK_SIZE], 3);
    }

    #[test]
    fn unsolicited_block_rejected() {
        let mut asm = PieceAssembly::new(0, BLOCK_SIZE);
        assert_eq!(asm.accept(0, &[0u8; 16]), Err(()));
        asm.take_requests(5);
        // wrong length for an outstanding offset is still unsolicited
        assert_eq!(asm.accept(0, &[0u8; 16]), Err(()));
        assert_eq!(asm.accept(0, &vec![0u8; BLOCK_SIZE]), Ok(true));
    }

    #[test]
    fn requeue_after_choke_preserves_order() {
        let mut asm = PieceAssembly::new(0, 3 * BLOCK_SIZE);
        let sent = asm.take_requests(2);
        assert_eq!(sent.len(), 2);
        asm.requeue_outstanding();
        assert_eq!(asm.outstanding(), 0);
        let resent = asm.take_requests(3);
        assert_eq!(resent.len(), 3);
        assert_eq!(resent[0].begin, 0);
        assert_eq!(resent[1].begin, BLOCK_SIZE as u32);
    }
}
