use thiserror::Error;

/// Which pieces a peer claims to hold. Bit 0 is the high bit of byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    n_pieces: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("bitfield is {got} bytes, expected {expected} for {pieces} pieces")]
    SizeMismatch {
        got: usize,
        expected: usize,
        pieces: usize,
    },
    #[error("bitfield has bits set past piece {0}")]
    SpareBitsSet(usize),
}

impl Bitfield {
    pub fn new(n_pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; n_pieces.div_ceil(8)],
            n_pieces,
        }
    }

    /// Validates a wire payload: exact byte length, and no bits set beyond
    /// the last piece. Either violation drops the connection.
    pub fn from_payload(data: Vec<u8>, n_pieces: usize) -> Result<Self, BitfieldError> {
        let expected = n_pieces.div_ceil(8);
        if data.len() != expected {
            return Err(BitfieldError::SizeMismatch {
                got: data.len(),
                expected,
                pieces: n_pieces,
            });
        }
        if n_pieces % 8 != 0 {
            let spare = data[expected - 1] & (0xffu8 >> (n_pieces % 8));
            if spare != 0 {
                return Err(BitfieldError::SpareBitsSet(n_pieces - 1));
            }
        }
        Ok(Self {
            bytes: data,
            n_pieces,
        })
    }

    pub fn set_piece(&mut self, piece_i: usize) {
        if piece_i < self.n_pieces {
            self.bytes[piece_i / 8] |= 0b1000_0000 >> (piece_i % 8);
        }
    }

    pub fn has_piece(&self, piece_i: usize) -> bool {
        if piece_i >= self.n_pieces {
            return false;
        }
        self.bytes[piece_i / 8] & (0b1000_0000 >> (piece_i % 8)) != 0
    }

    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.n_pieces).filter(|&i| self.has_piece(i))
    }

    pub fn count_set(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_set_and_has() {
        let mut bf = Bitfield::new(36);
        bf.set_piece(35);
        assert!(bf.has_piece(35));
        assert!(!bf.has_piece(34));
        assert!(!bf.has_piece(36));
    }

    #[test]
    fn bitfield_from_payload() {
        let bf = Bitfield::from_payload(vec![0b10101010, 0b01110110], 16).unwrap();
        assert!(bf.has_piece(0));
        assert!(!bf.has_piece(1));
        assert!(!bf.has_piece(7));
        assert!(!bf.has_piece(8));
        assert!(bf.has_piece(14));
        assert_eq!(bf.count_set(), 9);
    }

    #[test]
    fn bitfield_pieces() {
        let bf = Bitfield::from_payload(vec![0b10101010, 0b01110110], 16).unwrap();
        let pieces: Vec<usize> = bf.pieces().collect();
        assert_eq!(pieces, vec![0, 2, 4, 6, 9, 10, 11, 13, 14]);
    }

    #[test]
    fn wrong_length_rejected() {
        assert_eq!(
            Bitfield::from_payload(vec![0u8; 2], 17),
            Err(BitfieldError::SizeMismatch {
                got: 2,
                expected: 3,
                pieces: 17,
            })
        );
    }

    #[test]
    fn spare_bits_rejected() {
        // 10 pieces fit in 2 bytes; the low 6 bits of byte 1 must be clear
        let err = Bitfield::from_payload(vec![0xff, 0b11000100], 10);
        assert_eq!(err, Err(BitfieldError::SpareBitsSet(9)));
        let ok = Bitfield::from_payload(vec![0xff, 0b11000000], 10).unwrap();
        assert_eq!(ok.count_set(), 10);
    }
}
