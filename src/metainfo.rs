use crate::bencode::{self, BencodeError, Node, NodeValue};
use sha1::{Digest, Sha1};
use std::path::Path;
use thiserror::Error;

/// Typed view over a `.torrent` file. Single-file mode only.
#[derive(Debug, Clone)]
pub struct Metainfo {
    // The URL of the tracker.
    pub announce: String,
    // Optional tiers of backup trackers (BEP-12). Outer list is tier order,
    // inner lists are equivalent trackers within a tier.
    pub announce_list: Vec<Vec<String>>,
    // SHA1 over the bencoded `info` dictionary exactly as it appeared in
    // the source file. Never recomputed from a re-encoding: torrents with
    // non-canonical key order would hash differently and the swarm would
    // not recognize us.
    pub info_hash: [u8; 20],
    // Suggested name to save the file as.
    pub name: String,
    // Number of bytes in each piece the file is split into. All pieces are
    // the same length except possibly the truncated last one.
    pub piece_length: usize,
    pub total_length: usize,
    // One 20-byte SHA1 per piece, in piece order.
    pub piece_hashes: Vec<[u8; 20]>,
}

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("read torrent file: {0}")]
    Io(#[from] std::io::Error),
    #[error("torrent root is not a dictionary")]
    NotADict,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("field `{0}` must be positive")]
    NonPositive(&'static str),
    #[error("`pieces` length {0} is not a multiple of 20")]
    BadPiecesLength(usize),
    #[error("{found} piece hashes for a {expected}-piece file")]
    PieceCountMismatch { expected: usize, found: usize },
    #[error("multi-file torrents are not supported")]
    MultiFile,
}

impl Metainfo {
    pub async fn read(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let root = bencode::decode_spanned(bytes)?;
        if !matches!(root.value, NodeValue::Dict(_)) {
            return Err(MetainfoError::NotADict);
        }

        let announce = utf8_field(&root, "announce")?;
        let announce_list = match root.lookup(b"announce-list") {
            Some(node) => parse_announce_list(node)?,
            None => Vec::new(),
        };

        let info = root
            .lookup(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_hash = Sha1::digest(&bytes[info.span.clone()]).into();

        if info.lookup(b"files").is_some() {
            return Err(MetainfoError::MultiFile);
        }
        let name = utf8_field(info, "name")?;
        let piece_length = positive_field(info, "piece length")?;
        let total_length = positive_field(info, "length")?;

        let pieces = match info.lookup(b"pieces").map(|n| &n.value) {
            Some(NodeValue::Bytes(b)) => b,
            Some(_) => return Err(MetainfoError::WrongType("pieces")),
            None => return Err(MetainfoError::MissingField("pieces")),
        };
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::BadPiecesLength(pieces.len()));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().expect("chunks_exact yields 20 bytes"))
            .collect();

        let expected = total_length.div_ceil(piece_length);
        if piece_hashes.len() != expected {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                found: piece_hashes.len(),
            });
        }

        Ok(Metainfo {
            announce,
            announce_list,
            info_hash,
            name,
            piece_length,
            total_length,
            piece_hashes,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Every piece is `piece_length` bytes except the truncated last one.
    pub fn piece_size(&self, index: usize) -> usize {
        if index == self.piece_count() - 1 {
            let modulo = self.total_length % self.piece_length;
            if modulo == 0 { self.piece_length } else { modulo }
        } else {
            self.piece_length
        }
    }

    pub fn block_count(&self, index: usize) -> usize {
        self.piece_size(index).div_ceil(crate::BLOCK_SIZE)
    }

    /// Announce tiers in failover order. When the torrent carries no
    /// `announce-list`, the bare `announce` URL forms a single tier.
    pub fn tiers(&self) -> Vec<Vec<String>> {
        if self.announce_list.is_empty() {
            vec![vec![self.announce.clone()]]
        } else {
            self.announce_list.clone()
        }
    }
}

fn parse_announce_list(node: &Node) -> Result<Vec<Vec<String>>, MetainfoError> {
    let NodeValue::List(tiers) = &node.value else {
        return Err(MetainfoError::WrongType("announce-list"));
    };
    let mut out = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let NodeValue::List(urls) = &tier.value else {
            return Err(MetainfoError::WrongType("announce-list"));
        };
        let mut tier_urls = Vec::with_capacity(urls.len());
        for url in urls {
            let NodeValue::Bytes(b) = &url.value else {
                return Err(MetainfoError::WrongType("announce-list"));
            };
            let url = String::from_utf8(b.clone())
                .map_err(|_| MetainfoError::InvalidUtf8("announce-list"))?;
            tier_urls.push(url);
        }
        out.push(tier_urls);
    }
    Ok(out)
}

fn utf8_field(node: &Node, field: &'static str) -> Result<String, MetainfoError> {
    match node.lookup(field.as_bytes()).map(|n| &n.value) {
        Some(NodeValue::Bytes(b)) => {
            String::from_utf8(b.clone()).map_err(|_| MetainfoError::InvalidUtf8(field))
        }
        Some(_) => Err(MetainfoError::WrongType(field)),
        None => Err(MetainfoError::MissingField(field)),
    }
}

fn positive_field(node: &Node, field: &'static str) -> Result<usize, MetainfoError> {
    match node.lookup(field.as_bytes()).map(|n| &n.value) {
        Some(NodeValue::Int(n)) if *n > 0 => Ok(*n as usize),
        Some(NodeValue::Int(_)) => Err(MetainfoError::NonPositive(field)),
        Some(_) => Err(MetainfoError::WrongType(field)),
        None => Err(MetainfoError::MissingField(field)),
    }
}
