use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Random-access sink for verified pieces. The output file is created at
/// its final size up front and mapped writable; pieces land at
/// `index * piece_length`. Flushed once, when the download completes.
pub struct Storage {
    path: PathBuf,
    map: MmapMut,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("create output file {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("write of {len} bytes at offset {offset} exceeds file size {size}")]
    WriteOutOfRange { offset: u64, len: usize, size: u64 },
    #[error("flush {path}: {source}")]
    Flush {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Storage {
    pub fn create(path: impl AsRef<Path>, total_length: u64) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let wrap = |source| StorageError::Create {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(wrap)?;
        file.set_len(total_length).map_err(wrap)?;
        // Safety: the map is private to this process and backed by a file
        // we just created and sized.
        let map = unsafe { MmapMut::map_mut(&file).map_err(wrap)? };
        Ok(Self { path, map })
    }

    pub fn write_piece(
        &mut self,
        index: usize,
        piece_length: usize,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let offset = index * piece_length;
        if offset + bytes.len() > self.map.len() {
            return Err(StorageError::WriteOutOfRange {
                offset: offset as u64,
                len: bytes.len(),
                size: self.map.len() as u64,
            });
        }
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.map.flush().map_err(|source| StorageError::Flush {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
