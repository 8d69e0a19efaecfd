//! Mirror-side block database.
//!
//! Building this file from a directory tree is the `create-manifest`
//! tool's job and out of scope here; the mirror only opens an existing
//! flat file of `blockcount` blocks of `blocksize` bytes each, indexed
//! `0 .. blockcount`, and reads them back by index.

use crate::error::RaidPirError;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct BlockStore {
    file: Mutex<File>,
    path: PathBuf,
    blocksize: usize,
    blockcount: usize,
}

impl BlockStore {
    pub fn open(
        path: impl AsRef<Path>,
        blocksize: usize,
        blockcount: usize,
    ) -> Result<Self, RaidPirError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            RaidPirError::ParameterError(format!("cannot open database {:?}: {}", path, e))
        })?;
        let actual_len = file
            .metadata()
            .map_err(|e| RaidPirError::ParameterError(format!("cannot stat {:?}: {}", path, e)))?
            .len();
        let expected_len = (blocksize as u64) * (blockcount as u64);
        if actual_len < expected_len {
            return Err(RaidPirError::ParameterError(format!(
                "database {:?} is {} bytes, need at least {} for {} blocks of {} bytes",
                path, actual_len, expected_len, blockcount, blocksize
            )));
        }
        Ok(BlockStore {
            file: Mutex::new(file),
            path,
            blocksize,
            blockcount,
        })
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn blockcount(&self) -> usize {
        self.blockcount
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads block `index` into `buf`, which must be exactly `blocksize`
    /// bytes long.
    pub fn read_block_into(&self, index: usize, buf: &mut [u8]) -> Result<(), RaidPirError> {
        if index >= self.blockcount {
            return Err(RaidPirError::ProtocolError(format!(
                "block index {} out of range (blockcount {})",
                index, self.blockcount
            )));
        }
        debug_assert_eq!(buf.len(), self.blocksize);
        let offset = (index as u64) * (self.blocksize as u64);
        let mut file = self.file.lock().expect("block store mutex poisoned");
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| RaidPirError::Network(e.into()))?;
        file.read_exact(buf)
            .map_err(|e| RaidPirError::Network(e.into()))?;
        Ok(())
    }

    pub fn read_block(&self, index: usize) -> Result<Vec<u8>, RaidPirError> {
        let mut buf = vec![0u8; self.blocksize];
        self.read_block_into(index, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_store(dir: &tempfile::TempDir, blocksize: usize, blockcount: usize) -> BlockStore {
        let path = dir.path().join("db.bin");
        let mut file = File::create(&path).unwrap();
        for i in 0..blockcount {
            file.write_all(&vec![i as u8; blocksize]).unwrap();
        }
        BlockStore::open(&path, blocksize, blockcount).unwrap()
    }

    #[test]
    fn reads_block_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = sample_store(&dir, 16, 8);
        assert_eq!(store.read_block(3).unwrap(), vec![3u8; 16]);
        assert_eq!(store.read_block(0).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = sample_store(&dir, 16, 8);
        assert!(store.read_block(8).is_err());
    }

    #[test]
    fn rejects_undersized_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        File::create(&path).unwrap().write_all(&[0u8; 10]).unwrap();
        assert!(BlockStore::open(&path, 16, 8).is_err());
    }
}
