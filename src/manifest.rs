//! Typed view over the pre-built manifest.
//!
//! Manifest *creation* is out of scope - the manifest is a pre-existing
//! input shipped by the vendor. This module only reads it. The on-disk
//! encoding is MessagePack (matching the upstream `create-manifest` tool,
//! which serializes with `msgpack.packb(..., use_bin_type=True)`), which
//! gives us a compact self-describing wire format for free via `serde`.

use crate::error::RaidPirError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    #[serde(with = "serde_bytes")]
    pub hash: Vec<u8>,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub blocksize: u64,
    pub blockcount: u64,
    pub hashalgorithm: String,
    pub vendorhostname: String,
    pub vendorport: u16,
    pub fileinfolist: Vec<FileInfo>,
    /// Not part of the upstream schema. When present, lets the
    /// reconstructor verify individual blocks rather than only whole
    /// files; absent manifests skip that check (see `verify_block_hash`).
    #[serde(default)]
    pub block_hashes: Option<Vec<[u8; 32]>>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, RaidPirError> {
        let manifest: Manifest = rmp_serde::from_slice(bytes)
            .map_err(|e| RaidPirError::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RaidPirError> {
        rmp_serde::to_vec(self).map_err(|e| RaidPirError::ManifestInvalid(e.to_string()))
    }

    fn validate(&self) -> Result<(), RaidPirError> {
        if self.blocksize == 0 || self.blocksize % 64 != 0 {
            return Err(RaidPirError::ManifestInvalid(format!(
                "blocksize {} must be a positive multiple of 64",
                self.blocksize
            )));
        }
        if self.blockcount == 0 {
            return Err(RaidPirError::ManifestInvalid("blockcount is zero".into()));
        }
        if let Some(hashes) = &self.block_hashes {
            if hashes.len() as u64 != self.blockcount {
                return Err(RaidPirError::ManifestInvalid(
                    "block_hashes length does not match blockcount".into(),
                ));
            }
        }
        for file in &self.fileinfolist {
            let last_byte = file.offset + file.length;
            let covered = self.blocksize * self.blockcount;
            if file.length > 0 && last_byte > covered {
                return Err(RaidPirError::ManifestInvalid(format!(
                    "file {} extends past the end of the block database",
                    file.filename
                )));
            }
        }
        Ok(())
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize as usize
    }

    pub fn blockcount(&self) -> usize {
        self.blockcount as usize
    }

    pub fn hash_algorithm(&self) -> &str {
        &self.hashalgorithm
    }

    pub fn vendor_address(&self) -> (String, u16) {
        (self.vendorhostname.clone(), self.vendorport)
    }

    /// Out of scope per the protocol (a trivial TTL map maintained by the
    /// vendor); the manifest only records the vendor's own address, which
    /// doubles as the mirror-list endpoint.
    pub fn mirror_list_address(&self) -> (String, u16) {
        self.vendor_address()
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8], Vec<u32>)> {
        self.fileinfolist
            .iter()
            .map(move |f| (f.filename.as_str(), f.hash.as_slice(), self.blocks_for_file_info(f)))
    }

    fn blocks_for_file_info(&self, file: &FileInfo) -> Vec<u32> {
        let blocksize = self.blocksize;
        let first = file.offset / blocksize;
        let last = if file.length == 0 {
            first
        } else {
            (file.offset + file.length - 1) / blocksize
        };
        (first..=last).map(|b| b as u32).collect()
    }

    pub fn blocks_for_file(&self, name: &str) -> Result<Vec<u32>, RaidPirError> {
        let file = self
            .fileinfolist
            .iter()
            .find(|f| f.filename == name)
            .ok_or_else(|| RaidPirError::FileNotInManifest(name.to_string()))?;
        Ok(self.blocks_for_file_info(file))
    }

    pub fn file_info(&self, name: &str) -> Result<&FileInfo, RaidPirError> {
        self.fileinfolist
            .iter()
            .find(|f| f.filename == name)
            .ok_or_else(|| RaidPirError::FileNotInManifest(name.to_string()))
    }

    /// Returns the union of block indices required to serve `names`, sorted
    /// and de-duplicated (a `BlockIndexSet`).
    pub fn blocks_for_files(&self, names: &[String]) -> Result<Vec<u32>, RaidPirError> {
        let mut set = BTreeSet::new();
        for name in names {
            for b in self.blocks_for_file(name)? {
                set.insert(b);
            }
        }
        Ok(set.into_iter().collect())
    }

    /// Per-block integrity check. Manifests produced by the upstream
    /// `create-manifest` tool carry only whole-file hashes; when
    /// `block_hashes` is absent this is a no-op that always returns true,
    /// matching that tool's schema rather than inventing one it doesn't
    /// have.
    pub fn verify_block_hash(&self, index: u32, bytes: &[u8]) -> bool {
        match &self.block_hashes {
            None => true,
            Some(hashes) => match hashes.get(index as usize) {
                None => false,
                Some(expected) => &sha256(bytes) == expected,
            },
        }
    }

    /// Whole-file hash check, run once all of a file's blocks have been
    /// assembled.
    pub fn verify_file_hash(&self, name: &str, bytes: &[u8]) -> Result<(), RaidPirError> {
        let file = self.file_info(name)?;
        let actual = match self.hashalgorithm.as_str() {
            "sha256-raw" | "sha256" => sha256(bytes).to_vec(),
            other => {
                return Err(RaidPirError::ManifestInvalid(format!(
                    "unsupported hash algorithm: {}",
                    other
                )))
            }
        };
        if actual != file.hash {
            return Err(RaidPirError::FileHashMismatch {
                filename: name.to_string(),
            });
        }
        Ok(())
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest {
            blocksize: 64,
            blockcount: 4,
            hashalgorithm: "sha256-raw".into(),
            vendorhostname: "vendor.example".into(),
            vendorport: 62293,
            fileinfolist: vec![FileInfo {
                filename: "a.txt".into(),
                hash: sha256(b"hello").to_vec(),
                offset: 0,
                length: 64,
            }],
            block_hashes: None,
        }
    }

    #[test]
    fn round_trips_through_msgpack() {
        let m = sample();
        let bytes = m.to_bytes().unwrap();
        let parsed = Manifest::parse(&bytes).unwrap();
        assert_eq!(parsed.blocksize(), 64);
        assert_eq!(parsed.blockcount(), 4);
    }

    #[test]
    fn rejects_blocksize_not_multiple_of_64() {
        let mut m = sample();
        m.blocksize = 100;
        let bytes = m.to_bytes().unwrap();
        assert!(matches!(
            Manifest::parse(&bytes),
            Err(RaidPirError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn blocks_for_file_is_range_over_blocksize() {
        let m = sample();
        assert_eq!(m.blocks_for_file("a.txt").unwrap(), vec![0]);
        assert!(m.blocks_for_file("missing").is_err());
    }

    #[test]
    fn verify_block_hash_passes_when_absent() {
        let m = sample();
        assert!(m.verify_block_hash(0, b"anything"));
    }

    #[test]
    fn verify_file_hash_detects_corruption() {
        let m = sample();
        assert!(m.verify_file_hash("a.txt", b"hello").is_ok());
        assert!(m.verify_file_hash("a.txt", b"corrupt").is_err());
    }
}
