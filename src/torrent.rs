//! Metainfo (C8, external collaborator): reads and writes the bencoded `.torrent`
//! file described in spec §6. One torrent indexes exactly one content blob
//! (multi-file torrents are a non-goal).

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;

pub const DEFAULT_PIECE_LENGTH: i64 = 256 * 1024;

#[allow(dead_code)]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    /// Concatenation of all 20-byte SHA1 hash values, one per piece.
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub length: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Torrent {
    pub info: Info,
    #[serde(default)]
    announce: Option<String>,
}

impl Torrent {
    /// Builds a metainfo record from pre-computed piece hashes (used by the
    /// creator flow in the client orchestrator).
    pub fn new(
        name: String,
        total_length: i64,
        piece_length: i64,
        piece_hashes: &[[u8; 20]],
        announce: Option<String>,
    ) -> Torrent {
        let mut pieces = Vec::with_capacity(piece_hashes.len() * 20);
        for hash in piece_hashes {
            pieces.extend_from_slice(hash);
        }
        Torrent {
            info: Info {
                name,
                pieces: ByteBuf::from(pieces),
                piece_length,
                length: total_length,
            },
            announce,
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        to_bytes(self).context("failed to bencode torrent")
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_bytes(bytes).context("failed to deserialize torrent")
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("opening torrent file {}", path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_bytes()?)
            .with_context(|| format!("writing torrent file {}", path.display()))
    }

    /// SHA-1 of the re-bencoded info dictionary; globally identifies this content.
    pub fn info_hash(&self) -> [u8; 20] {
        let bytes = to_bytes(&self.info).expect("info dict always bencodes");
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash())
    }

    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    pub fn total_length(&self) -> i64 {
        self.info.length
    }

    pub fn piece_length(&self) -> i64 {
        self.info.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        ((self.total_length() + self.piece_length() - 1) / self.piece_length()) as usize
    }

    /// Byte size of `piece_index`, accounting for a short last piece.
    pub fn piece_size(&self, piece_index: usize) -> usize {
        let n = self.num_pieces();
        if piece_index == n - 1 {
            let covered = (n - 1) as i64 * self.piece_length();
            (self.total_length() - covered) as usize
        } else {
            self.piece_length() as usize
        }
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut array = [0u8; 20];
                array.copy_from_slice(chunk);
                array
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Torrent {
        let hashes = vec![[1u8; 20], [2u8; 20], [3u8; 20], [4u8; 20]];
        Torrent::new(
            "debian.iso".to_string(),
            1_024_000,
            256 * 1024,
            &hashes,
            Some("127.0.0.1:8080".to_string()),
        )
    }

    #[test]
    fn bencode_round_trip_preserves_fields() {
        let t = sample();
        let bytes = t.to_bytes().unwrap();
        let back = Torrent::from_bytes(&bytes).unwrap();
        assert_eq!(back.name(), t.name());
        assert_eq!(back.total_length(), t.total_length());
        assert_eq!(back.piece_length(), t.piece_length());
        assert_eq!(back.piece_hashes(), t.piece_hashes());
        assert_eq!(back.info_hash(), t.info_hash());
    }

    #[test]
    fn num_pieces_and_last_piece_size() {
        let t = sample();
        assert_eq!(t.num_pieces(), 4);
        assert_eq!(t.piece_size(0), 256 * 1024);
        assert_eq!(t.piece_size(3), 1_024_000 - 3 * 256 * 1024);
    }

    #[test]
    fn info_hash_is_stable_for_same_info() {
        let a = sample();
        let b = sample();
        assert_eq!(a.info_hash(), b.info_hash());
        assert_eq!(a.info_hash_hex().len(), 40);
    }
}
