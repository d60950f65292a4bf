//! Torrent metadata store (C6, spec §4.6): the JSON shard owned by whichever
//! Chord node is responsible for a given info_hash. Grounded on the original
//! tracker's `update_tracker`/`get_torrent_info` whole-file rewrite pattern.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentRecord {
    #[serde(alias = "torrent_id")]
    pub info_hash: String,
    pub name: String,
    pub size: u64,
    pub piece_size: u64,
    pub pieces: String,
    #[serde(default)]
    pub seeders: u32,
    #[serde(default)]
    pub leechers: u32,
    #[serde(default)]
    pub peers: Vec<PeerDescriptor>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerFile {
    torrents: Vec<TorrentRecord>,
}

/// Everything needed to register a torrent: the metadata for a
/// not-yet-known info_hash, plus the registering peer.
pub struct RegisterRequest {
    pub info_hash: String,
    pub name: String,
    pub size: u64,
    pub piece_size: u64,
    pub pieces: String,
    pub peer: PeerDescriptor,
}

/// The JSON-backed shard for this node's slice of the keyspace. Rewritten
/// whole on each mutation, under a process-local lock standing in for the
/// per-node file lock described in spec §5.
pub struct Store {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Store, StoreError> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let empty = TrackerFile::default();
            fs::write(&path, serde_json::to_vec_pretty(&empty)?)?;
        }
        Ok(Store {
            path,
            lock: Mutex::new(()),
        })
    }

    fn read(&self) -> Result<TrackerFile, StoreError> {
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write(&self, data: &TrackerFile) -> Result<(), StoreError> {
        fs::write(&self.path, serde_json::to_vec_pretty(data)?)?;
        Ok(())
    }

    /// Adds a new torrent or merges a peer into an existing one. A peer
    /// already present (by peer_id, ip, port) leaves the peer set unchanged
    /// (spec §4.6 merge rule, invariant 6).
    pub fn register(&self, request: RegisterRequest) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut data = self.read()?;

        match data
            .torrents
            .iter_mut()
            .find(|t| t.info_hash == request.info_hash)
        {
            Some(existing) => {
                if !existing.peers.contains(&request.peer) {
                    existing.peers.push(request.peer);
                    existing.seeders += 1;
                }
            }
            None => {
                data.torrents.push(TorrentRecord {
                    info_hash: request.info_hash,
                    name: request.name,
                    size: request.size,
                    piece_size: request.piece_size,
                    pieces: request.pieces,
                    seeders: 1,
                    leechers: 0,
                    peers: vec![request.peer],
                });
            }
        }

        self.write(&data)
    }

    pub fn get(&self, info_hash: &str) -> Result<TorrentRecord, StoreError> {
        let _guard = self.lock.lock().unwrap();
        let data = self.read()?;
        data.torrents
            .into_iter()
            .find(|t| t.info_hash == info_hash)
            .ok_or_else(|| StoreError::NotFound(info_hash.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerDescriptor {
        PeerDescriptor {
            peer_id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            port: 6881,
        }
    }

    fn request(info_hash: &str, peer_id: &str) -> RegisterRequest {
        RegisterRequest {
            info_hash: info_hash.to_string(),
            name: "file.bin".to_string(),
            size: 1024,
            piece_size: 256,
            pieces: "abc".to_string(),
            peer: peer(peer_id),
        }
    }

    #[test]
    fn register_creates_a_new_record_with_one_seeder() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("tracker.json")).unwrap();
        store.register(request("h1", "p1")).unwrap();

        let record = store.get("h1").unwrap();
        assert_eq!(record.seeders, 1);
        assert_eq!(record.peers.len(), 1);
    }

    #[test]
    fn registering_the_same_peer_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("tracker.json")).unwrap();
        store.register(request("h1", "p1")).unwrap();
        store.register(request("h1", "p1")).unwrap();

        let record = store.get("h1").unwrap();
        assert_eq!(record.seeders, 1);
        assert_eq!(record.peers.len(), 1);
    }

    #[test]
    fn a_second_distinct_peer_is_merged_in() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("tracker.json")).unwrap();
        store.register(request("h1", "p1")).unwrap();
        store.register(request("h1", "p2")).unwrap();

        let record = store.get("h1").unwrap();
        assert_eq!(record.seeders, 2);
        assert_eq!(record.peers.len(), 2);
    }

    #[test]
    fn get_on_unknown_info_hash_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("tracker.json")).unwrap();
        assert!(matches!(store.get("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn torrent_id_alias_deserialises_into_info_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        fs::write(
            &path,
            r#"{"torrents":[{"torrent_id":"legacy","name":"n","size":1,"piece_size":1,"pieces":"","seeders":1,"leechers":0,"peers":[]}]}"#,
        )
        .unwrap();
        let store = Store::open(&path).unwrap();
        let record = store.get("legacy").unwrap();
        assert_eq!(record.info_hash, "legacy");
    }
}
