//! Tracker RPC server (C6, spec §4.6): dispatches the framed JSON protocol
//! that carries both torrent registration/lookup and Chord control messages.
//! Composition, not inheritance: a `Tracker` owns a [`ChordNode`] and a
//! [`Store`] and wires RPC calls into both.

use crate::chord::node::{info_hash_key, ChordNode, StabiliserHandle};
use crate::chord::rpc::{read_frame, write_frame};
use crate::error::StoreError;
use crate::tracker::store::{PeerDescriptor, RegisterRequest, Store};
use serde_json::{json, Value};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Tracker {
    pub node: Arc<ChordNode>,
    pub store: Arc<Store>,
    /// Keeps the stabiliser thread alive for as long as this tracker is;
    /// dropping the tracker stops it.
    stabiliser: Option<StabiliserHandle>,
}

impl Tracker {
    pub fn new(node: Arc<ChordNode>, store: Arc<Store>) -> Tracker {
        Tracker {
            node,
            store,
            stabiliser: None,
        }
    }

    /// Attaches a running stabiliser so it lives exactly as long as this
    /// tracker does.
    pub fn with_stabiliser(mut self, stabiliser: StabiliserHandle) -> Tracker {
        self.stabiliser = Some(stabiliser);
        self
    }

    /// Binds the listening socket and serves connections until the process
    /// exits, one thread per connection (spec §5 acceptor).
    pub fn serve(self: Arc<Self>, bind_addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr)?;
        log::info!("tracker RPC listening on {bind_addr}");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let tracker = Arc::clone(&self);
                    std::thread::spawn(move || {
                        if let Err(e) = tracker.handle_client(stream) {
                            log::warn!("tracker client handler exited: {e}");
                        }
                    });
                }
                Err(e) => log::warn!("accept failed: {e}"),
            }
        }
        Ok(())
    }

    fn handle_client(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let request = match read_frame(&mut stream) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let response = self.dispatch(&request);
            write_frame(&mut stream, &response)?;
        }
    }

    fn dispatch(&self, request: &Value) -> Value {
        let msg_type = request.get("type").and_then(Value::as_str).unwrap_or("");
        match msg_type {
            "register_torrent" => {
                let info_hash = request
                    .get("torrent_metadata")
                    .and_then(|m| m.get("info_hash").or_else(|| m.get("torrent_id")))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match self.route(info_hash) {
                    Ok(Ownership::Local) => self.handle_register(request),
                    Ok(Ownership::Remote(addr)) => self.forward(&addr, request),
                    Err(e) => json!({"error": e}),
                }
            }
            "get_torrent" => {
                let info_hash = request.get("info_hash").and_then(Value::as_str).unwrap_or("");
                match self.route(info_hash) {
                    Ok(Ownership::Local) => self.handle_get_torrent(request),
                    Ok(Ownership::Remote(addr)) => self.forward(&addr, request),
                    Err(e) => json!({"error": e}),
                }
            }
            "find_successor" => {
                let key = request.get("data").and_then(Value::as_u64).unwrap_or(0);
                match self.node.find_successor(key) {
                    Ok(successor) => json!({"successor": successor}),
                    Err(e) => json!({"successor": Value::Null, "error": e.to_string()}),
                }
            }
            "find_predecessor" => {
                let key = request.get("data").and_then(Value::as_u64).unwrap_or(0);
                match self.node.find_predecessor(key) {
                    Ok(predecessor) => json!({"predecessor": predecessor}),
                    Err(e) => json!({"predecessor": Value::Null, "error": e.to_string()}),
                }
            }
            "notify" => {
                if let Some(candidate) = request.get("data").and_then(Value::as_str) {
                    self.node.notify(candidate);
                }
                json!({"status": "ok"})
            }
            "get_predecessor" => json!({"predecessor": self.node.predecessor()}),
            "get_successors" => json!({"successors": self.node.successors()}),
            "update_finger_table" => {
                let node_ip = request.get("node_ip").and_then(Value::as_str).unwrap_or("");
                let index = request.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let origin = request
                    .get("origin")
                    .and_then(Value::as_str)
                    .unwrap_or(node_ip);
                self.node.update_finger_table(node_ip, index, origin);
                json!({"status": "ok"})
            }
            other => json!({"error": format!("invalid message type: {other}")}),
        }
    }

    fn handle_register(&self, request: &Value) -> Value {
        let metadata = request.get("torrent_metadata");
        let peer_info = request.get("peer_info");
        let (Some(metadata), Some(peer_info)) = (metadata, peer_info) else {
            return json!({"error": "register_torrent requires torrent_metadata and peer_info"});
        };

        let info_hash = metadata
            .get("info_hash")
            .or_else(|| metadata.get("torrent_id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let request = RegisterRequest {
            info_hash,
            name: metadata.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            size: metadata.get("size").and_then(Value::as_u64).unwrap_or(0),
            piece_size: metadata.get("piece_size").and_then(Value::as_u64).unwrap_or(0),
            pieces: metadata.get("pieces").and_then(Value::as_str).unwrap_or_default().to_string(),
            peer: PeerDescriptor {
                peer_id: peer_info.get("peer_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                ip: peer_info.get("ip").and_then(Value::as_str).unwrap_or_default().to_string(),
                port: peer_info.get("port").and_then(Value::as_u64).unwrap_or(0) as u16,
            },
        };

        match self.store.register(request) {
            Ok(()) => json!("Torrent successfully registered."),
            Err(e) => json!(format!("ERROR: {e}")),
        }
    }

    fn handle_get_torrent(&self, request: &Value) -> Value {
        let info_hash = request.get("info_hash").and_then(Value::as_str).unwrap_or("");
        match self.store.get(info_hash) {
            Ok(record) => serde_json::to_value(record).unwrap_or(Value::Null),
            Err(StoreError::NotFound(_)) => json!("ERROR: Torrent not found in the tracker."),
            Err(e) => json!(format!("ERROR: {e}")),
        }
    }

    /// Decides whether `info_hash` belongs to this node's shard or a peer's,
    /// per spec §4.6: the owning node is `find_successor(info_hash mod 2^m)`.
    fn route(&self, info_hash: &str) -> Result<Ownership, String> {
        let key = info_hash_key(info_hash, self.node.m)
            .ok_or_else(|| format!("info_hash '{info_hash}' is not valid hex"))?;
        let owner = self.node.find_successor(key).map_err(|e| e.to_string())?;
        if owner == self.node.addr {
            Ok(Ownership::Local)
        } else {
            Ok(Ownership::Remote(owner))
        }
    }

    /// Re-sends `request` verbatim to the tracker at `addr` and relays its
    /// response. Used when this node isn't the info_hash's owner.
    fn forward(&self, addr: &str, request: &Value) -> Value {
        let socket_addr = match addr.parse::<std::net::SocketAddr>() {
            Ok(a) => a,
            Err(_) => return json!({"error": format!("owner address '{addr}' is not a valid socket address")}),
        };
        let mut stream = match TcpStream::connect_timeout(&socket_addr, FORWARD_TIMEOUT) {
            Ok(s) => s,
            Err(e) => return json!({"error": format!("failed to connect to owner {addr}: {e}")}),
        };
        if let Err(e) = write_frame(&mut stream, request) {
            return json!({"error": format!("failed to forward request to {addr}: {e}")});
        }
        match read_frame(&mut stream) {
            Ok(v) => v,
            Err(e) => json!({"error": format!("failed to read forwarded response from {addr}: {e}")}),
        }
    }
}

/// Result of [`Tracker::route`]: whether this node owns `info_hash`'s shard
/// or must forward to the node that does.
enum Ownership {
    Local,
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::rpc::RingTransport;
    use crate::error::RingError;

    struct NullTransport;
    impl RingTransport for NullTransport {
        fn find_successor(&self, _addr: &str, _key_id: u64) -> Result<String, RingError> {
            unreachable!("single-node ring never calls out")
        }
        fn find_predecessor(&self, _addr: &str, _key_id: u64) -> Result<String, RingError> {
            unreachable!()
        }
        fn notify(&self, _addr: &str, _candidate: &str) -> Result<(), RingError> {
            Ok(())
        }
        fn get_predecessor(&self, _addr: &str) -> Result<Option<String>, RingError> {
            Ok(None)
        }
        fn get_successors(&self, _addr: &str) -> Result<Vec<String>, RingError> {
            Ok(Vec::new())
        }
        fn update_finger_table(
            &self,
            _addr: &str,
            _node_ip: &str,
            _index: usize,
            _origin: &str,
        ) -> Result<(), RingError> {
            Ok(())
        }
    }

    fn make_tracker(dir: &std::path::Path) -> Tracker {
        let node = Arc::new(ChordNode::new("a".to_string(), 5, Arc::new(NullTransport)));
        node.join(None).unwrap();
        let store = Arc::new(Store::open(dir.join("tracker.json")).unwrap());
        Tracker::new(node, store)
    }

    #[test]
    fn register_then_get_round_trips_through_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = make_tracker(dir.path());

        let register = json!({
            "type": "register_torrent",
            "torrent_metadata": {"info_hash": "aabbccdd", "name": "f.bin", "size": 10, "piece_size": 5, "pieces": ""},
            "peer_info": {"peer_id": "p1", "ip": "127.0.0.1", "port": 6881},
        });
        let resp = tracker.dispatch(&register);
        assert_eq!(resp, json!("Torrent successfully registered."));

        let get = json!({"type": "get_torrent", "info_hash": "aabbccdd"});
        let resp = tracker.dispatch(&get);
        assert_eq!(resp.get("info_hash").and_then(Value::as_str), Some("aabbccdd"));
    }

    #[test]
    fn get_torrent_on_unknown_hash_returns_error_string() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = make_tracker(dir.path());
        let get = json!({"type": "get_torrent", "info_hash": "deadbeef"});
        let resp = tracker.dispatch(&get);
        assert_eq!(resp.as_str().unwrap().starts_with("ERROR:"), true);
    }

    #[test]
    fn register_torrent_with_invalid_hex_info_hash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = make_tracker(dir.path());
        let register = json!({
            "type": "register_torrent",
            "torrent_metadata": {"info_hash": "not-hex", "name": "f.bin", "size": 10, "piece_size": 5, "pieces": ""},
            "peer_info": {"peer_id": "p1", "ip": "127.0.0.1", "port": 6881},
        });
        let resp = tracker.dispatch(&register);
        assert!(resp.get("error").is_some());
    }

    #[test]
    fn chord_control_messages_are_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = make_tracker(dir.path());
        let resp = tracker.dispatch(&json!({"type": "get_successors"}));
        assert_eq!(resp, json!({"successors": ["a"]}));
    }

    /// Reserves a free loopback port by binding and immediately releasing it.
    fn free_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn wait_until_listening(addr: &str) {
        for _ in 0..100 {
            if TcpStream::connect(addr).is_ok() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("tracker at {addr} never started listening");
    }

    /// Chord join-and-query (spec §8): register a torrent whose info_hash
    /// maps into node A's keyspace, sent to node B. B must route/forward
    /// to A instead of touching its own shard, and a subsequent get_torrent
    /// sent to B must likewise forward and return A's record.
    #[test]
    fn get_torrent_sent_to_non_owner_is_forwarded_to_the_owning_node() {
        use crate::chord::rpc::TcpRingTransport;

        let addr_a = free_addr();
        let m = 3;

        let node_a = Arc::new(ChordNode::new(addr_a.clone(), m, Arc::new(TcpRingTransport)));
        node_a.join(None).unwrap();
        let dir_a = tempfile::tempdir().unwrap();
        let store_a = Arc::new(Store::open(dir_a.path().join("a.json")).unwrap());
        let tracker_a = Arc::new(Tracker::new(Arc::clone(&node_a), store_a));
        {
            let tracker_a = Arc::clone(&tracker_a);
            let addr_a = addr_a.clone();
            std::thread::spawn(move || {
                let _ = tracker_a.serve(&addr_a);
            });
        }
        wait_until_listening(&addr_a);

        let addr_b = free_addr();
        let node_b = Arc::new(ChordNode::new(addr_b.clone(), m, Arc::new(TcpRingTransport)));
        node_b.join(Some(addr_a.as_str())).unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let store_b = Arc::new(Store::open(dir_b.path().join("b.json")).unwrap());
        let tracker_b = Arc::new(Tracker::new(Arc::clone(&node_b), store_b));
        {
            let tracker_b = Arc::clone(&tracker_b);
            let addr_b = addr_b.clone();
            std::thread::spawn(move || {
                let _ = tracker_b.serve(&addr_b);
            });
        }
        wait_until_listening(&addr_b);

        // find a small info_hash whose key (mod 2^m) is owned by A.
        let info_hash = (0u32..64)
            .map(|n| format!("{n:040x}"))
            .find(|candidate| {
                info_hash_key(candidate, m)
                    .map(|key| node_b.find_successor(key).unwrap() == addr_a)
                    .unwrap_or(false)
            })
            .expect("some small info_hash must hash into node A's keyspace");

        let register = json!({
            "type": "register_torrent",
            "torrent_metadata": {"info_hash": info_hash, "name": "f.bin", "size": 10, "piece_size": 5, "pieces": ""},
            "peer_info": {"peer_id": "p1", "ip": "127.0.0.1", "port": 6881},
        });
        let mut stream = TcpStream::connect(&addr_b).unwrap();
        write_frame(&mut stream, &register).unwrap();
        let resp = read_frame(&mut stream).unwrap();
        assert_eq!(resp, json!("Torrent successfully registered."));

        // the record landed on A's shard, not B's.
        assert!(tracker_a.store.get(&info_hash).is_ok());
        assert!(tracker_b.store.get(&info_hash).is_err());

        // get_torrent sent to B must forward to A and return the record.
        let mut stream = TcpStream::connect(&addr_b).unwrap();
        let get = json!({"type": "get_torrent", "info_hash": info_hash});
        write_frame(&mut stream, &get).unwrap();
        let resp = read_frame(&mut stream).unwrap();
        assert_eq!(resp.get("info_hash").and_then(Value::as_str), Some(info_hash.as_str()));
    }
}
