//! Chord ring node (C5, spec §4.5): identifier hashing, finger table
//! maintenance, and the join/stabilise/notify/update protocol. Grounded on
//! the original tracker's `Node` class, generalised behind [`RingTransport`]
//! so the protocol logic does not own socket lifecycles itself.

use crate::chord::rpc::RingTransport;
use crate::error::RingError;
use crossbeam::channel::{bounded, select, tick, Sender};
use sha1::{Digest, Sha1};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_M: u32 = 5;
pub const STABILISE_PERIOD: Duration = Duration::from_secs(5);

pub type NodeId = u64;

/// SHA-1 of `addr`, interpreted big-endian and reduced mod `2^m`.
pub fn hash_id(addr: &str, m: u32) -> NodeId {
    low_bits(&Sha1::digest(addr.as_bytes()), m)
}

/// Maps a hex-encoded info_hash onto the ring's key space: the digest bytes
/// interpreted as a big-endian integer, mod `2^m` (find_successor(info_hash
/// mod 2^m) per the tracker's ownership rule). Returns `None` if `info_hash`
/// is not valid hex.
pub fn info_hash_key(info_hash_hex: &str, m: u32) -> Option<NodeId> {
    let bytes = hex::decode(info_hash_hex).ok()?;
    Some(low_bits(&bytes, m))
}

/// Reduces a big-endian digest mod `2^m`. Only the low-order bytes affect the
/// result, so this reconstructs a `u64` from (at most) the last 8 bytes
/// rather than the first 8 — the top bits of a 160-bit SHA-1 digest have no
/// bearing on its value mod `2^m` for any `m <= 64`.
fn low_bits(digest: &[u8], m: u32) -> NodeId {
    let mut buf = [0u8; 8];
    let tail = &digest[digest.len().saturating_sub(8)..];
    buf[8 - tail.len()..].copy_from_slice(tail);
    let value = u64::from_be_bytes(buf);
    if m >= 64 {
        value
    } else {
        value & ((1u64 << m) - 1)
    }
}

/// Half-open clockwise arc (start, end]. Wraps when `start >= end`.
pub fn is_between(value: NodeId, start: NodeId, end: NodeId) -> bool {
    if start < end {
        value > start && value <= end
    } else {
        value > start || value <= end
    }
}

struct RingState {
    finger_table: Vec<String>,
    predecessor: Option<String>,
    successors: Vec<String>,
}

pub struct ChordNode {
    pub addr: String,
    pub m: u32,
    pub id: NodeId,
    state: Mutex<RingState>,
    transport: Arc<dyn RingTransport>,
}

impl ChordNode {
    pub fn new(addr: String, m: u32, transport: Arc<dyn RingTransport>) -> ChordNode {
        let id = hash_id(&addr, m);
        ChordNode {
            addr,
            m,
            id,
            state: Mutex::new(RingState {
                finger_table: Vec::new(),
                predecessor: None,
                successors: Vec::new(),
            }),
            transport,
        }
    }

    pub fn id_of(&self, addr: &str) -> NodeId {
        hash_id(addr, self.m)
    }

    pub fn predecessor(&self) -> Option<String> {
        self.state.lock().unwrap().predecessor.clone()
    }

    pub fn successors(&self) -> Vec<String> {
        self.state.lock().unwrap().successors.clone()
    }

    pub fn finger_table(&self) -> Vec<String> {
        self.state.lock().unwrap().finger_table.clone()
    }

    /// Joins the ring, either alone (`bootstrap = None`) or via an existing
    /// member (spec §4.5 join).
    pub fn join(&self, bootstrap: Option<&str>) -> Result<(), RingError> {
        match bootstrap {
            None => {
                let mut state = self.state.lock().unwrap();
                state.successors = vec![self.addr.clone()];
                state.predecessor = Some(self.addr.clone());
                state.finger_table = vec![self.addr.clone(); self.m as usize];
            }
            Some(bootstrap_addr) => {
                let successor = self.transport.find_successor(bootstrap_addr, self.id)?;
                {
                    let mut state = self.state.lock().unwrap();
                    state.successors = vec![successor.clone()];
                    state.predecessor = None;
                    state.finger_table = vec![self.addr.clone(); self.m as usize];
                }
                self.transport.notify(&successor, &self.addr)?;

                for i in 1..=self.m {
                    let start = self.id.wrapping_add(1u64 << (i - 1)) % (1u64 << self.m);
                    let entry = self.find_successor(start)?;
                    self.state.lock().unwrap().finger_table[(i - 1) as usize] = entry;
                }

                self.update_others();
            }
        }
        Ok(())
    }

    /// Finds the node responsible for `key_id`, recursing over RPC when the
    /// answer is not locally known.
    pub fn find_successor(&self, key_id: NodeId) -> Result<String, RingError> {
        let successor0 = {
            let state = self.state.lock().unwrap();
            state.successors.first().cloned()
        };
        let Some(successor0) = successor0 else {
            return Ok(self.addr.clone());
        };
        if successor0 == self.addr {
            return Ok(self.addr.clone());
        }
        let successor_id = self.id_of(&successor0);
        if is_between(key_id, self.id, successor_id) {
            return Ok(successor0);
        }
        let closest = self.closest_preceding_node(key_id);
        if closest == self.addr {
            return Ok(self.addr.clone());
        }
        self.transport.find_successor(&closest, key_id)
    }

    /// Finds the node immediately preceding `key_id` (spec §4.5, symmetric to
    /// `find_successor`, used by `update_others`).
    pub fn find_predecessor(&self, key_id: NodeId) -> Result<String, RingError> {
        let successor0 = {
            let state = self.state.lock().unwrap();
            state.successors.first().cloned()
        };
        let Some(successor0) = successor0 else {
            return Ok(self.addr.clone());
        };
        if successor0 == self.addr {
            return Ok(self.addr.clone());
        }
        let successor_id = self.id_of(&successor0);
        if is_between(key_id, self.id, successor_id) {
            return Ok(self.addr.clone());
        }
        let closest = self.closest_preceding_node(key_id);
        if closest == self.addr {
            return Ok(self.addr.clone());
        }
        self.transport.find_predecessor(&closest, key_id)
    }

    pub fn closest_preceding_node(&self, key_id: NodeId) -> String {
        let state = self.state.lock().unwrap();
        for entry in state.finger_table.iter().rev() {
            let entry_id = self.id_of(entry);
            if is_between(entry_id, self.id, key_id) {
                return entry.clone();
            }
        }
        self.addr.clone()
    }

    /// A candidate predecessor has announced itself (spec §4.5 notify).
    pub fn notify(&self, candidate: &str) {
        let mut state = self.state.lock().unwrap();
        let candidate_id = self.id_of(candidate);
        let should_set = match &state.predecessor {
            None => true,
            Some(current) => is_between(candidate_id, self.id_of(current), self.id),
        };
        if should_set {
            state.predecessor = Some(candidate.to_string());
        }
    }

    /// Periodic ring maintenance (spec §4.5 stabilise). Any RPC failure is
    /// returned to the caller, which is expected to swallow it and retry on
    /// the next tick.
    pub fn stabilise(&self) -> Result<(), RingError> {
        let successor0 = match self.state.lock().unwrap().successors.first().cloned() {
            Some(s) => s,
            None => return Ok(()),
        };

        let predecessor_of_successor = self.transport.get_predecessor(&successor0)?;
        let mut successor0 = successor0;
        if let Some(p) = &predecessor_of_successor {
            if is_between(self.id_of(p), self.id, self.id_of(&successor0)) {
                successor0 = p.clone();
                self.state.lock().unwrap().successors[0] = successor0.clone();
            }
        }

        self.transport.notify(&successor0, &self.addr)?;

        let new_successors = self.transport.get_successors(&successor0)?;
        let mut successors = vec![successor0];
        if let Some(next) = new_successors.first() {
            successors.push(next.clone());
        }
        self.state.lock().unwrap().successors = successors;
        Ok(())
    }

    /// Spawns the periodic stabiliser on its own thread. Returns a
    /// [`StabiliserHandle`]; dropping it stops the thread.
    pub fn spawn_stabiliser(node: Arc<ChordNode>, period: Duration) -> StabiliserHandle {
        let (stop_tx, stop_rx) = bounded(0);
        let thread = std::thread::spawn(move || {
            let ticks = tick(period);
            loop {
                select! {
                    recv(ticks) -> _ => {
                        if let Err(e) = node.stabilise() {
                            log::warn!("stabilise failed, will retry next tick: {e}");
                        }
                    }
                    recv(stop_rx) -> _ => return,
                }
            }
        });
        StabiliserHandle {
            thread: Some(thread),
            stop: stop_tx,
        }
    }

    /// Notifies the nodes whose finger tables may now need to point at us
    /// (spec §4.5 update_others). Best-effort: a failure to reach one
    /// predecessor does not stop the others.
    pub fn update_others(&self) {
        for i in 1..=self.m {
            let offset = 1u64 << (i - 1);
            let key = self.id.wrapping_sub(offset) % (1u64 << self.m);
            match self.find_predecessor(key) {
                Ok(predecessor) => {
                    if let Err(e) =
                        self.transport
                            .update_finger_table(&predecessor, &self.addr, i as usize, &self.addr)
                    {
                        log::warn!("failed to update finger table of {predecessor}: {e}");
                    }
                }
                Err(e) => log::warn!("failed to find predecessor for finger {i}: {e}"),
            }
        }
    }

    /// Applies an incoming `update_finger_table` RPC (spec §4.5): if `node_ip`
    /// is a better fit for slot `index`, install it and forward the update to
    /// our own predecessor, stopping at `origin` to terminate the recursion.
    pub fn update_finger_table(&self, node_ip: &str, index: usize, origin: &str) {
        if index == 0 || index as u32 > self.m {
            return;
        }
        let start = self.id.wrapping_add(1u64 << (index - 1)) % (1u64 << self.m);
        let node_id = self.id_of(node_ip);

        let (changed, predecessor) = {
            let mut state = self.state.lock().unwrap();
            let slot = index - 1;
            let current = state.finger_table[slot].clone();
            let current_id = self.id_of(&current);
            if is_between(node_id, start, current_id) {
                state.finger_table[slot] = node_ip.to_string();
                (true, state.predecessor.clone())
            } else {
                (false, None)
            }
        };

        if !changed {
            return;
        }
        if let Some(predecessor) = predecessor {
            if predecessor != self.addr && predecessor != origin {
                if let Err(e) =
                    self.transport
                        .update_finger_table(&predecessor, node_ip, index, &self.addr)
                {
                    log::warn!("failed to forward finger table update to {predecessor}: {e}");
                }
            }
        }
    }
}

/// Handle to a running stabiliser thread. Dropping it stops the thread
/// rather than leaving it to poll `Arc::strong_count` for abandonment.
pub struct StabiliserHandle {
    thread: Option<std::thread::JoinHandle<()>>,
    stop: Sender<()>,
}

impl Drop for StabiliserHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
