//! Small stateless helpers shared across components.

use rand::Rng;

/// Generates a fresh random 20-byte peer id for this session. Distinct from
/// the long-lived node/content identifiers, which are SHA-1 derived.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let mut rng = rand::thread_rng();
    rng.fill(&mut peer_id);
    peer_id
}

pub fn peer_id_hex(peer_id: &[u8; 20]) -> String {
    hex::encode(peer_id)
}
