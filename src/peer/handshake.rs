//! The 68-byte handshake prelude (spec §4.1), exchanged once per peer session
//! before any length-prefixed message. Never length-prefixed itself.

use crate::error::ProtocolError;

const PSTR: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = PSTR.len() as u8;
        bytes[1..20].copy_from_slice(PSTR);
        // bytes[20..28] stay zeroed (reserved)
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Handshake, ProtocolError> {
        if bytes[0] as usize != PSTR.len() || &bytes[1..20] != PSTR {
            return Err(ProtocolError::BadProtocolString);
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Handshake { info_hash, peer_id })
    }

    /// Validates that this handshake (typically the peer's reply) matches the
    /// info_hash we initiated the session for.
    pub fn check(&self, expected_info_hash: &[u8; 20]) -> Result<(), ProtocolError> {
        if &self.info_hash != expected_info_hash {
            return Err(ProtocolError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_info_hash_and_peer_id() {
        let hs = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = hs.to_bytes();
        let back = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(hs, back);
    }

    #[test]
    fn check_rejects_mismatched_info_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.check(&[1u8; 20]).is_ok());
        assert!(hs.check(&[9u8; 20]).is_err());
    }

    #[test]
    fn from_bytes_rejects_bad_protocol_string() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).to_bytes();
        bytes[1] = b'X';
        assert!(Handshake::from_bytes(&bytes).is_err());
    }
}
