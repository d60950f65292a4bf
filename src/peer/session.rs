//! Peer sessions (C4, spec §4.4): one TCP connection to one remote peer,
//! used either to pull blocks (outbound) or to serve them (inbound).

use crate::error::ProtocolError;
use crate::peer::handshake::{Handshake, HANDSHAKE_LEN};
use crate::peer::message::Message;
use bytes::Bytes;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves an info_hash to the on-disk content a seeder can serve blocks
/// from. Implemented by whatever keeps the seeding table (the client
/// orchestrator); kept as a trait here so the session logic does not depend
/// on that table's concrete shape.
pub trait UploadTable: Send + Sync {
    fn resolve(&self, info_hash: &[u8; 20]) -> Option<(PathBuf, u64)>;
}

/// An established, handshaked connection to one peer. Used serially: the
/// `busy` flag lets a pool of piece workers share sessions without issuing
/// two requests on the same socket at once (spec §4.4, half-duplex per
/// request).
pub struct PeerSession {
    stream: Mutex<TcpStream>,
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    busy: AtomicBool,
}

impl PeerSession {
    /// Outbound connect: TCP connect with a 5s timeout, then handshake
    /// exchange, then info_hash validation against the torrent being
    /// downloaded.
    pub fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        my_peer_id: [u8; 20],
    ) -> Result<PeerSession, ProtocolError> {
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let handshake = Handshake::new(info_hash, my_peer_id);
        stream.write_all(&handshake.to_bytes())?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf)?;
        let reply = Handshake::from_bytes(&buf)?;
        reply.check(&info_hash)?;

        log::info!("handshake complete with {addr}");
        Ok(PeerSession {
            stream: Mutex::new(stream),
            addr,
            peer_id: reply.peer_id,
            busy: AtomicBool::new(false),
        })
    }

    /// Attempts to claim this session for one request/response exchange.
    /// Returns false if another worker already holds it.
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Sends a REQUEST and waits for the matching PIECE. The session is
    /// strictly half-duplex: no pipelining, one outstanding request at a time.
    /// Callers coordinate exclusive use via [`try_acquire`]/[`release`];
    /// the lock here only guards the stream itself.
    pub fn request_block(
        &self,
        piece_index: u32,
        begin: u32,
        length: u32,
    ) -> Result<Bytes, ProtocolError> {
        let mut stream = self.stream.lock().unwrap();
        Message::Request(piece_index, begin, length)
            .write_to(&mut *stream)
            .map_err(ProtocolError::Frame)?;

        match Message::read_from(&mut *stream).map_err(ProtocolError::Frame)? {
            Message::Piece(index, offset, data) if index == piece_index && offset == begin => {
                Ok(data)
            }
            other => Err(ProtocolError::BadPeerResponse(format!(
                "expected PIECE({piece_index}, {begin}), got {other:?}"
            ))),
        }
    }

    pub fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        let mut stream = self.stream.lock().unwrap();
        message.write_to(&mut *stream).map_err(ProtocolError::Frame)
    }

    pub fn close(&self) {
        let _ = self.stream.lock().unwrap().shutdown(std::net::Shutdown::Both);
    }
}

/// Accepts one inbound peer connection that has already completed a raw TCP
/// accept: reads the handshake, resolves the info_hash against `uploads`,
/// replies with our own handshake, then serves REQUEST frames until the peer
/// disconnects or sends something malformed.
pub fn serve_inbound(
    mut stream: TcpStream,
    my_peer_id: [u8; 20],
    uploads: &dyn UploadTable,
) -> Result<(), ProtocolError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf)?;
    let their_handshake = Handshake::from_bytes(&buf)?;

    let (path, piece_length) = uploads
        .resolve(&their_handshake.info_hash)
        .ok_or_else(|| ProtocolError::UnknownUpload(hex::encode(their_handshake.info_hash)))?;

    let our_handshake = Handshake::new(their_handshake.info_hash, my_peer_id);
    stream.write_all(&our_handshake.to_bytes())?;

    let mut file = std::fs::File::open(&path)?;
    log::info!("serving uploads for {} to {:?}", path.display(), stream.peer_addr());

    loop {
        let message = match Message::read_from(&mut stream) {
            Ok(m) => m,
            Err(crate::error::FrameError::Eof) => return Ok(()),
            Err(e) => return Err(ProtocolError::Frame(e)),
        };
        let (piece_index, begin, length) = match message {
            Message::Request(index, begin, length) => (index, begin, length),
            Message::Cancel(..) | Message::KeepAlive => continue,
            other => {
                return Err(ProtocolError::BadPeerResponse(format!(
                    "expected REQUEST, got {other:?}"
                )))
            }
        };

        let offset = piece_index as u64 * piece_length + begin as u64;
        let mut data = vec![0u8; length as usize];
        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;

        Message::Piece(piece_index, begin, Bytes::from(data))
            .write_to(&mut stream)
            .map_err(ProtocolError::Frame)?;
    }
}
