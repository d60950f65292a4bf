//! Wire codec (C1, spec §4.1): handshake aside, every peer message shares the
//! frame `<u32 length><u8 id><payload>`. `length` counts the id byte plus payload.

use crate::bitfield::BitField;
use crate::error::FrameError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read, Write};

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(BitField),
    Request(u32, u32, u32),
    Piece(u32, u32, Bytes),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(ID_CHOKE),
            Message::Unchoke => Some(ID_UNCHOKE),
            Message::Interested => Some(ID_INTERESTED),
            Message::NotInterested => Some(ID_NOT_INTERESTED),
            Message::Have(_) => Some(ID_HAVE),
            Message::Bitfield(_) => Some(ID_BITFIELD),
            Message::Request(..) => Some(ID_REQUEST),
            Message::Piece(..) => Some(ID_PIECE),
            Message::Cancel(..) => Some(ID_CANCEL),
            Message::Port(_) => Some(ID_PORT),
        }
    }

    /// Encodes the message into its on-wire frame, including the u32 length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::new();
        match self {
            Message::KeepAlive => {
                buf.write_u32::<BigEndian>(0)?;
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                buf.write_u32::<BigEndian>(1)?;
                buf.write_u8(self.id().unwrap())?;
            }
            Message::Have(piece_index) => {
                buf.write_u32::<BigEndian>(5)?;
                buf.write_u8(ID_HAVE)?;
                buf.write_u32::<BigEndian>(*piece_index)?;
            }
            Message::Bitfield(bitfield) => {
                let payload = bitfield.to_payload();
                let len = 1 + payload.len();
                let len_u32 = u32::try_from(len).map_err(|_| FrameError::EncodeError {
                    expected: "Bitfield",
                    len,
                })?;
                buf.write_u32::<BigEndian>(len_u32)?;
                buf.write_u8(ID_BITFIELD)?;
                buf.write_all(payload)?;
            }
            Message::Request(index, begin, length) => {
                buf.write_u32::<BigEndian>(13)?;
                buf.write_u8(ID_REQUEST)?;
                buf.write_u32::<BigEndian>(*index)?;
                buf.write_u32::<BigEndian>(*begin)?;
                buf.write_u32::<BigEndian>(*length)?;
            }
            Message::Piece(index, begin, block) => {
                let len = 9 + block.len();
                let len_u32 = u32::try_from(len).map_err(|_| FrameError::EncodeError {
                    expected: "Piece",
                    len,
                })?;
                buf.write_u32::<BigEndian>(len_u32)?;
                buf.write_u8(ID_PIECE)?;
                buf.write_u32::<BigEndian>(*index)?;
                buf.write_u32::<BigEndian>(*begin)?;
                buf.write_all(&block[..])?;
            }
            Message::Cancel(index, begin, length) => {
                buf.write_u32::<BigEndian>(13)?;
                buf.write_u8(ID_CANCEL)?;
                buf.write_u32::<BigEndian>(*index)?;
                buf.write_u32::<BigEndian>(*begin)?;
                buf.write_u32::<BigEndian>(*length)?;
            }
            Message::Port(port) => {
                buf.write_u32::<BigEndian>(5)?;
                buf.write_u8(ID_PORT)?;
                buf.write_u32::<BigEndian>(*port as u32)?;
            }
        }
        Ok(buf)
    }

    /// Decodes one message from `length` (the declared frame length, id byte
    /// included) and `body` (exactly `length` bytes: the id byte plus payload,
    /// or empty for a KeepAlive).
    pub fn decode(length: u32, body: &[u8]) -> Result<Message, FrameError> {
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if body.len() != length as usize {
            return Err(FrameError::InvalidFrame {
                declared: length,
                reason: "body length does not match declared frame length",
            });
        }
        let mut cursor = Cursor::new(body);
        let id = cursor.read_u8()?;
        match id {
            ID_CHOKE => expect_len(length, 1, "Choke", Message::Choke),
            ID_UNCHOKE => expect_len(length, 1, "Unchoke", Message::Unchoke),
            ID_INTERESTED => expect_len(length, 1, "Interested", Message::Interested),
            ID_NOT_INTERESTED => expect_len(length, 1, "NotInterested", Message::NotInterested),
            ID_HAVE => {
                if length != 5 {
                    return Err(FrameError::InvalidFrame {
                        declared: length,
                        reason: "Have frame must declare length 5",
                    });
                }
                let piece_index = cursor.read_u32::<BigEndian>()?;
                Ok(Message::Have(piece_index))
            }
            ID_BITFIELD => {
                let payload = &body[1..];
                Ok(Message::Bitfield(BitField::from_payload(payload)?))
            }
            ID_REQUEST => {
                if length != 13 {
                    return Err(FrameError::InvalidFrame {
                        declared: length,
                        reason: "Request frame must declare length 13",
                    });
                }
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let req_len = cursor.read_u32::<BigEndian>()?;
                Ok(Message::Request(index, begin, req_len))
            }
            ID_PIECE => {
                if length < 9 {
                    return Err(FrameError::InvalidFrame {
                        declared: length,
                        reason: "Piece frame must declare length >= 9",
                    });
                }
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                Ok(Message::Piece(index, begin, Bytes::copy_from_slice(&body[9..])))
            }
            ID_CANCEL => {
                if length != 13 {
                    return Err(FrameError::InvalidFrame {
                        declared: length,
                        reason: "Cancel frame must declare length 13",
                    });
                }
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let cancel_len = cursor.read_u32::<BigEndian>()?;
                Ok(Message::Cancel(index, begin, cancel_len))
            }
            ID_PORT => {
                if length != 5 {
                    return Err(FrameError::InvalidFrame {
                        declared: length,
                        reason: "Port frame must declare length 5",
                    });
                }
                let port = cursor.read_u32::<BigEndian>()?;
                Ok(Message::Port(port as u16))
            }
            other => Err(FrameError::UnknownMessageId(other)),
        }
    }

    /// Encodes and writes this message to `w` in one call.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), FrameError> {
        w.write_all(&self.encode()?)?;
        Ok(())
    }

    /// Reads exactly one frame from `r`, tolerant of arbitrary TCP segmentation:
    /// the 4-byte length prefix and the frame body are each read with a
    /// read-until-complete loop (`Read::read_exact`), so callers whose
    /// transport delivers a handful of bytes per syscall still see one frame.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Message, FrameError> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf).map_err(map_eof)?;
        let length = u32::from_be_bytes(len_buf);
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        let mut body = vec![0u8; length as usize];
        r.read_exact(&mut body).map_err(map_eof)?;
        Message::decode(length, &body)
    }
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Eof
    } else {
        FrameError::Io(e)
    }
}

fn expect_len(
    declared: u32,
    expected: u32,
    reason: &'static str,
    msg: Message,
) -> Result<Message, FrameError> {
    if declared != expected {
        return Err(FrameError::InvalidFrame {
            declared,
            reason,
        });
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let bytes = msg.encode().unwrap();
        let mut cursor = Cursor::new(bytes);
        let decoded = Message::read_from(&mut cursor).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn keep_alive_round_trips() {
        round_trip(Message::KeepAlive);
    }

    #[test]
    fn no_payload_variants_round_trip() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
    }

    #[test]
    fn have_round_trips() {
        round_trip(Message::Have(42));
    }

    #[test]
    fn bitfield_round_trips() {
        round_trip(Message::Bitfield(BitField::new(vec![0b1010_0000, 0b0000_0001])));
    }

    #[test]
    fn request_and_cancel_round_trip() {
        round_trip(Message::Request(1, 16384, 16384));
        round_trip(Message::Cancel(1, 16384, 16384));
    }

    #[test]
    fn piece_round_trips_with_block_data() {
        round_trip(Message::Piece(2, 0, Bytes::from(vec![0xAB; 16384])));
    }

    #[test]
    fn piece_round_trips_with_short_last_block() {
        round_trip(Message::Piece(3, 16384, Bytes::from(vec![0xCD; 100])));
    }

    #[test]
    fn port_round_trips() {
        round_trip(Message::Port(6881));
    }

    #[test]
    fn decode_rejects_wrong_request_length() {
        let err = Message::decode(12, &[ID_REQUEST, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrame { .. }));
    }

    #[test]
    fn decode_rejects_unknown_id() {
        let err = Message::decode(1, &[200]).unwrap_err();
        assert!(matches!(err, FrameError::UnknownMessageId(200)));
    }

    /// Framing resilience (spec invariant 5 / scenario): feeding the reader one
    /// byte at a time must still yield a well-formed REQUEST.
    #[test]
    fn read_from_tolerates_single_byte_segmentation() {
        let msg = Message::Request(7, 0, 16384);
        let bytes = msg.encode().unwrap();

        struct OneByteAtATime<'a> {
            data: &'a [u8],
            pos: usize,
        }
        impl<'a> Read for OneByteAtATime<'a> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.pos >= self.data.len() {
                    return Ok(0);
                }
                buf[0] = self.data[self.pos];
                self.pos += 1;
                Ok(1)
            }
        }

        let mut reader = OneByteAtATime {
            data: &bytes,
            pos: 0,
        };
        let decoded = Message::read_from(&mut reader).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn read_from_handles_split_across_two_reads() {
        let msg = Message::Piece(1, 0, Bytes::from(vec![1, 2, 3, 4, 5]));
        let bytes = msg.encode().unwrap();
        for split in 0..bytes.len() {
            let (a, b) = bytes.split_at(split);
            let mut chained = Cursor::new(a.to_vec()).chain(Cursor::new(b.to_vec()));
            let decoded = Message::read_from(&mut chained).unwrap();
            assert_eq!(decoded, msg);
        }
    }
}
