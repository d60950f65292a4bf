//! Chord RPC transport (spec §4.5/§4.6): `<u32 length><UTF-8 JSON body>` framed
//! requests between ring neighbours, shared by node maintenance and tracker
//! control messages.

use crate::error::RingError;
use serde::de::Error as _;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// What a Chord node needs from its neighbours over the network. Kept as a
/// trait so node maintenance logic can be exercised against an in-process
/// fake in tests, without binding sockets.
pub trait RingTransport: Send + Sync {
    fn find_successor(&self, addr: &str, key_id: u64) -> Result<String, RingError>;
    fn find_predecessor(&self, addr: &str, key_id: u64) -> Result<String, RingError>;
    fn notify(&self, addr: &str, candidate: &str) -> Result<(), RingError>;
    fn get_predecessor(&self, addr: &str) -> Result<Option<String>, RingError>;
    fn get_successors(&self, addr: &str) -> Result<Vec<String>, RingError>;
    fn update_finger_table(
        &self,
        addr: &str,
        node_ip: &str,
        index: usize,
        origin: &str,
    ) -> Result<(), RingError>;
}

/// Writes `value` as `<u32 len><json>` to `w`.
pub fn write_frame<W: Write>(w: &mut W, value: &Value) -> std::io::Result<()> {
    let body = serde_json::to_vec(value).expect("json values always serialise");
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(&body)
}

/// Reads one `<u32 len><json>` frame from `r`.
pub fn read_frame<R: Read>(r: &mut R) -> std::io::Result<Value> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// The real, TCP-backed transport used outside tests.
pub struct TcpRingTransport;

impl TcpRingTransport {
    fn call(&self, addr: &str, request: Value) -> Result<Value, RingError> {
        let socket_addr = addr
            .parse()
            .map_err(|_| RingError::Rpc {
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address"),
            })?;
        let mut stream =
            TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT).map_err(|e| RingError::Rpc {
                addr: addr.to_string(),
                source: e,
            })?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| RingError::Rpc {
                addr: addr.to_string(),
                source: e,
            })?;
        write_frame(&mut stream, &request).map_err(|e| RingError::Rpc {
            addr: addr.to_string(),
            source: e,
        })?;
        read_frame(&mut stream).map_err(|e| RingError::Rpc {
            addr: addr.to_string(),
            source: e,
        })
    }
}

impl RingTransport for TcpRingTransport {
    fn find_successor(&self, addr: &str, key_id: u64) -> Result<String, RingError> {
        let resp = self.call(addr, json!({"type": "find_successor", "data": key_id}))?;
        field_str(addr, &resp, "successor")
    }

    fn find_predecessor(&self, addr: &str, key_id: u64) -> Result<String, RingError> {
        let resp = self.call(addr, json!({"type": "find_predecessor", "data": key_id}))?;
        field_str(addr, &resp, "predecessor")
    }

    fn notify(&self, addr: &str, candidate: &str) -> Result<(), RingError> {
        self.call(addr, json!({"type": "notify", "data": candidate}))?;
        Ok(())
    }

    fn get_predecessor(&self, addr: &str) -> Result<Option<String>, RingError> {
        let resp = self.call(addr, json!({"type": "get_predecessor"}))?;
        Ok(resp.get("predecessor").and_then(|v| v.as_str()).map(String::from))
    }

    fn get_successors(&self, addr: &str) -> Result<Vec<String>, RingError> {
        let resp = self.call(addr, json!({"type": "get_successors"}))?;
        Ok(resp
            .get("successors")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default())
    }

    fn update_finger_table(
        &self,
        addr: &str,
        node_ip: &str,
        index: usize,
        origin: &str,
    ) -> Result<(), RingError> {
        self.call(
            addr,
            json!({
                "type": "update_finger_table",
                "node_ip": node_ip,
                "index": index,
                "origin": origin,
            }),
        )?;
        Ok(())
    }
}

fn field_str(addr: &str, value: &Value, field: &'static str) -> Result<String, RingError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| {
            RingError::MalformedResponse(
                addr.to_string(),
                serde::de::Error::custom(format!("missing field {field}")),
            )
        })
}
