// # Wire Framing and Packet Codecs
//
// Every frame starts with a packed little-endian header `{u16 size; u16 id}`
// where `size` counts the whole frame, header included. Valid sizes span
// `[HEADER_SIZE, MAX_PACKET_SIZE]`. Framing is length-prefix only: no magic,
// no checksum.
//
// The concrete packets below exercise the engine: the client ping/pong pair
// and the server-to-server protocol spoken between the game and DB servers.

use bytes::{Buf, BufMut, BytesMut};

use crate::common::MAX_PACKET_SIZE;

/// Wire size of the frame header.
pub const HEADER_SIZE: usize = 4;

// ============================================================================
// Packet Ids
// ============================================================================

pub mod packet_id {
    // Client protocol
    pub const PING_REQ: u16 = 1;
    pub const PONG_RES: u16 = 2;

    // Server-to-server protocol
    pub const SERVER_PING_REQ: u16 = 1000;
    pub const SERVER_PONG_RES: u16 = 1001;
    pub const DB_SAVE_PING_TIME_REQ: u16 = 2000;
    pub const DB_SAVE_PING_TIME_RES: u16 = 2001;
}

// ============================================================================
// Header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total frame size including this header.
    pub size: u16,
    /// Message type tag.
    pub id: u16,
}

impl PacketHeader {
    /// Read a header from the front of `buf` without consuming it.
    pub fn peek(buf: &[u8]) -> Option<PacketHeader> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut cursor = buf;
        Some(PacketHeader {
            size: cursor.get_u16_le(),
            id: cursor.get_u16_le(),
        })
    }

    /// Whether `size` is inside the legal frame bounds.
    #[inline]
    pub fn is_valid_size(&self) -> bool {
        (self.size as usize) >= HEADER_SIZE && (self.size as usize) <= MAX_PACKET_SIZE
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_u16_le(self.size);
        out.put_u16_le(self.id);
    }
}

/// Frame an id + body into a wire buffer. Panics only when the body would
/// overflow `u16`, which the session layer's size checks already exclude.
pub fn build_frame(id: u16, body: &[u8]) -> Vec<u8> {
    let total = HEADER_SIZE + body.len();
    debug_assert!(total <= MAX_PACKET_SIZE);

    let mut out = BytesMut::with_capacity(total);
    PacketHeader {
        size: total as u16,
        id,
    }
    .write(&mut out);
    out.put_slice(body);
    out.to_vec()
}

// ============================================================================
// Client Ping / Pong
// ============================================================================

/// Client latency probe. 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReq {
    pub client_time: u64,
    pub sequence: u32,
}

impl PingReq {
    pub const WIRE_SIZE: usize = HEADER_SIZE + 12;

    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(12);
        body.put_u64_le(self.client_time);
        body.put_u32_le(self.sequence);
        build_frame(packet_id::PING_REQ, &body)
    }

    /// Decode from a full frame (header included).
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() != Self::WIRE_SIZE {
            return None;
        }
        let mut cursor = &frame[HEADER_SIZE..];
        Some(Self {
            client_time: cursor.get_u64_le(),
            sequence: cursor.get_u32_le(),
        })
    }
}

/// Server reply echoing the client time. 24 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongRes {
    pub client_time: u64,
    pub server_time: u64,
    pub sequence: u32,
}

impl PongRes {
    pub const WIRE_SIZE: usize = HEADER_SIZE + 20;

    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(20);
        body.put_u64_le(self.client_time);
        body.put_u64_le(self.server_time);
        body.put_u32_le(self.sequence);
        build_frame(packet_id::PONG_RES, &body)
    }

    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() != Self::WIRE_SIZE {
            return None;
        }
        let mut cursor = &frame[HEADER_SIZE..];
        Some(Self {
            client_time: cursor.get_u64_le(),
            server_time: cursor.get_u64_le(),
            sequence: cursor.get_u32_le(),
        })
    }
}

// ============================================================================
// Server-to-Server Ping / Pong
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerPingReq {
    pub timestamp: u64,
    pub sequence: u32,
}

impl ServerPingReq {
    pub const WIRE_SIZE: usize = HEADER_SIZE + 12;

    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(12);
        body.put_u64_le(self.timestamp);
        body.put_u32_le(self.sequence);
        build_frame(packet_id::SERVER_PING_REQ, &body)
    }

    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() != Self::WIRE_SIZE {
            return None;
        }
        let mut cursor = &frame[HEADER_SIZE..];
        Some(Self {
            timestamp: cursor.get_u64_le(),
            sequence: cursor.get_u32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerPongRes {
    pub request_timestamp: u64,
    pub response_timestamp: u64,
    pub sequence: u32,
}

impl ServerPongRes {
    pub const WIRE_SIZE: usize = HEADER_SIZE + 20;

    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(20);
        body.put_u64_le(self.request_timestamp);
        body.put_u64_le(self.response_timestamp);
        body.put_u32_le(self.sequence);
        build_frame(packet_id::SERVER_PONG_RES, &body)
    }

    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() != Self::WIRE_SIZE {
            return None;
        }
        let mut cursor = &frame[HEADER_SIZE..];
        Some(Self {
            request_timestamp: cursor.get_u64_le(),
            response_timestamp: cursor.get_u64_le(),
            sequence: cursor.get_u32_le(),
        })
    }
}

// ============================================================================
// DB Save Ping Time
// ============================================================================

const SERVER_NAME_LEN: usize = 32;
const RESULT_MESSAGE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSavePingTimeReq {
    pub server_id: u32,
    pub timestamp: u64,
    pub server_name: String,
}

impl DbSavePingTimeReq {
    pub const WIRE_SIZE: usize = HEADER_SIZE + 4 + 8 + SERVER_NAME_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(Self::WIRE_SIZE - HEADER_SIZE);
        body.put_u32_le(self.server_id);
        body.put_u64_le(self.timestamp);
        body.put_slice(&fixed_str::<SERVER_NAME_LEN>(&self.server_name));
        build_frame(packet_id::DB_SAVE_PING_TIME_REQ, &body)
    }

    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() != Self::WIRE_SIZE {
            return None;
        }
        let mut cursor = &frame[HEADER_SIZE..];
        let server_id = cursor.get_u32_le();
        let timestamp = cursor.get_u64_le();
        let server_name = parse_fixed_str(&cursor[..SERVER_NAME_LEN]);
        Some(Self {
            server_id,
            timestamp,
            server_name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSavePingTimeRes {
    pub server_id: u32,
    /// 0 = success, non-zero = error code.
    pub result: u8,
    pub message: String,
}

impl DbSavePingTimeRes {
    pub const WIRE_SIZE: usize = HEADER_SIZE + 4 + 1 + RESULT_MESSAGE_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(Self::WIRE_SIZE - HEADER_SIZE);
        body.put_u32_le(self.server_id);
        body.put_u8(self.result);
        body.put_slice(&fixed_str::<RESULT_MESSAGE_LEN>(&self.message));
        build_frame(packet_id::DB_SAVE_PING_TIME_RES, &body)
    }

    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() != Self::WIRE_SIZE {
            return None;
        }
        let mut cursor = &frame[HEADER_SIZE..];
        let server_id = cursor.get_u32_le();
        let result = cursor.get_u8();
        let message = parse_fixed_str(&cursor[..RESULT_MESSAGE_LEN]);
        Some(Self {
            server_id,
            result,
            message,
        })
    }
}

/// NUL-padded fixed-width string field, truncated at the field width.
fn fixed_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = s.as_bytes();
    let take = bytes.len().min(N - 1);
    out[..take].copy_from_slice(&bytes[..take]);
    out
}

fn parse_fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_peek_little_endian() {
        let frame = build_frame(0x0102, &[0xAA, 0xBB]);
        assert_eq!(frame.len(), 6);
        assert_eq!(&frame[..2], &[6, 0]);
        assert_eq!(&frame[2..4], &[0x02, 0x01]);

        let header = PacketHeader::peek(&frame).unwrap();
        assert_eq!(header.size, 6);
        assert_eq!(header.id, 0x0102);
        assert!(header.is_valid_size());
    }

    #[test]
    fn test_header_peek_short_buffer() {
        assert_eq!(PacketHeader::peek(&[1, 2, 3]), None);
    }

    #[test]
    fn test_invalid_sizes() {
        let undersized = PacketHeader { size: 3, id: 1 };
        assert!(!undersized.is_valid_size());

        let oversized = PacketHeader {
            size: (MAX_PACKET_SIZE + 1) as u16,
            id: 1,
        };
        assert!(!oversized.is_valid_size());

        let max = PacketHeader {
            size: MAX_PACKET_SIZE as u16,
            id: 1,
        };
        assert!(max.is_valid_size());
    }

    #[test]
    fn test_ping_req_wire_shape() {
        let ping = PingReq {
            client_time: 1000,
            sequence: 1,
        };
        let frame = ping.encode();
        assert_eq!(frame.len(), 16);

        let header = PacketHeader::peek(&frame).unwrap();
        assert_eq!(header.size, 16);
        assert_eq!(header.id, packet_id::PING_REQ);
        assert_eq!(PingReq::decode(&frame), Some(ping));
    }

    #[test]
    fn test_pong_res_wire_shape() {
        let pong = PongRes {
            client_time: 1000,
            server_time: 123_456,
            sequence: 9,
        };
        let frame = pong.encode();
        assert_eq!(frame.len(), 24);
        assert_eq!(PongRes::decode(&frame), Some(pong));
    }

    #[test]
    fn test_server_ping_pong() {
        let req = ServerPingReq {
            timestamp: 42,
            sequence: 3,
        };
        let decoded = ServerPingReq::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);

        let res = ServerPongRes {
            request_timestamp: 42,
            response_timestamp: 43,
            sequence: 3,
        };
        assert_eq!(ServerPongRes::decode(&res.encode()), Some(res));
    }

    #[test]
    fn test_db_save_ping_time_name_handling() {
        let req = DbSavePingTimeReq {
            server_id: 12,
            timestamp: 999,
            server_name: "game-01".to_string(),
        };
        let decoded = DbSavePingTimeReq::decode(&req.encode()).unwrap();
        assert_eq!(decoded.server_name, "game-01");
        assert_eq!(decoded.server_id, 12);

        let long = DbSavePingTimeReq {
            server_id: 1,
            timestamp: 1,
            server_name: "x".repeat(100),
        };
        let decoded = DbSavePingTimeReq::decode(&long.encode()).unwrap();
        assert_eq!(decoded.server_name.len(), SERVER_NAME_LEN - 1);
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        let frame = PingReq {
            client_time: 1,
            sequence: 1,
        }
        .encode();
        assert_eq!(PongRes::decode(&frame), None);
        assert_eq!(PingReq::decode(&frame[..12]), None);
    }
}
