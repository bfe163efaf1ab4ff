// ==============================================================================
// crates/core/src/protocol/packet.rs - Wire Frame Codec
// ==============================================================================

//! Encoder/decoder for the colon-delimited IPMSG wire frame.
//!
//! Layout: `version:packetNo:sender:host:command:extra`. The split is limited
//! to five separators; everything after the fifth colon is the `extra` field
//! and is carried as an opaque byte string. It may legally contain further
//! colons, NUL bytes, or the 0x07 file-list separator, so the codec never
//! splits it again; that is the dispatch layer's job.

use crate::error::Error;
use crate::protocol::constants::PROTOCOL_VERSION;
use bytes::{BufMut, BytesMut};

/// A parsed control datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: String,
    pub packet_no: u64,
    pub sender: String,
    pub host: String,
    pub command: u32,
    pub extra: Vec<u8>,
}

impl Packet {
    pub fn mode(&self) -> u32 {
        crate::protocol::constants::mode_of(self.command)
    }

    pub fn has_opt(&self, opt: u32) -> bool {
        crate::protocol::constants::has_opt(self.command, opt)
    }
}

/// Encode a frame for transmission.
pub fn encode(packet_no: u64, sender: &str, host: &str, command: u32, extra: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(32 + extra.len());
    out.put_slice(PROTOCOL_VERSION.as_bytes());
    out.put_u8(b':');
    out.put_slice(packet_no.to_string().as_bytes());
    out.put_u8(b':');
    out.put_slice(sender.as_bytes());
    out.put_u8(b':');
    out.put_slice(host.as_bytes());
    out.put_u8(b':');
    out.put_slice(command.to_string().as_bytes());
    out.put_u8(b':');
    out.put_slice(extra);
    out.into()
}

/// Decode a datagram into a [`Packet`].
///
/// Fails when fewer than five colon-separated fields are present or when
/// `packetNo`/`command` are not decimal integers. Callers drop failures
/// silently: heterogeneous senders share the segment and the protocol
/// convention is to tolerate their noise, never to answer it.
pub fn decode(data: &[u8]) -> Result<Packet, Error> {
    let mut fields: Vec<&[u8]> = Vec::with_capacity(6);
    let mut rest = data;
    for _ in 0..5 {
        match rest.iter().position(|&b| b == b':') {
            Some(pos) => {
                fields.push(&rest[..pos]);
                rest = &rest[pos + 1..];
            }
            None => {
                fields.push(rest);
                rest = &[];
                break;
            }
        }
    }
    if fields.len() < 5 {
        return Err(Error::MalformedPacket("fewer than 5 fields"));
    }
    fields.push(rest);

    let packet_no = parse_decimal(fields[1]).ok_or(Error::MalformedPacket("bad packet number"))?;
    let command = parse_decimal(fields[4]).ok_or(Error::MalformedPacket("bad command"))? as u32;

    Ok(Packet {
        version: String::from_utf8_lossy(fields[0]).into_owned(),
        packet_no,
        sender: String::from_utf8_lossy(fields[2]).into_owned(),
        host: String::from_utf8_lossy(fields[3]).into_owned(),
        command,
        extra: fields[5].to_vec(),
    })
}

fn parse_decimal(field: &[u8]) -> Option<u64> {
    std::str::from_utf8(field).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{mode, opt};

    #[test]
    fn roundtrip_plain_message() {
        let cmd = mode::SENDMSG | opt::SENDCHECK;
        let wire = encode(12345, "user1", "host1", cmd, b"Hello");
        let pkt = decode(&wire).unwrap();
        assert_eq!(pkt.version, "1");
        assert_eq!(pkt.packet_no, 12345);
        assert_eq!(pkt.sender, "user1");
        assert_eq!(pkt.host, "host1");
        assert_eq!(pkt.command, cmd);
        assert_eq!(pkt.extra, b"Hello");
    }

    #[test]
    fn extra_field_is_opaque() {
        // Colons, NULs and the 0x07 list separator must survive untouched.
        let extra = b"msg\0105:photo::jpg:2710:68b1c2d3:1\x07106:b.txt:10:0:1";
        let wire = encode(1, "u", "h", mode::SENDMSG, extra);
        let pkt = decode(&wire).unwrap();
        assert_eq!(pkt.extra, extra.to_vec());
    }

    #[test]
    fn rejects_short_frames() {
        assert!(decode(b"").is_err());
        assert!(decode(b"1:2:3:4").is_err());
        assert!(decode(b"no separators at all").is_err());
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert!(decode(b"1:abc:u:h:32:hi").is_err());
        assert!(decode(b"1:100:u:h:cmd:hi").is_err());
    }

    #[test]
    fn empty_extra_is_valid() {
        let pkt = decode(b"1:99:u:h:1:").unwrap();
        assert!(pkt.extra.is_empty());
        // Five fields with no trailing colon also decodes; extra is empty.
        let pkt = decode(b"1:99:u:h:1").unwrap();
        assert!(pkt.extra.is_empty());
    }

    #[test]
    fn lossy_sender_decode() {
        let mut wire = b"1:7:".to_vec();
        wire.extend_from_slice(&[0xff, 0xfe]);
        wire.extend_from_slice(b":h:32:x");
        let pkt = decode(&wire).unwrap();
        assert_eq!(pkt.packet_no, 7);
        assert_eq!(pkt.extra, b"x");
    }
}
