// ==============================================================================
// crates/core/src/protocol/payload.rs - Extra-Field Sub-Parsers
// ==============================================================================

//! Parsers and encoders for the structured payloads carried inside a frame's
//! `extra` field. The codec treats `extra` as opaque; these helpers are used
//! by the dispatch layer once the mode and options are known.
//!
//! Three shapes exist:
//! - presence: `nickname` or `nickname\0group`
//! - file attach: `text\0id:name:sizeHex:mtimeHex:typeHex` with further
//!   descriptors separated by 0x07, filename colons escaped as `::`
//! - data request: `packetNoHex:fileIdHex:offsetHex:`

use crate::error::Error;
use crate::protocol::constants::{file_type, FILELIST_SEPARATOR};
use serde::{Deserialize, Serialize};

/// Identity carried by entry/answer-entry/exit payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceInfo {
    pub nickname: String,
    /// Empty when the sender announced no group.
    pub group: String,
}

/// Parse a presence payload. The NUL separator is optional; its absence
/// means the sender runs an older client that never sends a group.
pub fn parse_presence(extra: &[u8]) -> PresenceInfo {
    match extra.iter().position(|&b| b == 0) {
        Some(pos) => PresenceInfo {
            nickname: String::from_utf8_lossy(&extra[..pos]).into_owned(),
            group: String::from_utf8_lossy(&extra[pos + 1..]).into_owned(),
        },
        None => PresenceInfo {
            nickname: String::from_utf8_lossy(extra).into_owned(),
            group: String::new(),
        },
    }
}

/// Encode a presence payload (`nickname\0group`).
pub fn encode_presence(nickname: &str, group: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(nickname.len() + group.len() + 1);
    out.extend_from_slice(nickname.as_bytes());
    out.push(0);
    out.extend_from_slice(group.as_bytes());
    out
}

/// One announced file in a file-attach list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub file_id: u32,
    pub filename: String,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
    pub file_type: u32,
}

impl FileDescriptor {
    pub fn is_regular(&self) -> bool {
        self.file_type == file_type::REGULAR
    }
}

/// Parse a file-attach payload into the message text and its descriptor
/// list. Descriptors that fail to parse are skipped rather than failing the
/// whole payload; an attach frame whose list comes out empty is handled by
/// the caller as a plain message.
pub fn parse_file_attach(extra: &[u8]) -> (String, Vec<FileDescriptor>) {
    let null_pos = match extra.iter().position(|&b| b == 0) {
        Some(pos) => pos,
        None => return (String::from_utf8_lossy(extra).into_owned(), Vec::new()),
    };

    let text = String::from_utf8_lossy(&extra[..null_pos]).into_owned();
    let list = &extra[null_pos + 1..];

    let files = list
        .split(|&b| b == FILELIST_SEPARATOR)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(parse_descriptor)
        .collect();

    (text, files)
}

/// Encode a file-attach payload from message text and descriptors.
pub fn encode_file_attach(text: &str, files: &[FileDescriptor]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    for (i, file) in files.iter().enumerate() {
        if i > 0 {
            out.push(FILELIST_SEPARATOR);
        }
        let escaped = file.filename.replace(':', "::");
        out.extend_from_slice(
            format!(
                "{}:{}:{:x}:{:x}:{:x}",
                file.file_id, escaped, file.size, file.mtime, file.file_type
            )
            .as_bytes(),
        );
    }
    out
}

/// `{fileId}:{filename}:{sizeHex}:{mtimeHex}:{typeHex}`, filename colons
/// escaped as `::`. Missing mtime/type fields default rather than fail,
/// matching what foreign clients actually put on the wire.
fn parse_descriptor(raw: &[u8]) -> Option<FileDescriptor> {
    let s = String::from_utf8_lossy(raw);
    let (id_field, rest) = s.split_once(':')?;
    let file_id = id_field.trim().parse().ok()?;

    // Walk the filename by hand: `::` is a literal colon, a lone `:` ends it.
    let mut filename = String::new();
    let chars: Vec<char> = rest.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ':' {
            if i + 1 < chars.len() && chars[i + 1] == ':' {
                filename.push(':');
                i += 2;
            } else {
                i += 1;
                break;
            }
        } else {
            filename.push(chars[i]);
            i += 1;
        }
    }
    if filename.is_empty() {
        return None;
    }

    let tail: String = chars[i..].iter().collect();
    let mut fields = tail.split(':');
    let size = u64::from_str_radix(fields.next()?, 16).ok()?;
    let mtime = match fields.next() {
        Some("") | None => 0,
        Some(f) => u64::from_str_radix(f, 16).unwrap_or(0),
    };
    let ftype = match fields.next() {
        Some("") | None => file_type::REGULAR,
        Some(f) => u32::from_str_radix(f, 16).unwrap_or(file_type::REGULAR),
    };

    Some(FileDescriptor {
        file_id,
        filename,
        size,
        mtime,
        file_type: ftype,
    })
}

/// Parse the `packetNoHex:fileIdHex:offsetHex:` request line quoted on the
/// bulk TCP channel (and mirrored on the UDP control leg). An empty offset
/// field means zero.
pub fn parse_data_request(line: &str) -> Result<(u64, u32, u64), Error> {
    let mut fields = line.trim().split(':');
    let packet_no = fields
        .next()
        .and_then(|f| u64::from_str_radix(f, 16).ok())
        .ok_or(Error::MalformedPacket("bad request packet number"))?;
    let file_id = fields
        .next()
        .and_then(|f| u32::from_str_radix(f, 16).ok())
        .ok_or(Error::MalformedPacket("bad request file id"))?;
    let offset = match fields.next() {
        Some("") | None => 0,
        Some(f) => {
            u64::from_str_radix(f, 16).map_err(|_| Error::MalformedPacket("bad request offset"))?
        }
    };
    Ok((packet_no, file_id, offset))
}

/// Encode a data-request line, trailing colon included.
pub fn encode_data_request(packet_no: u64, file_id: u32, offset: u64) -> String {
    format!("{:x}:{:x}:{:x}:", packet_no, file_id, offset)
}
