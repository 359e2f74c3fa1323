//! Gzip container framing (RFC 1952).
//!
//! Encodes and decodes the 10-byte fixed header, the optional fields gated
//! by FLG bits, and the 8-byte CRC32 + ISIZE trailer. Also encodes the
//! BGZF-style FEXTRA subfield that records a member's total byte length,
//! which lets the decompressor find member boundaries without inflating.

use crate::error::{PargzError, PargzResult};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const CM_DEFLATE: u8 = 8;

pub const FTEXT: u8 = 0x01;
pub const FHCRC: u8 = 0x02;
pub const FEXTRA: u8 = 0x04;
pub const FNAME: u8 = 0x08;
pub const FCOMMENT: u8 = 0x10;
/// Bits 5-7 are reserved and must be zero.
pub const FRESERVED: u8 = 0xe0;

/// Subfield ID for the member-length marker written in independent-member
/// framing. Any RFC 1952 reader skips unknown subfields, so this stays
/// interoperable with standard decoders.
pub const SIZE_SUBFIELD_ID: [u8; 2] = [b'P', b'G'];

/// OS byte: unknown. Matches what pigz emits for portable output.
const OS_UNKNOWN: u8 = 0xff;

pub const TRAILER_LEN: usize = 8;
pub const FIXED_HEADER_LEN: usize = 10;

/// Metadata carried in the gzip header: FNAME, MTIME, FCOMMENT.
#[derive(Clone, Debug, Default)]
pub struct GzipHeaderInfo {
    /// Original filename (basename only) for the FNAME field.
    pub filename: Option<String>,
    /// Modification time as a Unix timestamp, 0 = not available.
    pub mtime: u32,
    /// Optional FCOMMENT text.
    pub comment: Option<String>,
}

/// A decoded gzip member header.
#[derive(Clone, Debug)]
pub struct ParsedHeader {
    /// Offset of the first deflate byte (total header length).
    pub data_start: usize,
    pub info: GzipHeaderInfo,
    /// Total member length from the size subfield, when present.
    pub member_len: Option<u32>,
}

/// Write a gzip header for `info`. When `with_size_marker` is set, an FEXTRA
/// subfield with a 4-byte length placeholder is included; the caller patches
/// it via [`patch_member_len`] once the member is complete. Returns the byte
/// offset of the placeholder (or 0 when no marker was requested).
pub fn write_header(out: &mut Vec<u8>, info: &GzipHeaderInfo, with_size_marker: bool) -> usize {
    let mut flags: u8 = 0;
    if with_size_marker {
        flags |= FEXTRA;
    }
    if info.filename.is_some() {
        flags |= FNAME;
    }
    if info.comment.is_some() {
        flags |= FCOMMENT;
    }

    out.extend_from_slice(&GZIP_MAGIC);
    out.push(CM_DEFLATE);
    out.push(flags);
    out.extend_from_slice(&info.mtime.to_le_bytes());
    out.push(0x00); // XFL
    out.push(OS_UNKNOWN);

    let mut size_offset = 0;
    if with_size_marker {
        // XLEN = 8: subfield ID (2) + subfield len (2) + member length (4)
        out.extend_from_slice(&[8, 0]);
        out.extend_from_slice(&SIZE_SUBFIELD_ID);
        out.extend_from_slice(&[4, 0]);
        size_offset = out.len();
        out.extend_from_slice(&[0, 0, 0, 0]);
    }

    // RFC 1952 field order: FEXTRA, then FNAME, then FCOMMENT.
    if let Some(ref name) = info.filename {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    if let Some(ref comment) = info.comment {
        out.extend_from_slice(comment.as_bytes());
        out.push(0);
    }

    size_offset
}

/// Patch the member-length placeholder left by [`write_header`].
pub fn patch_member_len(member: &mut [u8], size_offset: usize, member_len: u32) {
    member[size_offset..size_offset + 4].copy_from_slice(&member_len.to_le_bytes());
}

/// Append the 8-byte trailer: CRC32 then ISIZE, both little-endian.
pub fn write_trailer(out: &mut Vec<u8>, crc32: u32, isize: u32) {
    out.extend_from_slice(&crc32.to_le_bytes());
    out.extend_from_slice(&isize.to_le_bytes());
}

/// Decode the trailer at the end of `member`.
pub fn read_trailer(member: &[u8]) -> PargzResult<(u32, u32)> {
    if member.len() < TRAILER_LEN {
        return Err(PargzError::truncated("missing gzip trailer"));
    }
    let t = &member[member.len() - TRAILER_LEN..];
    let crc32 = u32::from_le_bytes([t[0], t[1], t[2], t[3]]);
    let isize = u32::from_le_bytes([t[4], t[5], t[6], t[7]]);
    Ok((crc32, isize))
}

/// Parse one gzip member header starting at `data[0]`.
///
/// Rejects wrong magic, compression methods other than deflate, and reserved
/// flag bits. An FHCRC field, when present, is verified against the header
/// bytes. Truncation anywhere in the optional fields is reported as
/// `TruncatedStream`, not `Format`: the prefix was valid gzip.
pub fn parse_header(data: &[u8]) -> PargzResult<ParsedHeader> {
    if data.len() < FIXED_HEADER_LEN {
        return Err(PargzError::truncated("gzip header shorter than 10 bytes"));
    }
    if data[0] != GZIP_MAGIC[0] || data[1] != GZIP_MAGIC[1] {
        return Err(PargzError::format("bad magic bytes (not a gzip stream)"));
    }
    if data[2] != CM_DEFLATE {
        return Err(PargzError::format(format!(
            "unsupported compression method {}",
            data[2]
        )));
    }
    let flags = data[3];
    if flags & FRESERVED != 0 {
        return Err(PargzError::format(format!(
            "reserved header flag bits set: {:#04x}",
            flags
        )));
    }

    let mtime = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let mut pos = FIXED_HEADER_LEN;
    let mut member_len = None;

    if flags & FEXTRA != 0 {
        if pos + 2 > data.len() {
            return Err(PargzError::truncated("header ends inside FEXTRA length"));
        }
        let xlen = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;
        if pos + xlen > data.len() {
            return Err(PargzError::truncated("header ends inside FEXTRA data"));
        }
        member_len = find_size_subfield(&data[pos..pos + xlen]);
        pos += xlen;
    }

    let filename = if flags & FNAME != 0 {
        let (s, next) = read_cstring(data, pos)?;
        pos = next;
        Some(s)
    } else {
        None
    };

    let comment = if flags & FCOMMENT != 0 {
        let (s, next) = read_cstring(data, pos)?;
        pos = next;
        Some(s)
    } else {
        None
    };

    if flags & FHCRC != 0 {
        if pos + 2 > data.len() {
            return Err(PargzError::truncated("header ends inside FHCRC"));
        }
        let stored = u16::from_le_bytes([data[pos], data[pos + 1]]);
        let actual = (crc32fast::hash(&data[..pos]) & 0xffff) as u16;
        if stored != actual {
            return Err(PargzError::integrity(format!(
                "header CRC16 mismatch: stored {:#06x}, computed {:#06x}",
                stored, actual
            )));
        }
        pos += 2;
    }

    if pos >= data.len() {
        return Err(PargzError::truncated("no deflate data after gzip header"));
    }

    Ok(ParsedHeader {
        data_start: pos,
        info: GzipHeaderInfo {
            filename,
            mtime,
            comment,
        },
        member_len,
    })
}

/// Scan an FEXTRA block for our member-length subfield.
fn find_size_subfield(extra: &[u8]) -> Option<u32> {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = [extra[pos], extra[pos + 1]];
        let len = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let body = pos + 4;
        if body + len > extra.len() {
            return None;
        }
        if id == SIZE_SUBFIELD_ID && len == 4 {
            let b = &extra[body..body + 4];
            let size = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            if size > 0 {
                return Some(size);
            }
        }
        pos = body + len;
    }
    None
}

fn read_cstring(data: &[u8], start: usize) -> PargzResult<(String, usize)> {
    match memchr::memchr(0, &data[start..]) {
        Some(rel) => {
            let raw = &data[start..start + rel];
            // FNAME/FCOMMENT are Latin-1 per the RFC; lossy is fine for display.
            Ok((String::from_utf8_lossy(raw).into_owned(), start + rel + 1))
        }
        None => Err(PargzError::truncated("unterminated header string field")),
    }
}
