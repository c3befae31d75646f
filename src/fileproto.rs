//! Wire format of the worker-to-worker file protocol (client role).
//!
//! Every message is framed by a 4-byte big-endian length. The request body
//! carries the database name, the file name (both length-prefixed) and the
//! send-content flag; the response body is a fixed 17-byte record with the
//! availability flag, size and mtime. When content was requested and the
//! file is available, the raw bytes follow the response until the server
//! closes the connection.

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

/// Length frame preceding every message.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub length: U32,
}

pub const FRAME_HEADER_SIZE: usize = size_of::<FrameHeader>();

/// Fixed-layout response body.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FileResponseFrame {
    pub available: u8,
    pub size: U64,
    pub mtime: U64,
}

/// Decoded file-open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub database: String,
    pub file: String,
    pub send_content: bool,
}

/// Decoded file-open response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileResponse {
    pub available: bool,
    pub size: u64,
    pub mtime: u64,
}

/// Encode a file-open request, including the outer length frame.
pub fn encode_request(database: &str, file: &str, send_content: bool) -> Vec<u8> {
    let body_len = 4 + database.len() + 4 + file.len() + 1;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body_len);
    out.extend_from_slice(FrameHeader { length: U32::new(body_len as u32) }.as_bytes());
    out.extend_from_slice(&(database.len() as u32).to_be_bytes());
    out.extend_from_slice(database.as_bytes());
    out.extend_from_slice(&(file.len() as u32).to_be_bytes());
    out.extend_from_slice(file.as_bytes());
    out.push(u8::from(send_content));
    out
}

/// Decode a request body (the bytes after the length frame).
pub fn decode_request(body: &[u8]) -> Result<FileRequest> {
    let (database, rest) = take_string(body)?;
    let (file, rest) = take_string(rest)?;
    match rest {
        [flag] => Ok(FileRequest { database, file, send_content: *flag != 0 }),
        _ => Err(malformed("request body has a bad trailer")),
    }
}

/// Encode a file-open response, including the outer length frame.
pub fn encode_response(response: &FileResponse) -> Vec<u8> {
    let frame = FileResponseFrame {
        available: u8::from(response.available),
        size: U64::new(response.size),
        mtime: U64::new(response.mtime),
    };
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + size_of::<FileResponseFrame>());
    out.extend_from_slice(
        FrameHeader { length: U32::new(size_of::<FileResponseFrame>() as u32) }.as_bytes(),
    );
    out.extend_from_slice(frame.as_bytes());
    out
}

/// Decode a response body (the bytes after the length frame).
pub fn decode_response(body: &[u8]) -> Result<FileResponse> {
    let frame = FileResponseFrame::read_from_bytes(body)
        .map_err(|_| malformed("response body has a bad size"))?;
    Ok(FileResponse {
        available: frame.available != 0,
        size: frame.size.get(),
        mtime: frame.mtime.get(),
    })
}

fn take_string(bytes: &[u8]) -> Result<(String, &[u8])> {
    if bytes.len() < 4 {
        return Err(malformed("truncated string length"));
    }
    let (len_bytes, rest) = bytes.split_at(4);
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if rest.len() < len {
        return Err(malformed("truncated string"));
    }
    let (text, rest) = rest.split_at(len);
    let text = simdutf8::basic::from_utf8(text).map_err(|_| malformed("non-UTF8 string"))?;
    Ok((text.to_string(), rest))
}

fn malformed(what: &str) -> Error {
    Error::FileServer(format!("malformed protocol frame: {what}"))
}
