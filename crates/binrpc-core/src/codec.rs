//! Length-prefixed binary framing
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! 0x02 | frame_len | msg_id_len | msg_id | method_len | method
//!      | err_code  | err_info_len | err_info | payload_len | payload
//!      | checksum  | 0x03
//! ```
//!
//! `frame_len` counts the whole frame including both markers. The
//! checksum is FNV-1a (32-bit) over every byte from the start marker up
//! to, but not including, the checksum field. Decoding is resumable: a
//! partial frame stays in the buffer until more bytes arrive.

use thiserror::Error;
use tracing::trace;

use crate::buffer::Buffer;
use crate::message::{RpcMessage, FRAME_END, FRAME_START};

/// Fixed bytes per frame: markers, five length/code fields, checksum.
const FRAME_OVERHEAD: usize = 30;

/// Upper bound on a single frame, guards against hostile lengths.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a, 32-bit.
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing start marker, dropped {dropped} bytes")]
    BadStartMarker { dropped: usize },
    #[error("frame length {0} out of range")]
    BadFrameLength(i32),
    #[error("missing end marker")]
    BadEndMarker,
    #[error("field length {length} overruns frame of {frame_len} bytes")]
    FieldOverrun { length: i32, frame_len: usize },
    #[error("field lengths do not add up to the frame length")]
    LengthMismatch,
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("{field} is not valid utf-8")]
    InvalidUtf8 { field: &'static str },
}

/// Stateless encoder/decoder for the frame layout above.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec
    }

    /// Append one frame per message to `out`.
    pub fn encode(&self, messages: &[RpcMessage], out: &mut Buffer) -> Result<(), EncodeError> {
        for msg in messages {
            self.encode_one(msg, out)?;
        }
        Ok(())
    }

    fn encode_one(&self, msg: &RpcMessage, out: &mut Buffer) -> Result<(), EncodeError> {
        let frame_len = FRAME_OVERHEAD
            + msg.msg_id.len()
            + msg.method.len()
            + msg.err_info.len()
            + msg.payload.len();
        if frame_len > MAX_FRAME_LEN {
            return Err(EncodeError::FrameTooLarge(frame_len));
        }

        let mut frame = Vec::with_capacity(frame_len);
        frame.push(FRAME_START);
        frame.extend_from_slice(&(frame_len as i32).to_be_bytes());
        frame.extend_from_slice(&(msg.msg_id.len() as i32).to_be_bytes());
        frame.extend_from_slice(msg.msg_id.as_bytes());
        frame.extend_from_slice(&(msg.method.len() as i32).to_be_bytes());
        frame.extend_from_slice(msg.method.as_bytes());
        frame.extend_from_slice(&msg.err_code.to_be_bytes());
        frame.extend_from_slice(&(msg.err_info.len() as i32).to_be_bytes());
        frame.extend_from_slice(msg.err_info.as_bytes());
        frame.extend_from_slice(&(msg.payload.len() as i32).to_be_bytes());
        frame.extend_from_slice(&msg.payload);
        let sum = checksum(&frame);
        frame.extend_from_slice(&(sum as i32).to_be_bytes());
        frame.push(FRAME_END);
        debug_assert_eq!(frame.len(), frame_len);

        out.append(&frame);
        trace!(msg_id = %msg.msg_id, method = %msg.method, frame_len, "encoded frame");
        Ok(())
    }

    /// Consume every complete frame from `buf`.
    ///
    /// Malformed frames are discarded and reported in the second half of
    /// the result; decoding then resumes at the next start marker. A
    /// trailing partial frame is left in the buffer untouched.
    pub fn decode(&self, buf: &mut Buffer) -> (Vec<RpcMessage>, Vec<DecodeError>) {
        let mut messages = Vec::new();
        let mut errors = Vec::new();

        loop {
            let unread = buf.readable();
            if unread == 0 {
                break;
            }

            if buf.as_slice()[0] != FRAME_START {
                // Resync at the next start marker, drop the junk prefix.
                match buf.as_slice()[1..].iter().position(|&b| b == FRAME_START) {
                    Some(pos) => {
                        buf.retrieve(pos + 1);
                        errors.push(DecodeError::BadStartMarker { dropped: pos + 1 });
                        continue;
                    }
                    None => {
                        buf.retrieve_all();
                        errors.push(DecodeError::BadStartMarker { dropped: unread });
                        break;
                    }
                }
            }

            // Need the marker plus the length field before anything else.
            let Some(frame_len) = buf.peek_i32_at(1) else {
                break;
            };
            if frame_len < FRAME_OVERHEAD as i32 || frame_len as usize > MAX_FRAME_LEN {
                errors.push(DecodeError::BadFrameLength(frame_len));
                buf.retrieve(1);
                continue;
            }
            let frame_len = frame_len as usize;
            if unread < frame_len {
                // Partial frame, wait for more bytes.
                break;
            }

            match parse_frame(&buf.as_slice()[..frame_len]) {
                Ok(msg) => {
                    buf.retrieve(frame_len);
                    messages.push(msg);
                }
                Err(DecodeError::BadEndMarker) => {
                    // The length field cannot be trusted either, rescan.
                    errors.push(DecodeError::BadEndMarker);
                    buf.retrieve(1);
                }
                Err(err) => {
                    errors.push(err);
                    buf.retrieve(frame_len);
                }
            }
        }

        (messages, errors)
    }
}

struct Cursor<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self
            .frame
            .get(self.pos..self.pos + 4)
            .ok_or(DecodeError::LengthMismatch)?;
        self.pos += 4;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, len: i32) -> Result<&'a [u8], DecodeError> {
        if len < 0 {
            return Err(DecodeError::FieldOverrun {
                length: len,
                frame_len: self.frame.len(),
            });
        }
        let end = self.pos.checked_add(len as usize).filter(|&e| e <= self.frame.len());
        let end = end.ok_or(DecodeError::FieldOverrun {
            length: len,
            frame_len: self.frame.len(),
        })?;
        let bytes = &self.frame[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_string(&mut self, len: i32, field: &'static str) -> Result<String, DecodeError> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { field })
    }
}

/// Parse one frame of exactly `frame_len` bytes, markers included.
fn parse_frame(frame: &[u8]) -> Result<RpcMessage, DecodeError> {
    // End marker first: if it is wrong the length field is suspect too.
    if frame[frame.len() - 1] != FRAME_END {
        return Err(DecodeError::BadEndMarker);
    }

    let mut cur = Cursor { frame, pos: 5 };
    let msg_id_len = cur.read_i32()?;
    let msg_id = cur.read_string(msg_id_len, "msg_id")?;
    let method_len = cur.read_i32()?;
    let method = cur.read_string(method_len, "method")?;
    let err_code = cur.read_i32()?;
    let err_info_len = cur.read_i32()?;
    let err_info = cur.read_string(err_info_len, "err_info")?;
    let payload_len = cur.read_i32()?;
    let payload = cur.read_bytes(payload_len)?.to_vec();

    // Exactly the checksum and end marker must remain.
    let checksum_at = frame.len() - 5;
    if cur.pos != checksum_at {
        return Err(DecodeError::LengthMismatch);
    }
    let stored = u32::from_be_bytes([
        frame[checksum_at],
        frame[checksum_at + 1],
        frame[checksum_at + 2],
        frame[checksum_at + 3],
    ]);
    let computed = checksum(&frame[..checksum_at]);
    if stored != computed {
        return Err(DecodeError::ChecksumMismatch { stored, computed });
    }

    Ok(RpcMessage {
        msg_id,
        method,
        err_code,
        err_info,
        payload,
    })
}
