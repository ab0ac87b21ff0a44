//! Reliable full-buffer transfer and message framing over a stream

use log::{debug, trace};
use std::io::{self, ErrorKind, Read, Write};

use super::message::{Message, RawHeader, HEADER_FIXED_LEN};
use crate::error::{ChatError, Result};

/// Write all of `buf`, retrying interrupted calls.
///
/// Stops at the first other failure. Returns the number of bytes written;
/// anything short of `buf.len()` means the transfer failed.
pub fn reliable_write<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> usize {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("write stopped after {} of {} bytes: {}", written, buf.len(), e);
                break;
            }
        }
    }
    written
}

/// Fill `buf`, retrying interrupted calls.
///
/// Stops at end-of-stream or the first other failure and returns the number
/// of bytes read.
pub fn reliable_read<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> usize {
    read_full(reader, buf).0
}

/// Fill `buf` like [`reliable_read`], also returning the error that cut the
/// transfer short. A short count with no error means end-of-stream.
pub fn read_full<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> (usize, Option<io::Error>) {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("read stopped after {} of {} bytes: {}", read, buf.len(), e);
                return (read, Some(e));
            }
        }
    }
    (read, None)
}

/// Write an already encoded frame in one logical call.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, frame: &[u8]) -> Result<()> {
    let written = reliable_write(writer, frame);
    if written != frame.len() {
        return Err(ChatError::ShortWrite {
            expected: frame.len(),
            written,
        });
    }
    Ok(())
}

/// Write header and payload of `msg`.
pub fn write_message<W: Write + ?Sized>(writer: &mut W, msg: &Message) -> Result<()> {
    write_frame(writer, &msg.encode())
}

/// Read exactly one message.
///
/// `Ok(None)` means the peer closed the stream cleanly before a new header
/// started. A truncated header or body is a framing error, and lengths over
/// the protocol limits are rejected before any further read.
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Message>> {
    let mut fixed = [0u8; HEADER_FIXED_LEN];
    match read_full(reader, &mut fixed) {
        (0, None) => return Ok(None),
        transfer => expect_full("header", transfer, HEADER_FIXED_LEN)?,
    }

    let raw = RawHeader::decode(&fixed);
    raw.validate()?;

    let target = if raw.target_len > 0 {
        let mut target = vec![0u8; raw.target_len as usize];
        expect_full("target", read_full(reader, &mut target), target.len())?;
        Some(decode_target(target)?)
    } else {
        None
    };

    let mut payload = vec![0u8; raw.msg_len as usize];
    expect_full("payload", read_full(reader, &mut payload), payload.len())?;

    trace!("read message: {} payload bytes", payload.len());
    Message::from_parts(target, payload, raw.time_stamp).map(Some)
}

/// A failed read is an I/O error; running out of stream mid-part is a
/// framing error.
fn expect_full(part: &str, transfer: (usize, Option<io::Error>), wanted: usize) -> Result<()> {
    match transfer {
        (_, Some(e)) => Err(ChatError::Io(e)),
        (n, None) if n < wanted => Err(ChatError::Framing(format!(
            "short {}: {} of {} bytes",
            part, n, wanted
        ))),
        _ => Ok(()),
    }
}

fn decode_target(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|_| ChatError::Framing("target is not valid UTF-8".to_string()))
}

/// Reassembles frames from a stream that delivers them in arbitrary pieces
///
/// Bytes are appended as they arrive and complete messages are taken off
/// the front. A header is validated as soon as it is complete, so the
/// buffer never holds more than one maximum-size frame plus one read.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes of a frame still waiting for the rest of it
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete message off the buffer, if one has arrived.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < HEADER_FIXED_LEN {
            return Ok(None);
        }

        let mut fixed = [0u8; HEADER_FIXED_LEN];
        fixed.copy_from_slice(&self.buf[..HEADER_FIXED_LEN]);
        let raw = RawHeader::decode(&fixed);
        raw.validate()?;

        let frame_len = raw.frame_len();
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let target_end = HEADER_FIXED_LEN + raw.target_len as usize;
        let target = if raw.target_len > 0 {
            Some(decode_target(self.buf[HEADER_FIXED_LEN..target_end].to_vec())?)
        } else {
            None
        };
        let payload = self.buf[target_end..frame_len].to_vec();
        self.buf.drain(..frame_len);

        trace!("reassembled message: {} payload bytes", payload.len());
        Message::from_parts(target, payload, raw.time_stamp).map(Some)
    }
}
