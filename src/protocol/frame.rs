use crate::protocol::codec::Encoding;
use crc32c::crc32c;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_BODY_BYTES: usize = 16 * 1024 * 1024;

// seq (8) + encoding (1) + crc (4)
const FRAME_OVERHEAD: usize = 8 + 1 + 4;

/// One message on a binary connection:
/// `len: u32 | seq: u64 | encoding: u8 | payload | crc32c: u32`, big endian,
/// with the checksum covering everything before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub encoding: Encoding,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame")]
    Corruption,
    #[error("unknown payload encoding {0}")]
    UnknownEncoding(u8),
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub struct FrameWriter<W: Write> {
    inner: W,
    next_seq: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, next_seq: 1 }
    }

    /// Writes one frame and returns its sequence number.
    pub fn write_frame(&mut self, encoding: Encoding, payload: &[u8]) -> Result<u64, FrameError> {
        let body_len = FRAME_OVERHEAD + payload.len();
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameError::TooLarge(body_len));
        }
        let frame_length = u32::try_from(body_len).map_err(|_| FrameError::TooLarge(body_len))?;
        let seq = self.next_seq;

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&frame_length.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.push(encoding.tag());
        buf.extend_from_slice(payload);
        let crc = crc32c(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());

        self.inner.write_all(&buf)?;
        self.next_seq += 1;
        Ok(seq)
    }

    pub fn flush(&mut self) -> Result<(), FrameError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// `Ok(None)` on a clean end of stream between frames.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut len_buf = [0u8; 4];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        read_exact(&mut self.inner, &mut len_buf[1..4])?;
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if body_len < FRAME_OVERHEAD {
            return Err(FrameError::Corruption);
        }
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameError::TooLarge(body_len));
        }

        let mut body = vec![0u8; body_len];
        read_exact(&mut self.inner, &mut body)?;

        let crc_offset = body_len - 4;
        let stored_crc = u32::from_be_bytes(
            body[crc_offset..]
                .try_into()
                .map_err(|_| FrameError::Corruption)?,
        );
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if crc32c(&crc_input) != stored_crc {
            return Err(FrameError::Corruption);
        }

        let seq = u64::from_be_bytes(body[0..8].try_into().map_err(|_| FrameError::Corruption)?);
        let encoding = Encoding::from_tag(body[8]).ok_or(FrameError::UnknownEncoding(body[8]))?;
        Ok(Some(Frame {
            seq,
            encoding,
            payload: body[9..crc_offset].to_vec(),
        }))
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Truncation),
        Err(e) => Err(FrameError::Io(e.to_string())),
    }
}
