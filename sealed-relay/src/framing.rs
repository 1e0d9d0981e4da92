use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound for a single frame unless the caller picks another one.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024;

const DELIMITER: u8 = b'\n';

/// Newline-delimited framing for the relay's byte stream.
///
/// Frames are yielded without their delimiter (and without a trailing `\r`),
/// so a JSON document serialized by `serde_json` maps to exactly one frame.
/// Bytes are accumulated across reads: a single read may complete zero, one
/// or several frames. Frames are handed out as raw [`Bytes`] because the relay
/// forwards payloads it cannot parse.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    // Offset up to which the buffer has already been scanned for a delimiter.
    next_index: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        loop {
            let Some(offset) = src[self.next_index..]
                .iter()
                .position(|byte| *byte == DELIMITER)
            else {
                if src.len() > self.max_frame_len {
                    return Err(frame_too_long(src.len(), self.max_frame_len));
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;

            if end > self.max_frame_len {
                return Err(frame_too_long(end, self.max_frame_len));
            }

            let mut line = src.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }

            if line.is_empty() {
                continue;
            }
            return Ok(Some(line.freeze()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // A fragment without its delimiter was cut off mid-document.
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        if frame.len() > self.max_frame_len {
            return Err(frame_too_long(frame.len(), self.max_frame_len));
        }
        if frame.contains(&DELIMITER) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload contains a newline",
            ));
        }

        dst.reserve(frame.len() + 1);
        dst.put_slice(&frame);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

fn frame_too_long(len: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds the {max} byte limit"),
    )
}
