//! Native-protocol frame reassembly.
//!
//! A frame is a fixed 9-byte header followed by a body whose length sits at
//! header offsets [5..9) as a big-endian u32. The proxy forwards frames
//! byte-for-byte, so this module only finds frame boundaries and exposes the
//! handful of header fields the mirror path inspects.

use bytes::{Bytes, BytesMut};

/// Fixed native-protocol header length.
pub const HEADER_LEN: usize = 9;
/// Largest body the protocol permits (256 MiB).
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;
/// Low bit of the flags byte marks a compressed body.
pub const FLAG_COMPRESSED: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame claims a {claimed} byte body, above the {MAX_BODY_LEN} byte cap")]
    Oversize { claimed: usize },
}

/// True when the direction bit marks this frame as a server reply.
pub fn is_reply(frame: &[u8]) -> bool {
    frame[0] >= 0x80
}

/// True when the compression flag is set.
pub fn is_compressed(frame: &[u8]) -> bool {
    frame[1] & FLAG_COMPRESSED != 0
}

/// Client-chosen correlation id, echoed by the server on the matching reply.
pub fn stream_id(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[2], frame[3]])
}

/// Frame opcode.
pub fn opcode(frame: &[u8]) -> u8 {
    frame[4]
}

/// Frame body, after the 9-byte header.
pub fn body(frame: &[u8]) -> &[u8] {
    &frame[HEADER_LEN..]
}

fn claimed_body_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize
}

/// Accumulates raw socket reads and peels complete frames off the front.
#[derive(Default)]
pub struct FrameAccumulator {
    buf: BytesMut,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer another chunk read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Peel the next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let body_len = claimed_body_len(&self.buf);
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::Oversize { claimed: body_len });
        }
        let total = HEADER_LEN + body_len;
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(opcode_byte: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x04, 0x00, 0x00, 0x01, opcode_byte];
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn output_concatenated_equals_input() {
        let input: Vec<u8> = [
            make_frame(0x07, b"first body"),
            make_frame(0x09, b""),
            make_frame(0x07, b"third"),
        ]
        .concat();

        // Feed the stream in awkward chunk sizes and collect emitted frames.
        let mut acc = FrameAccumulator::new();
        let mut emitted = Vec::new();
        for chunk in input.chunks(7) {
            acc.extend(chunk);
            while let Some(frame) = acc.next_frame().expect("well-formed stream") {
                assert_eq!(
                    frame.len(),
                    HEADER_LEN + claimed_body_len(&frame),
                    "frame length must match its header claim"
                );
                emitted.extend_from_slice(&frame);
            }
        }
        assert_eq!(emitted, input);
    }

    #[test]
    fn incomplete_header_and_body_wait_for_more_input() {
        let frame = make_frame(0x07, b"body bytes");

        let mut acc = FrameAccumulator::new();
        acc.extend(&frame[..5]);
        assert!(acc.next_frame().expect("no error").is_none());

        acc.extend(&frame[5..frame.len() - 1]);
        assert!(acc.next_frame().expect("no error").is_none());

        acc.extend(&frame[frame.len() - 1..]);
        let emitted = acc.next_frame().expect("no error").expect("complete frame");
        assert_eq!(emitted.as_ref(), frame.as_slice());
    }

    #[test]
    fn oversize_claim_is_an_error() {
        let mut header = vec![0x04, 0x00, 0x00, 0x01, 0x07];
        header.extend_from_slice(&((MAX_BODY_LEN as u32) + 1).to_be_bytes());

        let mut acc = FrameAccumulator::new();
        acc.extend(&header);
        assert!(matches!(
            acc.next_frame(),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn header_accessors() {
        let mut frame = make_frame(0x08, b"xy");
        frame[0] = 0x84;
        frame[1] = 0x01;
        assert!(is_reply(&frame));
        assert!(is_compressed(&frame));
        assert_eq!(stream_id(&frame), 1);
        assert_eq!(opcode(&frame), 0x08);
        assert_eq!(body(&frame), b"xy");
    }
}
