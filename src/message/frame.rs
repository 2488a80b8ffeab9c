//! Splitting of raw notification buffers into protocol frames.
//!
//! The frame format is:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 1        | A constant magic marker with value [0xAA, 0x02]
//! 2          | 3        | The payload length `n`, little endian
//! 4          | 17       | Header fields, see [`crate::message::packet`]
//! 18         | 17 + n   | The payload, XOR masked with header byte 6
//!
//! A single notification can carry any number of frames back to back.

use tracing::debug;

use crate::error::FrameError;

pub const MAGIC: [u8; 2] = [0xAA, 0x02];
pub const HEADER_LEN: usize = 18;
pub const KEY_OFFSET: usize = 6;

/// A complete frame borrowed from a notification buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    bytes: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn header(&self) -> &'a [u8] {
        &self.bytes[..HEADER_LEN]
    }

    /// The still-masked payload region.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_LEN..]
    }

    pub fn declared_len(&self) -> usize {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]]) as usize
    }

    /// The byte every payload byte is XORed with.
    pub fn key(&self) -> u8 {
        self.bytes[KEY_OFFSET]
    }
}

/// Iterator over the frames in one notification.
///
/// Stops at the first position that does not start with [`MAGIC`]; whatever
/// follows is dropped. A frame whose declared length runs past the end of the
/// buffer yields a single [`FrameError::MalformedFrame`] and ends the iteration.
pub struct FrameSplitter<'a> {
    remaining: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> FrameSplitter<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            remaining: buffer,
            offset: 0,
            done: false,
        }
    }

    fn fail(&mut self, reason: &'static str) -> Option<Result<Frame<'a>, FrameError>> {
        self.done = true;
        Some(Err(FrameError::MalformedFrame {
            offset: self.offset,
            reason,
        }))
    }
}

impl<'a> Iterator for FrameSplitter<'a> {
    type Item = Result<Frame<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let buffer = self.remaining;
        if buffer.len() < MAGIC.len() || buffer[..MAGIC.len()] != MAGIC {
            self.done = true;
            if !buffer.is_empty() {
                debug!(
                    "Dropping {} trailing bytes at offset {}: 0x{}",
                    buffer.len(),
                    self.offset,
                    hex::encode(buffer)
                );
            }
            return None;
        }

        if buffer.len() < 4 {
            return self.fail("length field truncated");
        }

        let frame_len = HEADER_LEN + u16::from_le_bytes([buffer[2], buffer[3]]) as usize;
        if buffer.len() < frame_len {
            return self.fail("declared length exceeds buffer");
        }

        let frame = Frame {
            bytes: &buffer[..frame_len],
        };

        if buffer.len() <= frame_len {
            self.done = true;
        } else {
            self.remaining = &buffer[frame_len..];
            self.offset += frame_len;
        }

        Some(Ok(frame))
    }
}

/// Split a notification buffer into frames.
pub fn split(buffer: &[u8]) -> FrameSplitter<'_> {
    FrameSplitter::new(buffer)
}

#[cfg(test)]
fn frame_with_payload(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN];
    frame[..2].copy_from_slice(&MAGIC);
    frame[2..4].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[test]
fn test_split_single_frame() {
    let buffer = hex::decode("aa0203000000000000000000000000000000020304").unwrap();
    let frames: Vec<_> = split(&buffer).collect::<Result<_, _>>().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_bytes(), &buffer[..]);
    assert_eq!(frames[0].declared_len(), 3);
    assert_eq!(frames[0].payload(), &[0x02, 0x03, 0x04]);
}

#[test]
fn test_split_preserves_order_and_bytes() {
    for k in 0..5usize {
        let parts: Vec<Vec<u8>> = (0..k)
            .map(|i| frame_with_payload(&vec![i as u8; i * 7]))
            .collect();
        let buffer = parts.concat();

        let frames: Vec<_> = split(&buffer).collect::<Result<_, _>>().unwrap();

        assert_eq!(frames.len(), k);
        for (frame, part) in frames.iter().zip(&parts) {
            assert_eq!(frame.as_bytes(), &part[..]);
        }
    }
}

#[test]
fn test_split_drops_trailing_garbage() {
    let mut buffer = frame_with_payload(&[1, 2, 3]);
    buffer.extend(frame_with_payload(&[4, 5]));
    buffer.extend([0xde, 0xad, 0xbe]);

    let frames: Vec<_> = split(&buffer).collect::<Result<_, _>>().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].payload(), &[4, 5]);
}

#[test]
fn test_split_no_magic() {
    let buffer = hex::decode("0103180000").unwrap();
    assert_eq!(split(&buffer).count(), 0);
    assert_eq!(split(&[]).count(), 0);
    assert_eq!(split(&[0xaa]).count(), 0);
}

#[test]
fn test_split_declared_length_exceeds_buffer() {
    let mut buffer = frame_with_payload(&[1, 2, 3]);
    let mut truncated = frame_with_payload(&[9; 10]);
    truncated.truncate(HEADER_LEN + 4);
    buffer.extend(&truncated);

    let results: Vec<_> = split(&buffer).collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert_eq!(
        results[1],
        Err(FrameError::MalformedFrame {
            offset: HEADER_LEN + 3,
            reason: "declared length exceeds buffer"
        })
    );
}

#[test]
fn test_split_truncated_length_field() {
    let results: Vec<_> = split(&[0xaa, 0x02, 0x05]).collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(FrameError::MalformedFrame { offset: 0, .. })));
}
