//! Length-prefixed framing over TCP streams.
//!
//! ```text
//! ┌────────────┬────────┬──────────────────────┐
//! │ Len(4, LE) │ Tag(1) │ postcard body        │
//! └────────────┴────────┴──────────────────────┘
//! ```
//!
//! `Len` counts the tag and the body.

use thiserror::Error;

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("malformed body: {0}")]
    Body(#[from] postcard::Error),
}

/// Patches the length prefix of a frame written at `start`.
///
/// The caller reserved [`LEN_PREFIX`] bytes at `start` before writing the
/// frame contents.
pub(crate) fn seal(out: &mut Vec<u8>, start: usize) -> Result<(), FrameError> {
    let len = out.len() - start - LEN_PREFIX;
    if len > MAX_FRAME_LEN {
        out.truncate(start);
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    out[start..start + LEN_PREFIX].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(())
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Start of unconsumed data.
    read: usize,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        if self.read > 0 {
            self.buf.drain(..self.read);
            self.read = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame (tag and body), if buffered.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Empty`] or [`FrameError::TooLarge`] on a corrupt
    /// length prefix. The stream cannot be resynchronized after that.
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>, FrameError> {
        let available = &self.buf[self.read..];
        if available.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&available[..LEN_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len == 0 {
            return Err(FrameError::Empty);
        }
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if available.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let begin = self.read + LEN_PREFIX;
        self.read = begin + len;
        Ok(Some(&self.buf[begin..begin + len]))
    }

    /// Bytes buffered but not yet returned as frames.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len() - self.read
    }
}
