use crate::error::HubError;

use super::MAX_FRAME_BYTES;

/// Direction-agnostic newline-delimited frame buffer.
///
/// Bytes are pushed in whatever chunks the underlying stream produces; the
/// codec emits each complete `\n`-terminated line (trimmed, blank lines
/// skipped) and retains the trailing unterminated fragment for the next
/// chunk. An unterminated fragment at EOF is discarded by dropping the
/// codec.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: Vec<u8>,
    limit: usize,
    poisoned: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            poisoned: false,
        }
    }

    /// Feeds one chunk and returns every frame it completed.
    ///
    /// A frame (or retained fragment) growing past the limit poisons the
    /// codec: the stream is corrupt beyond recovery and every later push
    /// fails with the same error.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, HubError> {
        if self.poisoned {
            return Err(HubError::FrameTooLarge { limit: self.limit });
        }

        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if line.len() > self.limit {
                self.poisoned = true;
                return Err(HubError::FrameTooLarge { limit: self.limit });
            }
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                frames.push(trimmed.to_string());
            }
        }

        if self.buffer.len() > self.limit {
            self.poisoned = true;
            return Err(HubError::FrameTooLarge { limit: self.limit });
        }

        Ok(frames)
    }
}
