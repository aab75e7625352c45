//! Token-to-chunk buffering between the LLM and TTS
//!
//! Accumulates streamed tokens and decides when a chunk is worth pushing to
//! the synthesizer. Strictly push-only and owned by a single orchestrator
//! run; a fresh coordinator is built per turn.
//!
//! Flush rules, evaluated on every incoming token:
//! 1. buffered length ≥ `chunk_size`
//! 2. buffer ends at a sentence boundary (`.`, `!`, `?`)
//! 3. buffer longer than 100 chars and ends with `,`
//! 4. once at end of stream, whatever remains

/// Length past which a trailing comma is a good enough break point
const CLAUSE_FLUSH_LEN: usize = 100;

#[derive(Debug)]
pub struct StreamCoordinator {
    chunk_size: usize,
    buffer: String,
    finished: bool,
}

impl StreamCoordinator {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            buffer: String::new(),
            finished: false,
        }
    }

    /// Add one token; returns a chunk when one of the flush rules fires.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.buffer.push_str(token);

        if self.buffer.len() >= self.chunk_size {
            return Some(self.take());
        }

        let trimmed = self.buffer.trim_end();
        if trimmed.ends_with(['.', '!', '?']) {
            return Some(self.take());
        }
        if self.buffer.len() > CLAUSE_FLUSH_LEN && trimmed.ends_with(',') {
            return Some(self.take());
        }

        None
    }

    /// End of stream: flush whatever remains, exactly once.
    pub fn finish(&mut self) -> Option<String> {
        if self.finished || self.buffer.is_empty() {
            return None;
        }
        self.finished = true;
        Some(self.take())
    }

    /// Bytes currently buffered
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn take(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}
