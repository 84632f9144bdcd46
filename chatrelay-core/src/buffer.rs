use crate::blocks::{Block, parse_blocks};
use crate::model::{ChatCompletionChunk, StopReason};

/// Accumulated delta content for one response.
///
/// Chunks are appended in arrival order. Segmentation only happens in
/// [`ContentBuffer::finish`], once the whole reply is in.
#[derive(Debug, Default, Clone)]
pub struct ContentBuffer {
    content: String,
    chunks: usize,
    stop_reason: Option<StopReason>,
}

impl ContentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the primary choice's delta. A delta without content adds nothing.
    pub fn push_chunk(&mut self, chunk: &ChatCompletionChunk) {
        self.chunks += 1;
        if let Some(text) = chunk.primary_content() {
            self.content.push_str(text);
        }
        if let Some(reason) = chunk.stop_reason() {
            self.stop_reason = Some(reason);
        }
    }

    pub fn push_str(&mut self, fragment: &str) {
        self.content.push_str(fragment);
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Segment the assembled buffer and drop it.
    pub fn finish(self) -> Vec<Block> {
        parse_blocks(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkChoice, Delta};

    fn chunk(content: Option<&str>, finish: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: content.map(str::to_string),
                },
                finish_reason: finish.map(str::to_string),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn accumulates_in_arrival_order() {
        let mut buf = ContentBuffer::new();
        buf.push_chunk(&chunk(Some("a"), None));
        buf.push_chunk(&chunk(Some("b"), None));
        buf.push_str("c");
        assert_eq!(buf.as_str(), "abc");
        assert_eq!(buf.chunk_count(), 2);
    }

    #[test]
    fn records_stop_reason_and_skips_empty_deltas() {
        let mut buf = ContentBuffer::new();
        buf.push_chunk(&chunk(None, None));
        buf.push_chunk(&chunk(Some("x"), None));
        buf.push_chunk(&chunk(None, Some("length")));
        assert_eq!(buf.as_str(), "x");
        assert_eq!(buf.stop_reason(), Some(StopReason::Length));
    }

    #[test]
    fn chunk_without_choices_counts_but_adds_nothing() {
        let mut buf = ContentBuffer::new();
        buf.push_chunk(&ChatCompletionChunk::default());
        assert!(buf.as_str().is_empty());
        assert_eq!(buf.chunk_count(), 1);
        assert!(buf.finish().is_empty());
    }
}
