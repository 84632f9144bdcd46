//! Segmentation of completion text into alternating text and code blocks.
//!
//! Recognized, in priority order at each position:
//! - a fenced block: three backticks, an optional language token followed by a
//!   newline, then everything up to the first closing three backticks;
//! - an inline span: one backtick, at least one non-backtick character
//!   (newlines included), one closing backtick.
//!
//! The scanner never fails. An unterminated fence falls back into text, and
//! scanning resumes right after its first backtick with fences disabled, since
//! no later fence could find a closing delimiter either.

use serde::{Deserialize, Serialize};

use crate::buffer::ContentBuffer;
use crate::model::ChatCompletionChunk;

/// Language reported for inline code spans.
pub const INLINE_LANGUAGE: &str = "plaintext";

const FENCE: &[u8] = b"```";
const TICK: u8 = b'`';

/// One output unit of the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Block {
    Text {
        content: String,
    },
    Code {
        inline: bool,
        language: String,
        code: String,
    },
}

impl Block {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn inline_code(code: impl Into<String>) -> Self {
        Self::Code {
            inline: true,
            language: INLINE_LANGUAGE.to_string(),
            code: code.into(),
        }
    }

    pub fn fenced(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Code {
            inline: false,
            language: language.into(),
            code: code.into(),
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self, Self::Code { .. })
    }
}

/// Batch mode: segment a complete string.
pub fn parse_blocks(text: &str) -> Vec<Block> {
    Scanner::new(text).run()
}

/// Stream-accumulation mode: concatenate every chunk's delta content in
/// arrival order, then segment the assembled buffer.
pub fn parse_chunks(chunks: &[ChatCompletionChunk]) -> Vec<Block> {
    let mut buf = ContentBuffer::new();
    for chunk in chunks {
        buf.push_chunk(chunk);
    }
    buf.finish()
}

/// Re-insert the delimiters and join the blocks back into source text.
/// For blocks produced by [`parse_blocks`] this is the exact input.
pub fn to_markdown(blocks: &[Block]) -> String {
    let mut out = String::new();
    for b in blocks {
        write_block(&mut out, b);
    }
    out
}

pub(crate) fn write_block(out: &mut String, block: &Block) {
    match block {
        Block::Text { content } => out.push_str(content),
        Block::Code {
            inline: true, code, ..
        } => {
            out.push('`');
            out.push_str(code);
            out.push('`');
        }
        Block::Code {
            inline: false,
            language,
            code,
        } => {
            out.push_str("```");
            if !language.is_empty() {
                out.push_str(language);
                out.push('\n');
            }
            out.push_str(code);
            out.push_str("```");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Outside,
    /// A fence opened at `open`; its body starts at `body`.
    InFence {
        open: usize,
        language: Option<(usize, usize)>,
        body: usize,
    },
}

struct Scanner<'a> {
    src: &'a str,
    blocks: Vec<Block>,
    /// End of the last match; text before it has been emitted.
    last: usize,
    fences: bool,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            blocks: Vec::new(),
            last: 0,
            fences: true,
        }
    }

    fn run(mut self) -> Vec<Block> {
        let src = self.src;
        let bytes = src.as_bytes();
        let mut pos = 0;
        let mut state = State::Outside;

        loop {
            match state {
                State::Outside => {
                    let Some(i) = find_byte(bytes, TICK, pos) else {
                        break;
                    };
                    if self.fences && bytes[i..].starts_with(FENCE) {
                        let (language, body) = fence_header(bytes, i + FENCE.len());
                        state = State::InFence {
                            open: i,
                            language,
                            body,
                        };
                        pos = body;
                    } else if let Some(close) = inline_close(bytes, i) {
                        self.flush_text(i);
                        self.blocks.push(Block::inline_code(&src[i + 1..close]));
                        self.last = close + 1;
                        pos = self.last;
                    } else {
                        pos = i + 1;
                    }
                }
                State::InFence {
                    open,
                    language,
                    body,
                } => {
                    match find_fence(bytes, pos) {
                        Some(close) => {
                            self.flush_text(open);
                            let language = language
                                .map(|(s, e)| src[s..e].to_string())
                                .unwrap_or_default();
                            self.blocks.push(Block::fenced(language, &src[body..close]));
                            self.last = close + FENCE.len();
                            pos = self.last;
                        }
                        None => {
                            self.fences = false;
                            pos = open + 1;
                        }
                    }
                    state = State::Outside;
                }
            }
        }

        self.flush_text(src.len());
        self.blocks
    }

    fn flush_text(&mut self, end: usize) {
        if self.last < end {
            self.blocks.push(Block::text(&self.src[self.last..end]));
        }
    }
}

fn is_tag_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Parse `lang\n` right after an opening fence. Returns the tag span (if any)
/// and the offset where the body starts.
fn fence_header(bytes: &[u8], start: usize) -> (Option<(usize, usize)>, usize) {
    let mut j = start;
    while j < bytes.len() && is_tag_byte(bytes[j]) {
        j += 1;
    }
    if j > start && bytes.get(j) == Some(&b'\n') {
        (Some((start, j)), j + 1)
    } else {
        (None, start)
    }
}

fn inline_close(bytes: &[u8], open: usize) -> Option<usize> {
    match bytes.get(open + 1) {
        Some(&b) if b != TICK => find_byte(bytes, TICK, open + 2),
        _ => None,
    }
}

fn find_byte(bytes: &[u8], needle: u8, from: usize) -> Option<usize> {
    bytes
        .get(from..)?
        .iter()
        .position(|&b| b == needle)
        .map(|p| p + from)
}

fn find_fence(bytes: &[u8], from: usize) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(FENCE.len())
        .position(|w| w == FENCE)
        .map(|p| p + from)
}
