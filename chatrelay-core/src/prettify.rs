//! Pull one fenced block out of a reply, pretty-print it, and split the
//! surrounding prose around it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::blocks::{Block, parse_blocks, write_block};

const INDENT: &str = "  ";

// `[1]: https://example.com "Title"`, one per line, title optional.
static REF_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*\[(\d{1,9})\]:\s*(\S+)(?:\s+"([^"]*)")?\s*$"#)
        .expect("reference link pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefLink {
    pub id: u32,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prettified {
    /// Pretty-printed body of the first matching fenced block.
    pub code: Option<String>,
    pub links: Vec<RefLink>,
    pub before: String,
    pub after: String,
}

/// Everything ahead of the target block lands in `before`, everything after
/// it in `after`. Reference links are only lifted out of prose.
pub fn prettify(text: &str, language: &str) -> Prettified {
    let blocks = parse_blocks(text);
    let target = blocks.iter().position(|b| match b {
        Block::Code {
            inline: false,
            language: l,
            ..
        } => l.eq_ignore_ascii_case(language),
        _ => false,
    });

    let mut out = Prettified {
        code: None,
        links: Vec::new(),
        before: String::with_capacity(text.len()),
        after: String::new(),
    };
    let mut line_start = true;
    for (i, block) in blocks.iter().enumerate() {
        let dest = if out.code.is_some() {
            &mut out.after
        } else {
            &mut out.before
        };
        match block {
            Block::Code { code, .. } if Some(i) == target => {
                out.code = Some(pretty_print(language, code));
            }
            Block::Text { content } => {
                let line_end = i + 1 == blocks.len();
                dest.push_str(&strip_links(content, line_start, line_end, &mut out.links));
            }
            _ => write_block(dest, block),
        }
        line_start = match block {
            Block::Text { content } if content.is_empty() => line_start,
            Block::Text { content } => content.ends_with('\n'),
            _ => false,
        };
    }
    out
}

/// Drop reference-link lines from one prose segment. The first and last
/// lines only count when they are whole lines of the full text.
fn strip_links(
    content: &str,
    line_start: bool,
    line_end: bool,
    links: &mut Vec<RefLink>,
) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let last = lines.len() - 1;
    let mut kept = Vec::with_capacity(lines.len());
    for (i, line) in lines.into_iter().enumerate() {
        let whole = (i > 0 || line_start) && (i < last || line_end);
        match whole.then(|| ref_link(line)).flatten() {
            Some(link) => links.push(link),
            None => kept.push(line),
        }
    }
    kept.join("\n")
}

fn ref_link(line: &str) -> Option<RefLink> {
    let c = REF_LINK.captures(line)?;
    Some(RefLink {
        id: c.get(1)?.as_str().parse().ok()?,
        url: c.get(2)?.as_str().to_string(),
        title: c.get(3).map(|t| t.as_str().to_string()),
    })
}

/// JSON goes through serde_json; everything else through [`reindent`].
pub fn pretty_print(language: &str, code: &str) -> String {
    if language.eq_ignore_ascii_case("json") {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(code)
            && let Ok(pretty) = serde_json::to_string_pretty(&v)
        {
            return pretty;
        }
        tracing::debug!("json block did not parse; falling back to reindent");
    }
    reindent(code)
}

/// Brace/semicolon re-indenter for C-like code. Each `{` opens a level,
/// each `}` starts a new line one level out, and `;` outside parentheses
/// ends a line. Quoted strings are copied as-is.
pub fn reindent(code: &str) -> String {
    let mut ind = Indenter::default();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in code.chars() {
        if let Some(q) = quote {
            ind.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => {
                ind.push(c);
                quote = Some(c);
            }
            '{' => {
                ind.push(c);
                ind.flush();
                ind.depth += 1;
            }
            '}' => {
                ind.flush();
                ind.depth = ind.depth.saturating_sub(1);
                ind.push(c);
            }
            '(' => {
                ind.parens += 1;
                ind.push(c);
            }
            ')' => {
                ind.parens = ind.parens.saturating_sub(1);
                ind.push(c);
            }
            ';' if ind.parens == 0 => {
                ind.push(c);
                ind.flush();
            }
            '\n' => ind.flush(),
            c if c.is_whitespace() && ind.line.is_empty() => {}
            c => ind.push(c),
        }
    }
    ind.flush();
    ind.lines.join("\n")
}

#[derive(Default)]
struct Indenter {
    lines: Vec<String>,
    line: String,
    line_depth: usize,
    depth: usize,
    parens: usize,
}

impl Indenter {
    fn push(&mut self, c: char) {
        if self.line.is_empty() {
            self.line_depth = self.depth;
        }
        self.line.push(c);
    }

    fn flush(&mut self) {
        let l = self.line.trim_end();
        if !l.is_empty() {
            self.lines.push(format!("{}{}", INDENT.repeat(self.line_depth), l));
        }
        self.line.clear();
    }
}
