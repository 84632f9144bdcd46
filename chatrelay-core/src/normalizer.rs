use crate::model::ChatMessage;
use unicode_normalization::UnicodeNormalization;

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t
}

fn clamp_round_f32(x: f32, lo: f32, hi: f32, dp: u32) -> f32 {
    let clamped = x.clamp(lo, hi);
    let p = 10f32.powi(dp as i32);
    (clamped * p).round() / p
}

/// Clean inbound message text before it is forwarded upstream. Surrounding
/// whitespace is kept; pasted code depends on it.
pub fn normalize_messages(mut messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    for msg in &mut messages {
        msg.content = clean_text(&msg.content);
    }
    messages
}

/// Like message cleaning, plus a trim: an all-blank prompt comes out empty.
pub fn normalize_prompt(prompt: &str) -> String {
    clean_text(prompt).trim().to_string()
}

/// Clamp to the 0..=2 range OpenAI-compatible upstreams accept.
pub fn normalize_temperature(t: Option<f32>) -> Option<f32> {
    t.filter(|t| t.is_finite()).map(|t| clamp_round_f32(t, 0.0, 2.0, 3))
}
