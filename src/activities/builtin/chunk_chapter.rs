use async_trait::async_trait;

use crate::activities::{Activity, ActivityContext, ActivityError, require_str};

/// Half- and full-width punctuation that must end a chunk rather than start
/// the next one.
const YIELD_LATER_CHARS: &str = "。？！!?;；:：,，、…";

pub const DEFAULT_LINES_PER_CHUNK: usize = 20;
pub const DEFAULT_TOKENS_PER_CHUNK: usize = 500;

/// Splits chapter text into reader-friendly chunks.
///
/// Pure wrapper around [`chunk_text`]; operates on the text recorded by the
/// previous step, so replays always reproduce the same chunks.
pub struct ChunkChapterActivity;

#[async_trait]
impl Activity for ChunkChapterActivity {
    fn name(&self) -> &str {
        "chunk_chapter"
    }

    fn description(&self) -> &str {
        "Split chapter text into chunks bounded by line and token budgets"
    }

    async fn execute(
        &self,
        input: &serde_json::Value,
        _ctx: ActivityContext,
    ) -> Result<serde_json::Value, ActivityError> {
        let text = require_str(input, "text")?;
        let lines_per_chunk = input
            .get("lines_per_chunk")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LINES_PER_CHUNK as u64) as usize;
        let tokens_per_chunk = input
            .get("tokens_per_chunk")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TOKENS_PER_CHUNK as u64) as usize;

        if lines_per_chunk == 0 || tokens_per_chunk == 0 {
            return Err(ActivityError::permanent(anyhow::anyhow!(
                "chunk budgets must be positive (lines: {}, tokens: {})",
                lines_per_chunk,
                tokens_per_chunk
            )));
        }

        let chunks = chunk_text(text, lines_per_chunk, tokens_per_chunk);

        Ok(serde_json::json!({
            "chunks": chunks,
            "chunk_count": chunks.len(),
        }))
    }
}

/// Split `content` into chunks that honor both a line budget and a token
/// budget, flushing only at safe boundaries.
///
/// A chunk is flushed once the running line count *and* token count have both
/// reached their budgets and the current character is a newline or strong
/// punctuation. A blank line forces an immediate flush and is itself
/// discarded. After a flush, trailing whitespace and punctuation are absorbed
/// into the finished chunk so the next one never starts with a non-meaning
/// character. All original newlines and punctuation survive in the output.
pub fn chunk_text(content: &str, lines_per_chunk: usize, tokens_per_chunk: usize) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = content.chars().collect();
    let mut out: Vec<String> = Vec::new();

    let mut buf = String::new();
    let mut line_count = 0usize;
    let mut token_count = 0usize;
    // Completed chunk still absorbing trailing non-meaning characters.
    let mut prev_chunk: Option<String> = None;

    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];

        if buf.is_empty() {
            if let Some(pending) = prev_chunk.as_mut() {
                if ch.is_whitespace() || is_yield_later(ch) {
                    pending.push(ch);
                    i += 1;
                    continue;
                }
                // First meaning character: the pending chunk is done.
                out.push(prev_chunk.take().unwrap());
            }
        }

        // Blank line: paragraph break, flush and discard the second newline.
        if ch == '\n' && i > 0 && chars[i - 1] == '\n' {
            flush(&mut buf, &mut line_count, &mut token_count, &mut prev_chunk);
            i += 1;
            continue;
        }

        buf.push(ch);
        if ch == '\n' {
            line_count += 1;
        }
        token_count += token_cost(ch);

        if line_count >= lines_per_chunk
            && token_count >= tokens_per_chunk
            && (ch == '\n' || is_yield_later(ch))
        {
            flush(&mut buf, &mut line_count, &mut token_count, &mut prev_chunk);
        }
        i += 1;
    }

    if !buf.is_empty() {
        match prev_chunk.take() {
            Some(mut pending) => {
                pending.push_str(&buf);
                out.push(pending);
            }
            None => out.push(buf),
        }
    } else if let Some(pending) = prev_chunk.take() {
        out.push(pending);
    }

    out
}

/// Rough per-character token estimate: one token per ASCII character, two for
/// wide (multi-byte) characters. Mirrors incremental per-character counting,
/// which keeps the scan O(n) and fully deterministic.
pub fn token_cost(ch: char) -> usize {
    if ch.is_ascii() {
        1
    } else {
        ch.len_utf8().div_ceil(2)
    }
}

/// Token estimate for a whole string, used for chunk annotations.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().map(token_cost).sum()
}

fn is_yield_later(ch: char) -> bool {
    YIELD_LATER_CHARS.contains(ch)
}

fn flush(
    buf: &mut String,
    line_count: &mut usize,
    token_count: &mut usize,
    prev_chunk: &mut Option<String>,
) {
    if !buf.is_empty() {
        *prev_chunk = Some(std::mem::take(buf));
        *line_count = 0;
        *token_count = 0;
    }
}
