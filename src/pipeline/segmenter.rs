//! Progressive sentence segmentation for streamed reply text.
//!
//! Reply text arrives in arbitrary chunks. Complete sentences are released as
//! soon as their terminator arrives so synthesis can start before the whole
//! reply is known; the trailing fragment waits for more text or for the
//! stream to complete.

/// Whether `c` ends a sentence.
fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\u{3002}' | '\u{FF01}' | '\u{FF1F}' | '\n')
}

/// Byte index just past the last sentence terminator in `text`, if any.
///
/// Runs of terminators (`"?!"`, `"..."`) stay with their sentence.
fn last_boundary(text: &str) -> Option<usize> {
    text.char_indices()
        .filter(|(_, c)| is_terminator(*c))
        .last()
        .map(|(i, c)| i + c.len_utf8())
}

/// Split `text` into trimmed, non-empty sentences, keeping terminators.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !is_terminator(c) {
            continue;
        }
        // Absorb consecutive terminators into the same sentence.
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if is_terminator(next) {
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        push_trimmed(&mut out, &text[start..end]);
        start = end;
    }
    push_trimmed(&mut out, &text[start..]);
    out
}

fn push_trimmed(out: &mut Vec<String>, piece: &str) {
    let trimmed = piece.trim();
    // A lone terminator (e.g. a blank line) carries nothing to say.
    if !trimmed.is_empty() && !trimmed.chars().all(is_terminator) {
        out.push(trimmed.to_owned());
    }
}

/// Accumulates reply text and releases speakable sentences.
#[derive(Debug, Default, Clone)]
pub struct SentenceSegmenter {
    pending: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every sentence that is now complete.
    ///
    /// With `complete = true` the remaining fragment is released too, even
    /// without terminal punctuation, and the buffer is left empty.
    pub fn push(&mut self, chunk: &str, complete: bool) -> Vec<String> {
        self.pending.push_str(chunk);

        if complete {
            let all = std::mem::take(&mut self.pending);
            return split_sentences(&all);
        }

        match last_boundary(&self.pending) {
            Some(end) => {
                let rest = self.pending.split_off(end);
                let done = std::mem::replace(&mut self.pending, rest);
                split_sentences(&done)
            }
            None => Vec::new(),
        }
    }

    /// Text buffered but not yet released.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Drop buffered text (barge-in, stop, session end).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
