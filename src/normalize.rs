//! Streaming terminal-output normalization
//!
//! Test runners decorate their output with ANSI color codes, OSC title
//! updates, and carriage-return progress rewrites. The normalizer strips
//! all of that while preserving line structure, and it tolerates escape
//! sequences that arrive split across read chunks: a trailing partial
//! escape is buffered and completed on the next `feed` call instead of
//! leaking mangled bytes into the capture.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Longest unterminated escape we are willing to buffer between chunks.
/// Anything past this is treated as plain output rather than swallowed.
const MAX_PENDING: usize = 512;

/// Incremental normalizer. Use one instance per stream: stdout and stderr
/// carry independent escape state.
#[derive(Debug, Default)]
pub struct OutputNormalizer {
    pending: String,
}

impl OutputNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize the next chunk, returning the text that is safe to emit.
    /// A partial escape at the end of the chunk is held back until the
    /// next call completes it.
    pub fn feed(&mut self, chunk: &str) -> String {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);

        let mut out = String::with_capacity(text.len());
        let mut start = 0;
        loop {
            let partial = strip_controls(&text[start..], &mut out);
            match partial {
                None => break,
                Some(offset) => {
                    let tail = &text[start + offset..];
                    if tail.len() <= MAX_PENDING {
                        self.pending = tail.to_string();
                        break;
                    }
                    // Runaway unterminated sequence. Emit its payload as
                    // plain text minus the introducer so real output is
                    // never lost, then keep scanning.
                    start += offset + introducer_len(tail.as_bytes());
                }
            }
        }
        out
    }

    /// Finish the stream. An escape left unterminated at end-of-stream is
    /// control noise and is dropped.
    pub fn flush(&mut self) -> String {
        self.pending.clear();
        String::new()
    }

    /// One-shot normalization of a complete text.
    pub fn normalize(text: &str) -> String {
        let mut normalizer = Self::new();
        let mut out = normalizer.feed(text);
        out.push_str(&normalizer.flush());
        out
    }
}

/// Copy `text` into `out` with control sequences and carriage returns
/// removed. Returns `Some(offset)` if an escape sequence starts at
/// `offset` but is not terminated within `text`.
fn strip_controls(text: &str, out: &mut String) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            ESC => match escape_len(&bytes[i..]) {
                Some(len) => i += len,
                None => return Some(i),
            },
            b'\r' => i += 1,
            _ => {
                let start = i;
                while i < bytes.len() && bytes[i] != ESC && bytes[i] != b'\r' {
                    i += 1;
                }
                out.push_str(&text[start..i]);
            }
        }
    }
    None
}

/// Length of the escape sequence starting at `bytes[0] == ESC`, or `None`
/// if the sequence is not terminated within `bytes`.
fn escape_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 2 {
        return None;
    }
    match bytes[1] {
        // CSI: ESC [ <params 0x30-0x3f> <intermediates 0x20-0x2f> <final 0x40-0x7e>
        b'[' => {
            let mut i = 2;
            while i < bytes.len() {
                match bytes[i] {
                    0x40..=0x7e => return Some(i + 1),
                    0x20..=0x3f => i += 1,
                    // Malformed: a byte that can't belong to a CSI
                    // sequence. Stop stripping here so it is kept.
                    _ => return Some(i),
                }
            }
            None
        }
        // OSC: ESC ] ... terminated by BEL or ST (ESC \)
        b']' => {
            let mut i = 2;
            while i < bytes.len() {
                match bytes[i] {
                    BEL => return Some(i + 1),
                    ESC => {
                        if i + 1 < bytes.len() {
                            return if bytes[i + 1] == b'\\' {
                                Some(i + 2)
                            } else {
                                // A new escape begins; the OSC was never
                                // terminated. End it here.
                                Some(i)
                            };
                        }
                        return None;
                    }
                    _ => i += 1,
                }
            }
            None
        }
        // ESC + intermediates (e.g. charset selection ESC ( B)
        0x20..=0x2f => {
            let mut i = 2;
            while i < bytes.len() {
                match bytes[i] {
                    0x20..=0x2f => i += 1,
                    _ => return Some(i + 1),
                }
            }
            None
        }
        // Two-byte sequences: ESC M, ESC 7, ESC =, ...
        _ => Some(2),
    }
}

/// Bytes consumed by the escape introducer (`ESC` plus `[`/`]` if present).
fn introducer_len(bytes: &[u8]) -> usize {
    match bytes.get(1) {
        Some(b'[') | Some(b']') => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_color_codes() {
        let out = OutputNormalizer::normalize("\x1b[31mFAIL\x1b[0m suite.spec");
        assert_eq!(out, "FAIL suite.spec");
    }

    #[test]
    fn test_escape_split_across_two_feeds() {
        let mut n = OutputNormalizer::new();
        let mut out = n.feed("\x1b[31mFAIL\x1b");
        out.push_str(&n.feed("[0m suite.spec"));
        out.push_str(&n.flush());
        assert_eq!(out, "FAIL suite.spec");
    }

    #[test]
    fn test_split_matches_unsplit() {
        let raw = "\x1b[1;32m✓\x1b[0m passed\r\n\x1b]0;title\x07next line\n";
        let whole = OutputNormalizer::normalize(raw);
        for split_at in (0..raw.len()).filter(|i| raw.is_char_boundary(*i)) {
            let mut n = OutputNormalizer::new();
            let mut out = n.feed(&raw[..split_at]);
            out.push_str(&n.feed(&raw[split_at..]));
            out.push_str(&n.flush());
            assert_eq!(out, whole, "split at byte {}", split_at);
        }
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let raw = "\x1b[33mwarn\x1b[0m: slow test\r\nplain ✓ line\n";
        let once = OutputNormalizer::normalize(raw);
        let twice = OutputNormalizer::normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_carriage_returns_removed_lines_kept() {
        let out = OutputNormalizer::normalize("a\r\nb\rc\r\n");
        assert_eq!(out, "a\nbc\n");
    }

    #[test]
    fn test_osc_with_st_terminator() {
        let out = OutputNormalizer::normalize("\x1b]2;my title\x1b\\after");
        assert_eq!(out, "after");
    }

    #[test]
    fn test_unterminated_escape_dropped_at_flush() {
        let mut n = OutputNormalizer::new();
        let mut out = n.feed("done\x1b[3");
        out.push_str(&n.flush());
        assert_eq!(out, "done");
    }

    #[test]
    fn test_runaway_osc_is_not_swallowed() {
        let mut n = OutputNormalizer::new();
        let payload = "x".repeat(MAX_PENDING + 100);
        let out = n.feed(&format!("\x1b]{}", payload));
        // Payload preserved as plain text rather than buffered forever.
        assert!(out.contains(&payload));
    }

    #[test]
    fn test_lone_escape_then_plain_text() {
        let mut n = OutputNormalizer::new();
        let mut out = n.feed("tail\x1b");
        // ESC M is a complete two-byte sequence; "ore" is plain text.
        out.push_str(&n.feed("More"));
        out.push_str(&n.flush());
        assert_eq!(out, "tailore");
    }
}
