//! Reasoning redaction for streamed model output.
//!
//! Some models interleave `<think>...</think>` segments with their answer.
//! [`ThinkRedactor`] removes them from a chunked stream as it arrives, even
//! when a tag is split across chunks. It holds back the last few visible
//! characters of every call, because they might be the start of a tag.
//! [`collapse_think_blocks`] is the whole-string variant.

pub const OPEN_TAG: &str = "<think>";
pub const CLOSE_TAG: &str = "</think>";

/// Output of one [`ThinkRedactor::process`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redacted {
    /// Text that is safe to show now
    pub visible: String,
    /// Any tag or reasoning content was seen during this call
    pub saw_reasoning: bool,
}

/// Forward-only filter that strips reasoning segments from a stream.
#[derive(Debug, Clone)]
pub struct ThinkRedactor {
    inside_block: bool,
    pending_prefix: String,
    /// Visible text that preceded a still-open block
    held_visible: String,
    boundary_width: usize,
}

impl Default for ThinkRedactor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkRedactor {
    pub fn new() -> Self {
        Self {
            inside_block: false,
            pending_prefix: String::new(),
            held_visible: String::new(),
            boundary_width: OPEN_TAG.len().max(CLOSE_TAG.len()) - 1,
        }
    }

    /// Characters withheld at the end of every call.
    pub fn boundary_width(&self) -> usize {
        self.boundary_width
    }

    pub fn is_inside_block(&self) -> bool {
        self.inside_block
    }

    /// Feed the next chunk.
    ///
    /// While a block is open nothing is released. A close tag without a
    /// matching open tag is dropped, and so is everything before it in the
    /// current buffer.
    ///
    /// Unlike a plain "emit nothing, clear the withheld tail" rule, an open
    /// block does not lose state across calls: the last `boundary_width`
    /// characters are kept so a `</think>` split between chunks still
    /// closes the block, and visible text seen before the block opened is
    /// held and released once it closes. `"Answer: <think>pondering"`
    /// followed by `" still</think> 42"` yields `"Answer:  42"`, not `" 42"`.
    pub fn process(&mut self, chunk: &str) -> Redacted {
        let mut combined = std::mem::take(&mut self.pending_prefix);
        combined.push_str(chunk);
        let mut visible = std::mem::take(&mut self.held_visible);

        if combined.is_empty() && visible.is_empty() {
            return Redacted::default();
        }

        let mut saw_reasoning = false;
        let mut pos = 0;

        while pos < combined.len() {
            let rest = &combined[pos..];

            if self.inside_block {
                saw_reasoning = true;
                match rest.find(CLOSE_TAG) {
                    Some(close) => {
                        pos += close + CLOSE_TAG.len();
                        self.inside_block = false;
                    }
                    None => {
                        // Keep a tail that may hold the start of the close tag.
                        self.pending_prefix = tail_chars(rest, self.boundary_width).to_string();
                        self.held_visible = visible;
                        return Redacted {
                            visible: String::new(),
                            saw_reasoning,
                        };
                    }
                }
                continue;
            }

            let open = rest.find(OPEN_TAG);
            let close = rest.find(CLOSE_TAG);
            let dangling_close = match (open, close) {
                (_, None) => None,
                (None, Some(c)) => Some(c),
                (Some(o), Some(c)) => (c < o).then_some(c),
            };

            if let Some(c) = dangling_close {
                saw_reasoning = true;
                pos += c + CLOSE_TAG.len();
            } else if let Some(o) = open {
                visible.push_str(&rest[..o]);
                saw_reasoning = true;
                pos += o + OPEN_TAG.len();
                self.inside_block = true;
            } else {
                visible.push_str(rest);
                break;
            }
        }

        if self.inside_block {
            // Buffer ended right after an open tag.
            self.held_visible = visible;
            return Redacted {
                visible: String::new(),
                saw_reasoning,
            };
        }

        let keep = tail_chars(&visible, self.boundary_width).len();
        let split = visible.len() - keep;
        self.pending_prefix = visible.split_off(split);
        Redacted {
            visible,
            saw_reasoning,
        }
    }

    /// End of stream: release whatever was withheld.
    ///
    /// Returns `""` when the stream ended inside an unterminated block, so
    /// partial reasoning is never shown.
    pub fn flush(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending_prefix);
        let held = std::mem::take(&mut self.held_visible);
        if self.inside_block { String::new() } else { held + &pending }
    }
}

/// The last `n` characters of `text` (all of it if shorter).
fn tail_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Remove every complete `<think>...</think>` segment from `text`.
///
/// Repeats until nothing changes, so the result never contains a complete
/// segment. Unmatched tags are left alone. Returns whether anything was
/// removed.
pub fn collapse_think_blocks(text: &str) -> (String, bool) {
    let mut current = text.to_string();
    let mut changed = false;
    loop {
        let (next, removed) = strip_complete_blocks(&current);
        if !removed {
            return (current, changed);
        }
        changed = true;
        current = next;
    }
}

fn strip_complete_blocks(text: &str) -> (String, bool) {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut removed = false;

    while let Some(open) = rest.find(OPEN_TAG) {
        let after_open = &rest[open + OPEN_TAG.len()..];
        let Some(close) = after_open.find(CLOSE_TAG) else {
            break;
        };
        out.push_str(&rest[..open]);
        rest = &after_open[close + CLOSE_TAG.len()..];
        removed = true;
    }
    out.push_str(rest);
    (out, removed)
}
