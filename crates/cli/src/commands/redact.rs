//! `replychain redact`: strip reasoning blocks from stdin.
//!
//! By default each input line is fed to a [`ThinkRedactor`] as one chunk and
//! visible text is written as soon as it is safe. With `--collapse` the whole
//! input is read first and collapsed in one go.

use std::io::{BufRead, Read, Write};

use replychain_agent::{ThinkRedactor, collapse_think_blocks};
use tracing::debug;

pub fn run(collapse: bool) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let saw_reasoning = if collapse {
        collapse_stream(stdin.lock(), stdout.lock())?
    } else {
        redact_stream(stdin.lock(), stdout.lock())?
    };
    debug!(saw_reasoning, "Redaction finished");
    Ok(())
}

/// Stream `input` line by line through a redactor. Returns whether any
/// reasoning markup was seen.
pub fn redact_stream(mut input: impl BufRead, mut output: impl Write) -> std::io::Result<bool> {
    let mut redactor = ThinkRedactor::new();
    let mut saw_reasoning = false;
    let mut line = String::new();

    while input.read_line(&mut line)? > 0 {
        let redacted = redactor.process(&line);
        saw_reasoning |= redacted.saw_reasoning;
        output.write_all(redacted.visible.as_bytes())?;
        output.flush()?;
        line.clear();
    }

    output.write_all(redactor.flush().as_bytes())?;
    output.flush()?;
    Ok(saw_reasoning)
}

pub fn collapse_stream(mut input: impl Read, mut output: impl Write) -> std::io::Result<bool> {
    let mut text = String::new();
    input.read_to_string(&mut text)?;
    let (stripped, changed) = collapse_think_blocks(&text);
    output.write_all(stripped.as_bytes())?;
    output.flush()?;
    Ok(changed)
}
