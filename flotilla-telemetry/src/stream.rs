//! JSON-lines agent event parsing.
//!
//! One event per line. Blank lines and `#` comments are allowed so captured
//! streams can be annotated by hand. Malformed lines are collected, not
//! fatal: one bad agent must not poison the whole batch.

use anyhow::{Context, Result};
use flotilla_core::agent::AgentEvent;

/// Result of parsing a whole stream: good events in order, plus per-line
/// diagnostics for everything that was skipped.
#[derive(Debug, Default)]
pub struct ParsedStream {
    pub events: Vec<AgentEvent>,
    /// (1-based line number, reason).
    pub skipped: Vec<(usize, String)>,
}

impl ParsedStream {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Parse a single JSON line into a validated event.
pub fn parse_line(line: &str) -> Result<AgentEvent> {
    let event: AgentEvent =
        serde_json::from_str(line).with_context(|| format!("malformed event: {line}"))?;
    event.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(event)
}

/// Parse a JSON-lines buffer.
pub fn parse_stream(input: &str) -> ParsedStream {
    let mut parsed = ParsedStream::default();
    for (idx, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Ok(event) => parsed.events.push(event),
            Err(err) => parsed.skipped.push((idx + 1, format!("{err:#}"))),
        }
    }
    parsed
}
