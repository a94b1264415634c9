//! flotilla-telemetry: node-agent event ingestion.
//!
//! Agents emit JSON-lines event streams (`flotilla_core::agent::AgentEvent`
//! wire shape). This crate parses and validates those streams so the
//! orchestrator only ever sees well-formed events.

pub mod stream;

pub use stream::{parse_line, parse_stream, ParsedStream};
