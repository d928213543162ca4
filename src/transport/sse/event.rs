//! Incremental Server-Sent Events decoder.
//!
//! Implements the field rules the MCP binding relies on: `event:`, `id:`,
//! and `data:` prefixes, comment lines starting with `:`, multi-line data
//! joined with `\n`, and blank-line event delimiting. The event type
//! defaults to `message` when no `event:` field is present.

/// A decoded Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Feed raw bytes in, take complete events out.
///
/// The parser buffers partial lines across [`push`](SseParser::push) calls so
/// it can sit directly on a chunked HTTP body stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of the stream, returning every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if let Some(event) = self.take_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(rest) = strip_field(line, "data:") {
            self.data_lines.push(rest.to_string());
        } else if let Some(rest) = strip_field(line, "event:") {
            self.event = Some(rest.to_string());
        } else if let Some(rest) = strip_field(line, "id:") {
            self.id = Some(rest.to_string());
        }
        // Unknown fields are ignored per the SSE specification.
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            id: self.id.take(),
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        };
        Some(event)
    }
}

fn strip_field<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(prefix)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
